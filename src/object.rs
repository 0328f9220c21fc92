//! Pooled, reference-counted shared objects.
//!
//! An [`ObjectPool`] hands out fixed-size objects from the main pool. Each
//! object starts in [`ObjectState::Init`] with one reference, becomes
//! visible to [`ObjectPool::get`] and [`ObjectPool::enumerate`] once
//! activated, and is destroyed when its last reference is dropped.
//!
//! # Lifecycle
//!
//! ```text
//! new_object ──► Init ──activate──► Active
//!                  │                  │
//!                  └──── unref to 0 ──┴──► Zombie ──destructor──► Destroyed
//! ```
//!
//! State and reference count share one 64-bit word, so a lookup that adds a
//! reference and an unref that reaches zero can never both succeed.

use crate::call;
use crate::error::{Error, Result};
use crate::memory::{AtomicShmPtr, FixedName, Plain, ShmPtr};
use crate::observability;
use crate::reactor::{ReactionId, ReactionResult, Reactor};
use crate::skirmish::{Skirmish, SkirmishShared};
use crate::world::{FusionId, World};
use crate::FusionCall;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const POOL_MAGIC: u64 = 0x4655_534F_424A_5031; // "FUSOBJP1"
const OBJECT_MAGIC: u32 = 0x4F42_4A31; // "OBJ1"
/// Written over the magic of a destroyed object, so stale handles are
/// recognised instead of asserting.
const OBJECT_DEAD: u32 = 0x4445_4144; // "DEAD"

const INITIAL_TABLE: u32 = 16;
const FIELD_PREFIX: &str = "obj:";

/// Lifecycle state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ObjectState {
    /// Created, not yet visible to lookups.
    Init = 0,
    /// Visible to lookups and enumeration.
    Active = 1,
    /// Last reference dropped; the destructor is running.
    Zombie = 2,
    /// Gone.
    Destroyed = 3,
}

impl ObjectState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ObjectState::Init,
            1 => ObjectState::Active,
            2 => ObjectState::Zombie,
            _ => ObjectState::Destroyed,
        }
    }
}

#[inline]
fn pack(state: ObjectState, refs: u32) -> u64 {
    ((state as u64) << 32) | refs as u64
}

#[inline]
fn unpack(word: u64) -> (ObjectState, u32) {
    (ObjectState::from_raw((word >> 32) as u32), word as u32)
}

#[repr(C)]
struct ObjectPoolShared {
    magic: AtomicU64,
    object_size: AtomicU64,
    notification_size: AtomicU64,
    next_id: AtomicU32,
    destroyed: AtomicU32,
    /// Array of raw `ShmPtr`s in creation (and therefore id) order.
    table: AtomicShmPtr,
    table_cap: AtomicU32,
    table_len: AtomicU32,
    live: AtomicU32,
    _reserved: AtomicU32,
    name: FixedName,
    lock: SkirmishShared,
}

#[repr(C)]
struct ObjectHeader {
    magic: AtomicU32,
    id: AtomicU32,
    state_refs: AtomicU64,
    pool: AtomicShmPtr,
    reactor: AtomicShmPtr,
    call: AtomicShmPtr,
    creator: AtomicU32,
    _reserved: AtomicU32,
    data_len: AtomicU64,
}

const OBJECT_HEADER: u64 = ((std::mem::size_of::<ObjectHeader>() + 15) & !15) as u64;

/// Called once per object when it is destroyed: with `zombie = false` after
/// the last unref, `zombie = true` when the pool is destroyed underneath it.
pub type Destructor = Arc<dyn Fn(&Object, bool) + Send + Sync>;

struct PoolHandle {
    world: World,
    ptr: ShmPtr,
    name: String,
    lock: Skirmish,
    destructor: Destructor,
}

/// Factory and registry for one type of shared object.
///
/// # Example
///
/// ```rust
/// use fusion::{ObjectPool, ObjectState, World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let pool = ObjectPool::create(&world, "windows", 64, 16, |_, _| {}).unwrap();
///
/// let window = pool.new_object().unwrap();
/// window.activate().unwrap();
/// assert_eq!(window.state().unwrap(), ObjectState::Active);
/// window.unref().unwrap();
/// ```
#[derive(Clone)]
pub struct ObjectPool {
    inner: Arc<PoolHandle>,
}

impl ObjectPool {
    /// Create a pool of objects with `object_size` payload bytes and
    /// notifications of up to `notification_size` bytes.
    pub fn create(
        world: &World,
        name: &str,
        object_size: usize,
        notification_size: usize,
        destructor: impl Fn(&Object, bool) + Send + Sync + 'static,
    ) -> Result<ObjectPool> {
        let field = format!("{}{}", FIELD_PREFIX, name);
        let (ptr, created) = world.field_or_init(&field, || Self::format(world, name, object_size, notification_size))?;
        if !created {
            return Err(Error::InvalidArgument(format!("object pool {:?} already exists", name)));
        }
        tracing::debug!(pool = name, object_size, notification_size, "created object pool");
        Self::handle(world, ptr, Arc::new(destructor))
    }

    fn format(world: &World, name: &str, object_size: usize, notification_size: usize) -> Result<ShmPtr> {
        let ptr = world.alloc(std::mem::size_of::<ObjectPoolShared>())?;
        let table = match world.alloc(INITIAL_TABLE as usize * 8) {
            Ok(table) => table,
            Err(e) => {
                let _ = world.free(ptr);
                return Err(e);
            }
        };
        // SAFETY: zeroed allocation of the right size.
        let shared = unsafe { world.shared::<ObjectPoolShared>(ptr)? };
        let init = shared.name.store(name).and_then(|()| shared.lock.init(name));
        if let Err(e) = init {
            let _ = world.free(table);
            let _ = world.free(ptr);
            return Err(e);
        }
        shared.object_size.store(object_size as u64, Ordering::Relaxed);
        shared.notification_size.store(notification_size as u64, Ordering::Relaxed);
        shared.next_id.store(1, Ordering::Relaxed);
        shared.table.store(table);
        shared.table_cap.store(INITIAL_TABLE, Ordering::Relaxed);
        shared.magic.store(POOL_MAGIC, Ordering::Release);
        Ok(ptr)
    }

    /// Attach to a pool created by any member.
    pub fn open(
        world: &World,
        name: &str,
        destructor: impl Fn(&Object, bool) + Send + Sync + 'static,
    ) -> Result<ObjectPool> {
        let ptr = world.field(&format!("{}{}", FIELD_PREFIX, name))?;
        Self::handle(world, ptr, Arc::new(destructor))
    }

    fn handle(world: &World, ptr: ShmPtr, destructor: Destructor) -> Result<ObjectPool> {
        // SAFETY: checked for the pool magic before use.
        let shared = unsafe { world.shared::<ObjectPoolShared>(ptr)? };
        if shared.magic.load(Ordering::Acquire) != POOL_MAGIC {
            return Err(Error::InvalidSegment(format!("{:?} is not an object pool", ptr)));
        }
        let lock_offset = std::mem::offset_of!(ObjectPoolShared, lock) as u64;
        Ok(ObjectPool {
            inner: Arc::new(PoolHandle {
                world: world.clone(),
                ptr,
                name: shared.name.load(),
                lock: Skirmish::embedded(world, ptr.add(lock_offset)),
                destructor,
            }),
        })
    }

    fn shared(&self) -> Result<&ObjectPoolShared> {
        // SAFETY: checked for the pool magic below.
        let shared = unsafe { self.inner.world.shared::<ObjectPoolShared>(self.inner.ptr)? };
        if shared.magic.load(Ordering::Acquire) != POOL_MAGIC {
            return Err(Error::Destroyed);
        }
        Ok(shared)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Shared pointer of the pool.
    pub fn ptr(&self) -> ShmPtr {
        self.inner.ptr
    }

    /// The World the pool lives in.
    pub fn world(&self) -> &World {
        &self.inner.world
    }

    /// The pool lock; object payloads are guarded by it.
    pub fn lock(&self) -> &Skirmish {
        &self.inner.lock
    }

    /// Payload size of each object.
    pub fn object_size(&self) -> Result<usize> {
        Ok(self.shared()?.object_size.load(Ordering::Relaxed) as usize)
    }

    /// Maximum notification size of each object's reactor.
    pub fn notification_size(&self) -> Result<usize> {
        Ok(self.shared()?.notification_size.load(Ordering::Relaxed) as usize)
    }

    /// Number of objects not yet destroyed.
    pub fn len(&self) -> Result<usize> {
        Ok(self.shared()?.live.load(Ordering::Relaxed) as usize)
    }

    /// Whether the pool has no live objects.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn table<'a>(&self, shared: &'a ObjectPoolShared) -> Result<&'a [AtomicU64]> {
        let cap = shared.table_cap.load(Ordering::Relaxed) as usize;
        let raw = self.inner.world.bytes(shared.table.load(), cap * 8)?;
        // SAFETY: the table is an 8-aligned allocation of `cap` words that
        // is only resized under the pool lock, which the caller holds.
        Ok(unsafe { std::slice::from_raw_parts(raw as *const AtomicU64, cap) })
    }

    /// Snapshot of `(ptr, id)` of every object, in id order. Caller holds
    /// the pool lock.
    fn entries(&self, shared: &ObjectPoolShared) -> Result<Vec<(ShmPtr, u32)>> {
        let len = shared.table_len.load(Ordering::Relaxed) as usize;
        let table = self.table(shared)?;
        table[..len]
            .iter()
            .map(|slot| {
                let ptr = ShmPtr::from_raw(slot.load(Ordering::Relaxed));
                let header = self.object_header(ptr)?;
                Ok((ptr, header.id.load(Ordering::Relaxed)))
            })
            .collect()
    }

    fn object_header(&self, ptr: ShmPtr) -> Result<&ObjectHeader> {
        // SAFETY: only pointers from the object table or from handles that
        // were validated against the object magic reach this point.
        unsafe { self.inner.world.shared::<ObjectHeader>(ptr) }
    }

    fn table_push(&self, shared: &ObjectPoolShared, ptr: ShmPtr) -> Result<()> {
        let len = shared.table_len.load(Ordering::Relaxed);
        let cap = shared.table_cap.load(Ordering::Relaxed);
        if len == cap {
            let grown = cap
                .checked_mul(2)
                .ok_or_else(|| Error::LimitExceeded("object table full".into()))?;
            let table = self
                .inner
                .world
                .pool(shared.table.load().pool())?
                .reallocate(shared.table.load(), grown as usize * 8)?;
            shared.table.store(table);
            shared.table_cap.store(grown, Ordering::Relaxed);
        }
        self.table(shared)?[len as usize].store(ptr.to_raw(), Ordering::Relaxed);
        shared.table_len.store(len + 1, Ordering::Relaxed);
        Ok(())
    }

    fn table_remove(&self, shared: &ObjectPoolShared, ptr: ShmPtr) -> Result<()> {
        let len = shared.table_len.load(Ordering::Relaxed) as usize;
        let table = self.table(shared)?;
        let Some(pos) = table[..len]
            .iter()
            .position(|slot| slot.load(Ordering::Relaxed) == ptr.to_raw())
        else {
            return Ok(());
        };
        for i in pos..len - 1 {
            table[i].store(table[i + 1].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        table[len - 1].store(0, Ordering::Relaxed);
        shared.table_len.store(len as u32 - 1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a zeroed object with one reference, in [`ObjectState::Init`].
    pub fn new_object(&self) -> Result<Object> {
        let shared = self.shared()?;
        let world = &self.inner.world;
        let _guard = self.inner.lock.guard()?;
        if shared.destroyed.load(Ordering::Relaxed) != 0 {
            return Err(Error::Destroyed);
        }

        let object_size = shared.object_size.load(Ordering::Relaxed);
        let ptr = world.alloc((OBJECT_HEADER + object_size) as usize)?;
        let reactor = match Reactor::new(world, shared.notification_size.load(Ordering::Relaxed) as usize) {
            Ok(reactor) => reactor,
            Err(e) => {
                let _ = world.free(ptr);
                return Err(e);
            }
        };
        if let Err(e) = self.table_push(shared, ptr) {
            let _ = reactor.destroy();
            let _ = world.free(ptr);
            return Err(e);
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let header = self.object_header(ptr)?;
        header.id.store(id, Ordering::Relaxed);
        header.state_refs.store(pack(ObjectState::Init, 1), Ordering::Relaxed);
        header.pool.store(self.inner.ptr);
        header.reactor.store(reactor.ptr());
        header.creator.store(world.fusion_id().0, Ordering::Relaxed);
        header.data_len.store(object_size, Ordering::Relaxed);
        header.magic.store(OBJECT_MAGIC, Ordering::Release);

        let live = shared.live.fetch_add(1, Ordering::Relaxed) + 1;
        observability::record_objects_live(&self.inner.name, live as usize);
        tracing::trace!(pool = %self.inner.name, id, "new object");

        Ok(Object {
            pool: self.clone(),
            ptr,
            id,
        })
    }

    /// Look up an object by id and add a reference to it.
    ///
    /// Fails [`Error::Dead`] if the object is being or has been destroyed,
    /// [`Error::IdNotFound`] if the id was never issued or the object has not
    /// been activated yet.
    pub fn get(&self, id: u32) -> Result<Object> {
        let shared = self.shared()?;
        let _guard = self.inner.lock.guard()?;

        if id == 0 || id >= shared.next_id.load(Ordering::Relaxed) {
            return Err(Error::IdNotFound(id));
        }
        let entries = self.entries(shared)?;
        let pos = entries.partition_point(|(_, entry)| *entry < id);
        let Some(&(ptr, found)) = entries.get(pos) else {
            return Err(Error::Dead);
        };
        if found != id {
            return Err(Error::Dead);
        }

        let object = Object {
            pool: self.clone(),
            ptr,
            id,
        };
        // Not visible until activated.
        if object.state()? == ObjectState::Init {
            return Err(Error::IdNotFound(id));
        }
        object.add_ref()?;
        Ok(object)
    }

    /// Resolve an object handed over as a shared pointer, without adding a
    /// reference.
    pub fn object_at(&self, ptr: ShmPtr) -> Result<Object> {
        let header = self.object_header(ptr)?;
        if header.magic.load(Ordering::Acquire) != OBJECT_MAGIC || header.pool.load() != self.inner.ptr {
            return Err(Error::Dead);
        }
        Ok(Object {
            pool: self.clone(),
            ptr,
            id: header.id.load(Ordering::Relaxed),
        })
    }

    /// Call `callback` for every active object, in id order, until it
    /// returns false. Runs under the pool lock.
    pub fn enumerate(&self, mut callback: impl FnMut(&Object) -> bool) -> Result<()> {
        let shared = self.shared()?;
        let _guard = self.inner.lock.guard()?;
        for (ptr, id) in self.entries(shared)? {
            let object = Object {
                pool: self.clone(),
                ptr,
                id,
            };
            // The callback may have destroyed later entries.
            if object.state().ok() != Some(ObjectState::Active) {
                continue;
            }
            if !callback(&object) {
                break;
            }
        }
        Ok(())
    }

    /// Destroy the pool. Objects still alive are destroyed as zombies.
    pub fn destroy(&self) -> Result<()> {
        let shared = self.shared()?;
        let leftovers = {
            let _guard = self.inner.lock.guard()?;
            if shared.destroyed.swap(1, Ordering::AcqRel) != 0 {
                return Err(Error::Destroyed);
            }
            self.entries(shared)?
        };

        for (ptr, id) in leftovers {
            let object = Object {
                pool: self.clone(),
                ptr,
                id,
            };
            let Ok(header) = object.header() else { continue };
            let (state, refs) = unpack(header.state_refs.swap(pack(ObjectState::Zombie, 0), Ordering::AcqRel));
            if state >= ObjectState::Zombie {
                continue;
            }
            observability::trace_zombie(&self.inner.name, id, refs);
            if let Err(e) = object.finalize(true) {
                tracing::warn!(pool = %self.inner.name, id, error = %e, "zombie cleanup failed");
            }
        }

        let world = &self.inner.world;
        let table = shared.table.swap(ShmPtr::NULL);
        world.free(table)?;
        match world.clear_field(&format!("{}{}", FIELD_PREFIX, self.inner.name)) {
            Ok(()) | Err(Error::ItemNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.inner.lock.destroy()?;
        shared.magic.store(0, Ordering::Release);
        world.free(self.inner.ptr)?;
        tracing::debug!(pool = %self.inner.name, "destroyed object pool");
        Ok(())
    }
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("ptr", &self.inner.ptr)
            .finish()
    }
}

/// Handle on one shared object.
///
/// Handles do not own references: [`add_ref`](Object::add_ref) and
/// [`unref`](Object::unref) manage the distributed count explicitly.
#[derive(Clone)]
pub struct Object {
    pool: ObjectPool,
    ptr: ShmPtr,
    id: u32,
}

impl Object {
    fn header(&self) -> Result<&ObjectHeader> {
        let header = self.pool.object_header(self.ptr)?;
        match header.magic.load(Ordering::Acquire) {
            OBJECT_MAGIC if header.id.load(Ordering::Relaxed) == self.id => Ok(header),
            OBJECT_MAGIC | OBJECT_DEAD => Err(Error::Dead),
            other => {
                debug_assert!(false, "stale object handle {:?}: magic {:#x}", self.ptr, other);
                Err(Error::Dead)
            }
        }
    }

    /// Pool-unique id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// The pool this object belongs to.
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<ObjectState> {
        Ok(unpack(self.header()?.state_refs.load(Ordering::Acquire)).0)
    }

    /// Current reference count.
    pub fn refs(&self) -> Result<u32> {
        Ok(unpack(self.header()?.state_refs.load(Ordering::Acquire)).1)
    }

    /// The member that created the object.
    pub fn creator(&self) -> Result<FusionId> {
        Ok(FusionId(self.header()?.creator.load(Ordering::Relaxed)))
    }

    /// Make the object visible to lookups.
    pub fn activate(&self) -> Result<()> {
        let header = self.header()?;
        let mut current = header.state_refs.load(Ordering::Acquire);
        loop {
            let (state, refs) = unpack(current);
            match state {
                ObjectState::Init => {}
                ObjectState::Active => {
                    return Err(Error::InvalidArgument(format!("object {} already active", self.id)));
                }
                _ => return Err(Error::Dead),
            }
            match header.state_refs.compare_exchange_weak(
                current,
                pack(ObjectState::Active, refs),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Add a reference. Fails [`Error::Dead`] once the object is a zombie.
    pub fn add_ref(&self) -> Result<()> {
        let header = self.header()?;
        let mut current = header.state_refs.load(Ordering::Acquire);
        loop {
            let (state, refs) = unpack(current);
            if state >= ObjectState::Zombie {
                return Err(Error::Dead);
            }
            let refs = refs
                .checked_add(1)
                .ok_or_else(|| Error::LimitExceeded("reference count overflow".into()))?;
            match header.state_refs.compare_exchange_weak(
                current,
                pack(state, refs),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. The last one destroys the object, running the
    /// pool's destructor exactly once.
    pub fn unref(&self) -> Result<()> {
        let header = self.header()?;
        let mut current = header.state_refs.load(Ordering::Acquire);
        loop {
            let (state, refs) = unpack(current);
            if state >= ObjectState::Zombie || refs == 0 {
                return Err(Error::Dead);
            }
            let next = if refs == 1 {
                pack(ObjectState::Zombie, 0)
            } else {
                pack(state, refs - 1)
            };
            match header.state_refs.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if unpack(current).1 == 1 {
            self.finalize(false)?;
        }
        Ok(())
    }

    /// Run the destructor and free the object. The state is already Zombie.
    fn finalize(&self, zombie: bool) -> Result<()> {
        (self.pool.inner.destructor)(self, zombie);

        let pool = &self.pool;
        let world = &pool.inner.world;
        let shared = pool.shared()?;
        let header = self.header()?;
        let _guard = pool.inner.lock.guard()?;

        pool.table_remove(shared, self.ptr)?;
        header.state_refs.store(pack(ObjectState::Destroyed, 0), Ordering::Release);

        let reactor = header.reactor.swap(ShmPtr::NULL);
        if !reactor.is_null() {
            if let Err(e) = Reactor::open(world, reactor).and_then(|reactor| reactor.destroy()) {
                tracing::debug!(object = self.id, error = %e, "object reactor already gone");
            }
        }
        let bound = header.call.swap(ShmPtr::NULL);
        if !bound.is_null() {
            if let Err(e) = call::destroy_shared(world, bound) {
                tracing::debug!(object = self.id, error = %e, "bound call already gone");
            }
        }

        header.magic.store(OBJECT_DEAD, Ordering::Release);
        world.free(self.ptr)?;

        let live = shared.live.fetch_sub(1, Ordering::Relaxed) - 1;
        observability::record_objects_live(&pool.inner.name, live as usize);
        tracing::trace!(pool = %pool.inner.name, id = self.id, zombie, "object destroyed");
        Ok(())
    }

    /// Shared pointer of the payload.
    pub fn data_ptr(&self) -> ShmPtr {
        self.ptr.add(OBJECT_HEADER)
    }

    /// Run `f` on the payload bytes under the pool lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let len = self.header()?.data_len.load(Ordering::Relaxed) as usize;
        let _guard = self.pool.inner.lock.guard()?;
        let raw = self.pool.inner.world.bytes(self.data_ptr(), len)?;
        // SAFETY: the payload belongs to this live object and is only
        // accessed under the pool lock, which this thread holds.
        let data = unsafe { std::slice::from_raw_parts_mut(raw, len) };
        Ok(f(data))
    }

    /// Copy a `T` out of the start of the payload.
    pub fn read<T: Plain>(&self) -> Result<T> {
        self.check_fits::<T>()?;
        self.with_data(|data| {
            // SAFETY: size checked; any bit pattern is a valid `T`.
            unsafe { std::ptr::read_unaligned(data.as_ptr() as *const T) }
        })
    }

    /// Copy `value` into the start of the payload.
    pub fn write<T: Plain>(&self, value: &T) -> Result<()> {
        self.check_fits::<T>()?;
        self.with_data(|data| {
            // SAFETY: size checked.
            unsafe { std::ptr::write_unaligned(data.as_mut_ptr() as *mut T, *value) }
        })
    }

    fn check_fits<T>(&self) -> Result<()> {
        let len = self.header()?.data_len.load(Ordering::Relaxed) as usize;
        if std::mem::size_of::<T>() > len {
            return Err(Error::InvalidArgument(format!(
                "{} does not fit in {} payload bytes",
                std::any::type_name::<T>(),
                len
            )));
        }
        Ok(())
    }

    /// The object's reactor.
    pub fn reactor(&self) -> Result<Reactor> {
        Reactor::open(&self.pool.inner.world, self.header()?.reactor.load())
    }

    /// Attach a local reaction to the object's reactor.
    pub fn attach<F>(&self, reaction: F) -> Result<ReactionId>
    where
        F: Fn(&[u8]) -> ReactionResult + Send + Sync + 'static,
    {
        self.reactor()?.attach(reaction)
    }

    /// Detach a local reaction.
    pub fn detach(&self, reaction: ReactionId) -> Result<()> {
        self.reactor()?.detach(reaction)
    }

    /// Publish a notification about this object.
    pub fn dispatch(&self, notification: &[u8], self_only: bool) -> Result<()> {
        self.reactor()?.dispatch(notification, self_only)
    }

    /// Bind a call; it is destroyed together with the object.
    pub fn bind_call(&self, call: &FusionCall) -> Result<()> {
        self.header()?.call.store(call.ptr());
        Ok(())
    }

    /// The bound call, if any.
    pub fn call(&self) -> Result<Option<FusionCall>> {
        let ptr = self.header()?.call.load();
        if ptr.is_null() {
            return Ok(None);
        }
        FusionCall::open(&self.pool.inner.world, ptr).map(Some)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("pool", &self.pool.inner.name)
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .finish()
    }
}
