//! World: the per-process handle on one shared domain.
//!
//! A World is a set of processes sharing one main pool. The first process to
//! enter creates the pool file exclusively and becomes the master
//! ([`FusionId::MASTER`]); later processes map it and register themselves in
//! the member table kept in the [`WorldShared`] header at the pool's root.
//! The last member to leave unlinks every backing file.
//!
//! Each member owns a mailbox and runs one dispatcher thread that delivers
//! reactor notifications and executes call requests addressed to it.
//!
//! Further pools are registered by name in the header; any member resolves
//! a [`ShmPtr`] into a pool it has not seen yet by mapping the pool's file on
//! first use. Mappings are never dropped while the World handle lives, so
//! references handed out for shared structures stay valid.

use crate::call::{self, CallHandler};
use crate::config::{MIN_POOL_SIZE, MemoryPolicy, WorldConfig};
use crate::error::{Error, Result, ResultRegistry, code};
use crate::futex::{Deadline, RawLock};
use crate::mailbox::{self, Mailbox, Message};
use crate::memory::{
    AtomicShmPtr, FixedName, HeapSegment, MemorySegment, PoolId, SharedMemoryPool,
    SharedMemorySegment, ShmPtr,
};
use crate::observability;
use crate::reactor::{self, GlobalReaction, LocalReaction, ReactionId, ReactionResult};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Maximum number of simultaneous members.
pub const MAX_MEMBERS: usize = 64;
/// Maximum number of named pools, the main pool included.
pub const MAX_POOLS: usize = 32;
/// Maximum number of arena fields.
pub const MAX_FIELDS: usize = 64;

const WORLD_MAGIC: u64 = 0x4655_5357_524C_4431; // "FUSWRLD1"
const MAIN_POOL: PoolId = PoolId(0);

/// How long a joiner waits for the creator to publish the World header.
const INIT_TIMEOUT: Duration = Duration::from_secs(2);
const ENTER_ATTEMPTS: usize = 5;
/// Dispatcher wake-up interval when idle; bounds shutdown latency.
const DISPATCH_IDLE: Duration = Duration::from_millis(100);

/// Identity of one member process within a World.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FusionId(pub u32);

impl FusionId {
    /// The member that created the World.
    pub const MASTER: FusionId = FusionId(1);
}

impl fmt::Display for FusionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fusion({})", self.0)
    }
}

#[repr(C)]
struct MemberSlot {
    fusion_id: AtomicU32,
    pid: AtomicU32,
    mailbox: AtomicShmPtr,
}

#[repr(C)]
struct PoolSlot {
    pool_id: AtomicU32,
    live: AtomicU32,
    max_size: AtomicU64,
    name: FixedName,
}

#[repr(C)]
struct FieldSlot {
    ptr: AtomicShmPtr,
    name: FixedName,
}

/// The World header, root of the main pool.
#[repr(C)]
pub(crate) struct WorldShared {
    magic: AtomicU64,
    lock: RawLock,
    closed: AtomicU32,
    next_fusion_id: AtomicU32,
    next_pool_id: AtomicU32,
    next_call_id: AtomicU32,
    next_reactor_id: AtomicU32,
    members: [MemberSlot; MAX_MEMBERS],
    pools: [PoolSlot; MAX_POOLS],
    fields: [FieldSlot; MAX_FIELDS],
}

static NEXT_THREAD_TAG: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TAG: u32 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Lock a std mutex, ignoring poisoning; the protected maps stay consistent
/// because no code path panics half way through an update.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn pool_path(config: &WorldConfig, id: PoolId) -> PathBuf {
    config
        .shm_dir
        .join(format!("fusion.{}.{}", config.world_index, id.0))
}

fn unlink_segment(segment: &dyn MemorySegment) {
    if let Some(path) = segment.path() {
        match rustix::fs::unlink(path) {
            Ok(()) | Err(rustix::io::Errno::NOENT) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to unlink pool file"),
        }
    }
}

fn log_leaks(pool: &SharedMemoryPool, except: ShmPtr) {
    for leak in pool.leaks() {
        if leak.ptr == except {
            continue;
        }
        tracing::warn!(
            pool = %pool.id(),
            name = %pool.name(),
            ptr = ?leak.ptr,
            size = leak.size,
            owner = leak.owner,
            seq = leak.seq,
            "leaked allocation"
        );
    }
}

/// Answer or free everything still queued in a mailbox that is going away.
fn reclaim_mailbox(main: &SharedMemoryPool, mailbox: &Mailbox<'_>) {
    while let Ok(Some(ptr)) = mailbox.take() {
        let Ok(message) = Message::open(main, ptr) else {
            continue;
        };
        let h = message.header;
        let kind = h.kind.load(Ordering::Relaxed);
        let flags = h.flags.load(Ordering::Relaxed);

        if kind == mailbox::KIND_CALL && flags & mailbox::FLAG_ONEWAY == 0 {
            // Blocking requester frees it once woken.
            if !message.complete(code::DEAD, 0) {
                message.discard();
            }
            continue;
        }
        if flags & mailbox::FLAG_QUOTA != 0 {
            call::release_quota(
                main,
                h.target.load(),
                h.call_id.load(Ordering::Relaxed),
                h.sender.load(Ordering::Relaxed),
            );
        }
        message.discard();
    }
}

/// Per-process registries of callbacks bound to shared objects.
#[derive(Default)]
pub(crate) struct Registries {
    /// Handlers of calls owned by this member, by call id.
    pub calls: Mutex<HashMap<u32, Arc<dyn CallHandler>>>,
    /// Requests whose handler chose to answer later, by (call id, serial).
    pub retained: Mutex<HashMap<(u32, u64), ShmPtr>>,
    /// Local reactions by reactor id, in attach order.
    pub reactions: Mutex<HashMap<u32, Vec<(ReactionId, LocalReaction)>>>,
    /// Global reactions by index.
    pub globals: RwLock<HashMap<u32, GlobalReaction>>,
    pub next_reaction: AtomicU64,
}

struct WorldInner {
    config: WorldConfig,
    fusion_id: FusionId,
    main: SharedMemoryPool,
    header: ShmPtr,
    mailbox: ShmPtr,
    /// Mapped pools other than the main pool; entries are never removed.
    pools: RwLock<HashMap<PoolId, SharedMemoryPool>>,
    /// How many times this member attached each pool.
    attached: Mutex<HashMap<PoolId, u32>>,
    results: ResultRegistry,
    registries: Registries,
    stop: AtomicBool,
    exited: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Result of entering: the main pool and this member's slot.
struct Joined {
    main: SharedMemoryPool,
    header: ShmPtr,
    mailbox: ShmPtr,
    fusion_id: FusionId,
}

enum JoinAttempt {
    Joined(Joined),
    /// The World is being torn down or is not published yet.
    Retry,
    /// No live member is left; the files are garbage.
    Stale,
}

/// A process's membership in a World.
///
/// Cheap to clone; all clones share one membership. The member leaves the
/// World when [`exit`](World::exit) is called or the last clone is dropped.
///
/// # Example
///
/// ```rust
/// use fusion::{World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// assert!(world.is_master());
/// world.exit();
/// ```
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

impl World {
    /// Enter the World described by `config`, creating it if needed.
    pub fn enter(config: WorldConfig) -> Result<World> {
        config.validate()?;
        crate::observability::init_metrics();

        let joined = match config.policy {
            MemoryPolicy::Local => Self::create_local(&config)?,
            MemoryPolicy::Shared => Self::enter_shared(&config)?,
        };

        let inner = Arc::new(WorldInner {
            fusion_id: joined.fusion_id,
            main: joined.main,
            header: joined.header,
            mailbox: joined.mailbox,
            pools: RwLock::new(HashMap::new()),
            attached: Mutex::new(HashMap::new()),
            results: ResultRegistry::new(),
            registries: Registries::default(),
            stop: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
            config,
        });

        let handle = spawn_dispatcher(&inner)?;
        *locked(&inner.dispatcher) = Some(handle);

        tracing::info!(
            world = inner.config.world_index,
            fusion_id = inner.fusion_id.0,
            policy = ?inner.config.policy,
            "entered world"
        );
        Ok(World { inner })
    }

    fn create_local(config: &WorldConfig) -> Result<Joined> {
        let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(config.main_pool_size)?);
        let main = SharedMemoryPool::init(
            MAIN_POOL,
            segment,
            "main",
            config.debug_pools,
            FusionId::MASTER.0,
        )?;
        Self::format(main, config)
    }

    /// Lay out the World header in a fresh main pool and register the
    /// creator as the only member.
    fn format(main: SharedMemoryPool, config: &WorldConfig) -> Result<Joined> {
        let header = main.allocate(std::mem::size_of::<WorldShared>(), true)?;
        let mailbox = Mailbox::create(&main)?;

        {
            // SAFETY: freshly zeroed; all-zero is a valid WorldShared.
            let shared = unsafe { main.get::<WorldShared>(header)? };
            shared.next_fusion_id.store(FusionId::MASTER.0 + 1, Ordering::Relaxed);
            shared.next_pool_id.store(1, Ordering::Relaxed);
            shared.next_call_id.store(1, Ordering::Relaxed);
            shared.next_reactor_id.store(1, Ordering::Relaxed);

            let me = &shared.members[0];
            me.pid.store(std::process::id(), Ordering::Relaxed);
            me.mailbox.store(mailbox);
            me.fusion_id.store(FusionId::MASTER.0, Ordering::Relaxed);

            let slot = &shared.pools[0];
            slot.name.store("main")?;
            slot.pool_id.store(MAIN_POOL.0 as u32, Ordering::Relaxed);
            slot.max_size.store(config.main_pool_size as u64, Ordering::Relaxed);
            slot.live.store(1, Ordering::Relaxed);

            main.set_root(header);
            shared.magic.store(WORLD_MAGIC, Ordering::Release);
        }

        Ok(Joined {
            main,
            header,
            mailbox,
            fusion_id: FusionId::MASTER,
        })
    }

    fn enter_shared(config: &WorldConfig) -> Result<Joined> {
        let path = pool_path(config, MAIN_POOL);

        for attempt in 0..ENTER_ATTEMPTS {
            match SharedMemorySegment::create(&path, config.main_pool_size) {
                Ok(segment) => {
                    let segment: Arc<dyn MemorySegment> = Arc::new(segment);
                    let formatted = SharedMemoryPool::init(
                        MAIN_POOL,
                        Arc::clone(&segment),
                        "main",
                        config.debug_pools,
                        FusionId::MASTER.0,
                    )
                    .and_then(|main| Self::format(main, config));
                    if formatted.is_err() {
                        unlink_segment(segment.as_ref());
                    } else {
                        tracing::info!(world = config.world_index, path = %path.display(), "created world");
                    }
                    return formatted;
                }
                Err(Error::System(rustix::io::Errno::EXIST)) => {}
                Err(e) => return Err(e),
            }

            match Self::join_shared(&path)? {
                JoinAttempt::Joined(joined) => return Ok(joined),
                JoinAttempt::Retry => {
                    tracing::debug!(attempt, "world not ready, retrying");
                    std::thread::sleep(Duration::from_millis(10));
                }
                JoinAttempt::Stale => Self::remove_stale(config)?,
            }
        }

        Err(Error::InvalidSegment(format!(
            "could not enter world {} in {}",
            config.world_index,
            config.shm_dir.display()
        )))
    }

    /// Map the main pool once its creator has published the header.
    fn probe(path: &std::path::Path) -> Result<Option<(Arc<dyn MemorySegment>, ShmPtr)>> {
        let segment: Arc<dyn MemorySegment> = match SharedMemorySegment::open(path) {
            Ok(segment) => Arc::new(segment),
            Err(Error::InvalidSegment(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let pool = match SharedMemoryPool::open(MAIN_POOL, Arc::clone(&segment), 0) {
            Ok(pool) => pool,
            Err(Error::InvalidSegment(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let header = pool.root();
        if header.is_null() {
            return Ok(None);
        }
        // SAFETY: the root of a formatted main pool is the World header.
        let shared = unsafe { pool.get::<WorldShared>(header)? };
        if shared.magic.load(Ordering::Acquire) != WORLD_MAGIC {
            return Ok(None);
        }
        Ok(Some((segment, header)))
    }

    fn join_shared(path: &std::path::Path) -> Result<JoinAttempt> {
        let deadline = Deadline::after(Some(INIT_TIMEOUT));
        let (segment, header) = loop {
            match Self::probe(path) {
                Ok(Some(found)) => break found,
                Ok(None) => {}
                Err(Error::System(rustix::io::Errno::NOENT)) => return Ok(JoinAttempt::Retry),
                Err(e) => return Err(e),
            }
            if deadline.expired() {
                tracing::warn!(path = %path.display(), "world header never published");
                return Ok(JoinAttempt::Stale);
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let probe = SharedMemoryPool::open(MAIN_POOL, Arc::clone(&segment), 0)?;
        // SAFETY: validated by `probe`.
        let shared = unsafe { probe.get::<WorldShared>(header)? };
        let _guard = shared.lock.guard();

        if shared.closed.load(Ordering::Relaxed) != 0 {
            return Ok(JoinAttempt::Retry);
        }

        for slot in &shared.members {
            let id = slot.fusion_id.load(Ordering::Relaxed);
            if id != 0 && !pid_alive(slot.pid.load(Ordering::Relaxed)) {
                tracing::warn!(fusion_id = id, pid = slot.pid.load(Ordering::Relaxed), "reclaiming departed member");
                let mailbox_ptr = slot.mailbox.swap(ShmPtr::NULL);
                slot.fusion_id.store(0, Ordering::Release);
                if let Ok(mailbox) = Mailbox::open(&probe, mailbox_ptr) {
                    mailbox.close();
                    reclaim_mailbox(&probe, &mailbox);
                    let _ = probe.deallocate(mailbox_ptr);
                }
            }
        }

        let live = shared
            .members
            .iter()
            .filter(|s| s.fusion_id.load(Ordering::Relaxed) != 0)
            .count();
        if live == 0 {
            shared.closed.store(1, Ordering::Relaxed);
            return Ok(JoinAttempt::Stale);
        }

        let slot = shared
            .members
            .iter()
            .find(|s| s.fusion_id.load(Ordering::Relaxed) == 0)
            .ok_or_else(|| Error::LimitExceeded(format!("world has {} members", MAX_MEMBERS)))?;

        let fusion_id = FusionId(shared.next_fusion_id.fetch_add(1, Ordering::Relaxed));
        let main = SharedMemoryPool::open(MAIN_POOL, segment, fusion_id.0)?;
        let mailbox = Mailbox::create(&main)?;
        slot.pid.store(std::process::id(), Ordering::Relaxed);
        slot.mailbox.store(mailbox);
        slot.fusion_id.store(fusion_id.0, Ordering::Release);

        Ok(JoinAttempt::Joined(Joined {
            main,
            header,
            mailbox,
            fusion_id,
        }))
    }

    fn remove_stale(config: &WorldConfig) -> Result<()> {
        let prefix = format!("fusion.{}.", config.world_index);
        for entry in std::fs::read_dir(&config.shm_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                tracing::warn!(file = %entry.path().display(), "removing stale world file");
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// World index.
    pub fn index(&self) -> u32 {
        self.inner.config.world_index
    }

    /// This member's identity.
    pub fn fusion_id(&self) -> FusionId {
        self.inner.fusion_id
    }

    /// Whether this member created the World.
    pub fn is_master(&self) -> bool {
        self.inner.fusion_id == FusionId::MASTER
    }

    /// The configuration this member entered with.
    pub fn config(&self) -> &WorldConfig {
        &self.inner.config
    }

    /// Result code names, shared by every primitive of this member.
    pub fn results(&self) -> &ResultRegistry {
        &self.inner.results
    }

    /// The main pool.
    pub fn main_pool(&self) -> &SharedMemoryPool {
        &self.inner.main
    }

    /// Identities of all current members.
    pub fn members(&self) -> Vec<FusionId> {
        let Ok(shared) = self.inner.shared_header() else {
            return Vec::new();
        };
        let mut ids: Vec<FusionId> = shared
            .members
            .iter()
            .map(|s| s.fusion_id.load(Ordering::Acquire))
            .filter(|&id| id != 0)
            .map(FusionId)
            .collect();
        ids.sort();
        ids
    }

    /// Whether `id` is a member whose process is still running.
    pub fn is_alive(&self, id: FusionId) -> bool {
        self.inner.is_alive(id)
    }

    /// Create a named pool of `max_size` bytes and attach to it.
    pub fn create_pool(&self, name: &str, max_size: usize, debug: bool) -> Result<SharedMemoryPool> {
        if max_size < MIN_POOL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "pool size {} below minimum {}",
                max_size, MIN_POOL_SIZE
            )));
        }
        let inner = &self.inner;
        let shared = inner.shared_header()?;
        let _guard = shared.lock.guard();

        if shared
            .pools
            .iter()
            .any(|s| s.live.load(Ordering::Relaxed) != 0 && s.name.matches(name))
        {
            return Err(Error::InvalidArgument(format!("pool {:?} already exists", name)));
        }
        let slot = shared
            .pools
            .iter()
            .find(|s| s.live.load(Ordering::Relaxed) == 0)
            .ok_or_else(|| Error::LimitExceeded(format!("world has {} pools", MAX_POOLS)))?;

        let raw_id = shared.next_pool_id.load(Ordering::Relaxed);
        let id = u16::try_from(raw_id)
            .map(PoolId)
            .map_err(|_| Error::LimitExceeded("pool ids exhausted".into()))?;

        slot.name.store(name)?;
        let segment: Arc<dyn MemorySegment> = match inner.config.policy {
            MemoryPolicy::Local => Arc::new(HeapSegment::new(max_size)?),
            MemoryPolicy::Shared => {
                match SharedMemorySegment::create(pool_path(&inner.config, id), max_size) {
                    Ok(segment) => Arc::new(segment),
                    Err(e) => {
                        slot.name.clear();
                        return Err(e);
                    }
                }
            }
        };
        let pool = match SharedMemoryPool::init(id, Arc::clone(&segment), name, debug, inner.fusion_id.0) {
            Ok(pool) => pool,
            Err(e) => {
                unlink_segment(segment.as_ref());
                slot.name.clear();
                return Err(e);
            }
        };

        shared.next_pool_id.store(raw_id + 1, Ordering::Relaxed);
        slot.pool_id.store(raw_id, Ordering::Relaxed);
        slot.max_size.store(max_size as u64, Ordering::Relaxed);
        slot.live.store(1, Ordering::Release);

        inner
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, pool.clone());
        *locked(&inner.attached).entry(id).or_insert(0) += 1;

        tracing::info!(pool = %id, name, max_size, debug_pool = pool.is_debug(), "created pool");
        Ok(pool)
    }

    /// Attach to a pool created by any member.
    pub fn attach_pool(&self, name: &str) -> Result<SharedMemoryPool> {
        let id = {
            let shared = self.inner.shared_header()?;
            let _guard = shared.lock.guard();
            let slot = shared
                .pools
                .iter()
                .find(|s| s.live.load(Ordering::Relaxed) != 0 && s.name.matches(name))
                .ok_or_else(|| Error::ItemNotFound(format!("pool {:?}", name)))?;
            PoolId(slot.pool_id.load(Ordering::Relaxed) as u16)
        };
        if id == MAIN_POOL {
            return Err(Error::InvalidArgument("the main pool is always attached".into()));
        }

        let pool = self.inner.pool(id)?;
        pool.attach();
        *locked(&self.inner.attached).entry(id).or_insert(0) += 1;
        tracing::debug!(pool = %id, name, "attached pool");
        Ok(pool)
    }

    /// Drop one attachment; the pool is destroyed when nobody is attached.
    pub fn detach_pool(&self, pool: &SharedMemoryPool) -> Result<()> {
        let id = pool.id();
        {
            let mut attached = locked(&self.inner.attached);
            match attached.get_mut(&id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        attached.remove(&id);
                    }
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "{} is not attached by {}",
                        id, self.inner.fusion_id
                    )));
                }
            }
        }
        if pool.detach() == 0 {
            self.inner.destroy_pool(pool)?;
        }
        Ok(())
    }

    /// Publish `ptr` under `name` in the World header.
    pub fn set_field(&self, name: &str, ptr: ShmPtr) -> Result<()> {
        let shared = self.inner.shared_header()?;
        let _guard = shared.lock.guard();
        let slot = match shared.fields.iter().find(|s| s.name.matches(name)) {
            Some(slot) => slot,
            None => {
                let free = shared
                    .fields
                    .iter()
                    .find(|s| s.name.is_empty())
                    .ok_or_else(|| Error::LimitExceeded(format!("world has {} fields", MAX_FIELDS)))?;
                free.name.store(name)?;
                free
            }
        };
        slot.ptr.store(ptr);
        Ok(())
    }

    /// Look up an arena field.
    pub fn field(&self, name: &str) -> Result<ShmPtr> {
        let shared = self.inner.shared_header()?;
        let _guard = shared.lock.guard();
        shared
            .fields
            .iter()
            .find(|s| s.name.matches(name))
            .map(|s| s.ptr.load())
            .ok_or_else(|| Error::ItemNotFound(format!("field {:?}", name)))
    }

    /// Remove an arena field.
    pub fn clear_field(&self, name: &str) -> Result<()> {
        let shared = self.inner.shared_header()?;
        let _guard = shared.lock.guard();
        let slot = shared
            .fields
            .iter()
            .find(|s| s.name.matches(name))
            .ok_or_else(|| Error::ItemNotFound(format!("field {:?}", name)))?;
        slot.ptr.store(ShmPtr::NULL);
        slot.name.clear();
        Ok(())
    }

    /// Look up a field, or run `init` and publish its result, atomically
    /// with respect to other members doing the same.
    ///
    /// Returns the pointer and whether `init` ran. `init` runs under the
    /// World lock and must not call back into field or pool registry
    /// operations.
    pub(crate) fn field_or_init(
        &self,
        name: &str,
        init: impl FnOnce() -> Result<ShmPtr>,
    ) -> Result<(ShmPtr, bool)> {
        let shared = self.inner.shared_header()?;
        let _guard = shared.lock.guard();
        if let Some(slot) = shared.fields.iter().find(|s| s.name.matches(name)) {
            return Ok((slot.ptr.load(), false));
        }
        let free = shared
            .fields
            .iter()
            .find(|s| s.name.is_empty())
            .ok_or_else(|| Error::LimitExceeded(format!("world has {} fields", MAX_FIELDS)))?;
        let ptr = init()?;
        free.name.store(name)?;
        free.ptr.store(ptr);
        Ok((ptr, true))
    }

    /// Register a global reaction under `index` in this process.
    ///
    /// Reactors that list `index` call `reaction` with the notification and
    /// the context given to [`Reactor::attach_global`](crate::Reactor::attach_global).
    pub fn register_global_reaction<F>(&self, index: u32, reaction: F) -> Result<()>
    where
        F: Fn(&[u8], u64) -> ReactionResult + Send + Sync + 'static,
    {
        if index == reactor::EMPTY_GLOBAL {
            return Err(Error::InvalidArgument(format!("global index {} is reserved", index)));
        }
        self.inner
            .registries
            .globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Arc::new(reaction));
        Ok(())
    }

    /// Remove a global reaction from this process.
    pub fn unregister_global_reaction(&self, index: u32) -> Result<()> {
        self.inner
            .registries
            .globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| Error::ItemNotFound(format!("global reaction {}", index)))
    }

    /// Leave the World now.
    ///
    /// Queued requests addressed to this member fail with [`Error::Dead`];
    /// if this was the last member, all pool files are removed. Other
    /// clones of this handle stay usable only for local bookkeeping.
    pub fn exit(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    /// Distributed identity of the calling thread: FusionID in the upper
    /// half, a process-local thread tag in the lower.
    pub(crate) fn identity(&self) -> u64 {
        ((self.inner.fusion_id.0 as u64) << 32) | THREAD_TAG.with(|t| *t) as u64
    }

    pub(crate) fn next_call_id(&self) -> Result<u32> {
        Ok(self
            .inner
            .shared_header()?
            .next_call_id
            .fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_reactor_id(&self) -> Result<u32> {
        Ok(self
            .inner
            .shared_header()?
            .next_reactor_id
            .fetch_add(1, Ordering::Relaxed))
    }

    /// Handle on the pool `id`, mapping it on first use.
    pub(crate) fn pool(&self, id: PoolId) -> Result<SharedMemoryPool> {
        self.inner.pool(id)
    }

    /// Allocate zeroed shared memory from the main pool.
    pub(crate) fn alloc(&self, size: usize) -> Result<ShmPtr> {
        self.inner.main.allocate(size, true)
    }

    /// Free shared memory from whichever pool `ptr` points into.
    pub(crate) fn free(&self, ptr: ShmPtr) -> Result<()> {
        self.inner.pool(ptr.pool())?.deallocate(ptr)
    }

    /// Borrow the shared structure at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at an initialized `T` consisting of atomics, and the
    /// reference must not be used after the block is freed.
    pub(crate) unsafe fn shared<T>(&self, ptr: ShmPtr) -> Result<&T> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null shared pointer".into()));
        }
        let pool = self.inner.pool(ptr.pool())?;
        let raw = pool.resolve(ptr, std::mem::size_of::<T>())?;
        if raw.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::InvalidSegment(format!("{:?} misaligned", ptr)));
        }
        // SAFETY: mappings stay in place as long as `self.inner`.
        Ok(unsafe { &*(raw.as_ptr() as *const T) })
    }

    /// Address of `len` bytes at `ptr` in this process.
    pub(crate) fn bytes(&self, ptr: ShmPtr, len: usize) -> Result<*mut u8> {
        Ok(self.inner.pool(ptr.pool())?.resolve(ptr, len)?.as_ptr())
    }

    /// Queue a message for member `to`. Fails [`Error::Dead`] if it left.
    pub(crate) fn post(&self, to: FusionId, message: ShmPtr) -> Result<()> {
        let shared = self.inner.shared_header()?;
        // Held across the post so the mailbox cannot be freed underneath.
        let _guard = shared.lock.guard();
        let slot = shared
            .members
            .iter()
            .find(|s| s.fusion_id.load(Ordering::Acquire) == to.0)
            .ok_or(Error::Dead)?;
        Mailbox::open(&self.inner.main, slot.mailbox.load())?.post(message)
    }

    fn drain_mailbox(&self, mailbox: &Mailbox<'_>) {
        loop {
            match mailbox.take() {
                Ok(Some(ptr)) => self.handle_message(ptr),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "mailbox corrupted");
                    break;
                }
            }
        }
        observability::record_mailbox_depth(self.inner.fusion_id.0, mailbox.pending() as usize);
    }

    fn handle_message(&self, ptr: ShmPtr) {
        let message = match Message::open(&self.inner.main, ptr) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(ptr = ?ptr, error = %e, "invalid message");
                return;
            }
        };
        let h = message.header;
        let kind = h.kind.load(Ordering::Relaxed);
        let _span = observability::span_message(
            match kind {
                mailbox::KIND_REACTION => "reaction",
                mailbox::KIND_CALL => "call",
                _ => "call_destroyed",
            },
            h.sender.load(Ordering::Relaxed),
            h.serial.load(Ordering::Relaxed),
        )
        .entered();

        match kind {
            mailbox::KIND_REACTION => {
                if let Err(e) = reactor::deliver(self, &message) {
                    tracing::debug!(error = %e, "notification dropped");
                }
                message.discard();
            }
            mailbox::KIND_CALL => call::handle_request(self, message),
            mailbox::KIND_CALL_DESTROYED => call::handle_destroyed(self, message),
            other => {
                tracing::warn!(kind = other, "unknown message kind");
                message.discard();
            }
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("index", &self.inner.config.world_index)
            .field("fusion_id", &self.inner.fusion_id)
            .finish()
    }
}

impl WorldInner {
    fn shared_header(&self) -> Result<&WorldShared> {
        // SAFETY: the root of the main pool is the World header.
        unsafe { self.main.get::<WorldShared>(self.header) }
    }

    fn is_alive(&self, id: FusionId) -> bool {
        let Ok(shared) = self.shared_header() else {
            return false;
        };
        shared
            .members
            .iter()
            .find(|s| s.fusion_id.load(Ordering::Acquire) == id.0)
            .is_some_and(|s| pid_alive(s.pid.load(Ordering::Relaxed)))
    }

    fn pool(&self, id: PoolId) -> Result<SharedMemoryPool> {
        if id == MAIN_POOL {
            return Ok(self.main.clone());
        }
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(pool.clone());
        }
        if !self.main.segment().memory_type().supports_ipc() {
            return Err(Error::InvalidArgument(format!("{} is not mapped", id)));
        }

        let segment = SharedMemorySegment::open(pool_path(&self.config, id))?;
        let pool = SharedMemoryPool::open(id, Arc::new(segment), self.fusion_id.0)?;
        tracing::debug!(pool = %id, "mapped pool");
        Ok(self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(pool)
            .clone())
    }

    fn destroy_pool(&self, pool: &SharedMemoryPool) -> Result<()> {
        let shared = self.shared_header()?;
        {
            let _guard = shared.lock.guard();
            if let Some(slot) = shared.pools.iter().find(|s| {
                s.live.load(Ordering::Relaxed) != 0
                    && s.pool_id.load(Ordering::Relaxed) == pool.id().0 as u32
            }) {
                slot.live.store(0, Ordering::Release);
                slot.name.clear();
            }
        }
        if pool.mark_destroyed() {
            log_leaks(pool, ShmPtr::NULL);
            unlink_segment(pool.segment().as_ref());
            tracing::info!(pool = %pool.id(), name = %pool.name(), "destroyed pool");
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);

        let mailbox = Mailbox::open(&self.main, self.mailbox).ok();
        if let Some(mailbox) = &mailbox {
            mailbox.close();
        }

        if let Some(handle) = locked(&self.dispatcher).take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        if let Some(mailbox) = &mailbox {
            reclaim_mailbox(&self.main, mailbox);
        }

        for (_, ptr) in locked(&self.registries.retained).drain() {
            if let Ok(message) = Message::open(&self.main, ptr) {
                if !message.complete(code::DEAD, 0) {
                    message.discard();
                }
            }
        }
        locked(&self.registries.calls).clear();
        locked(&self.registries.reactions).clear();

        let attached: Vec<(PoolId, u32)> = locked(&self.attached).drain().collect();
        for (id, count) in attached {
            if let Ok(pool) = self.pool(id) {
                for _ in 0..count {
                    if pool.detach() == 0 {
                        if let Err(e) = self.destroy_pool(&pool) {
                            tracing::debug!(pool = %id, error = %e, "destroying pool on exit failed");
                        }
                    }
                }
            }
        }

        let Ok(shared) = self.shared_header() else {
            return;
        };
        let last = {
            let _guard = shared.lock.guard();
            if let Some(slot) = shared
                .members
                .iter()
                .find(|s| s.fusion_id.load(Ordering::Relaxed) == self.fusion_id.0)
            {
                slot.fusion_id.store(0, Ordering::Release);
                slot.mailbox.store(ShmPtr::NULL);
                slot.pid.store(0, Ordering::Relaxed);
            }
            if let Err(e) = self.main.deallocate(self.mailbox) {
                tracing::debug!(error = %e, "freeing mailbox failed");
            }

            let remaining = shared
                .members
                .iter()
                .filter(|s| s.fusion_id.load(Ordering::Relaxed) != 0)
                .count();
            if remaining == 0 {
                shared.closed.store(1, Ordering::Relaxed);
            }
            remaining == 0
        };

        if last {
            self.teardown(shared);
            tracing::info!(world = self.config.world_index, fusion_id = self.fusion_id.0, "destroyed world");
        } else {
            tracing::info!(world = self.config.world_index, fusion_id = self.fusion_id.0, "left world");
        }
    }

    /// Remove every pool of a World nobody is in anymore.
    fn teardown(&self, shared: &WorldShared) {
        for slot in shared.pools.iter().skip(1) {
            if slot.live.swap(0, Ordering::AcqRel) == 0 {
                continue;
            }
            let id = PoolId(slot.pool_id.load(Ordering::Relaxed) as u16);
            match self.pool(id) {
                Ok(pool) => {
                    if pool.mark_destroyed() {
                        log_leaks(&pool, ShmPtr::NULL);
                        unlink_segment(pool.segment().as_ref());
                    }
                }
                Err(e) => tracing::warn!(pool = %id, error = %e, "cannot map pool for teardown"),
            }
        }
        log_leaks(&self.main, self.header);
        self.main.mark_destroyed();
        unlink_segment(self.main.segment().as_ref());
    }
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_dispatcher(inner: &Arc<WorldInner>) -> Result<JoinHandle<()>> {
    let weak: Weak<WorldInner> = Arc::downgrade(inner);
    let main = inner.main.clone();
    let mailbox_ptr = inner.mailbox;
    let span = observability::span_world(inner.config.world_index, inner.fusion_id.0);

    std::thread::Builder::new()
        .name(format!(
            "fusion-{}-{}",
            inner.config.world_index, inner.fusion_id.0
        ))
        .spawn(move || {
            let _entered = span.enter();
            let Ok(mailbox) = Mailbox::open(&main, mailbox_ptr) else {
                tracing::error!("dispatcher has no mailbox");
                return;
            };
            loop {
                let seen = mailbox.seq();
                {
                    let Some(inner) = weak.upgrade() else { break };
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    World { inner }.drain_mailbox(&mailbox);
                }
                mailbox.wait(seen, DISPATCH_IDLE);
            }
            tracing::debug!("dispatcher stopped");
        })
        .map_err(Error::Io)
}
