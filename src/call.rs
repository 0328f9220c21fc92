//! Cross-process calls.
//!
//! A [`FusionCall`] is created by its owner, who supplies a [`CallHandler`].
//! Other members execute it: the request is copied into a message in the
//! main pool and posted to the owner's mailbox, where the owner's dispatcher
//! thread runs the handler and writes the result back into the message. A
//! blocking requester sleeps on the message's state word until then.
//!
//! Access is guarded by per-member permission bits and optional quotas on
//! the number of requests a member may have in flight.

use crate::error::{Error, Result, code};
use crate::futex::{self, RawLock};
use crate::mailbox::{self, Message};
use crate::memory::{SharedMemoryPool, ShmPtr};
use crate::observability::{self, CallMetrics};
use crate::world::{FusionId, World, locked};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Permission to execute a call.
pub const EXECUTE: u32 = 1 << 0;

/// Maximum number of members with explicit permissions on one call.
pub const MAX_PERMISSIONS: usize = 16;
/// Maximum number of members with a quota on one call.
pub const MAX_QUOTAS: usize = 16;

const CALL_MAGIC: u64 = 0x4655_5343_414C_4C31; // "FUSCALL1"

/// How a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallFlags {
    /// Wait for the handler's return value.
    #[default]
    Blocking,
    /// Queue the request and return immediately.
    Oneway,
}

/// One request as seen by the handler.
#[derive(Debug)]
pub struct CallContext<'a> {
    /// The requesting member.
    pub caller: FusionId,
    /// Request selector chosen by the caller.
    pub call_arg: i32,
    /// Request payload.
    pub payload: &'a [u8],
    /// Per-call serial of this request.
    pub serial: u64,
    /// Id of the call being executed.
    pub call_id: u32,
}

/// What a handler did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answer now with this value.
    Return(i32),
    /// Answer later through [`FusionCall::return_value`].
    Retain,
}

/// Executes requests in the owner process.
///
/// Errors are sent back to the caller as result codes; codes outside the
/// core range are described by the World's [`ResultRegistry`](crate::ResultRegistry).
pub trait CallHandler: Send + Sync {
    /// Handle one request.
    fn handle(&self, ctx: &CallContext<'_>) -> Result<CallOutcome>;
}

impl<F> CallHandler for F
where
    F: Fn(&CallContext<'_>) -> Result<CallOutcome> + Send + Sync,
{
    fn handle(&self, ctx: &CallContext<'_>) -> Result<CallOutcome> {
        self(ctx)
    }
}

/// Adapter that decodes `call_arg` into a typed request tag.
///
/// ```rust
/// use fusion::{CallContext, CallOutcome, Error, TaggedHandler};
///
/// enum WindowOp { Raise, Lower }
///
/// impl TryFrom<i32> for WindowOp {
///     type Error = ();
///     fn try_from(v: i32) -> Result<Self, ()> {
///         match v { 1 => Ok(WindowOp::Raise), 2 => Ok(WindowOp::Lower), _ => Err(()) }
///     }
/// }
///
/// let handler = TaggedHandler::new(|op: WindowOp, _ctx: &CallContext<'_>| {
///     Ok::<_, Error>(match op {
///         WindowOp::Raise => CallOutcome::Return(1),
///         WindowOp::Lower => CallOutcome::Return(-1),
///     })
/// });
/// # let _ = handler;
/// ```
pub struct TaggedHandler<K, F> {
    handler: F,
    _tag: PhantomData<fn() -> K>,
}

impl<K, F> TaggedHandler<K, F>
where
    K: TryFrom<i32>,
    F: Fn(K, &CallContext<'_>) -> Result<CallOutcome> + Send + Sync,
{
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _tag: PhantomData,
        }
    }
}

impl<K, F> CallHandler for TaggedHandler<K, F>
where
    K: TryFrom<i32>,
    F: Fn(K, &CallContext<'_>) -> Result<CallOutcome> + Send + Sync,
{
    fn handle(&self, ctx: &CallContext<'_>) -> Result<CallOutcome> {
        let tag = K::try_from(ctx.call_arg)
            .map_err(|_| Error::InvalidArgument(format!("unknown call tag {}", ctx.call_arg)))?;
        (self.handler)(tag, ctx)
    }
}

#[repr(C)]
struct PermissionSlot {
    fusion_id: AtomicU32,
    bits: AtomicU32,
}

#[repr(C)]
struct QuotaSlot {
    fusion_id: AtomicU32,
    limit: AtomicU32,
    in_flight: AtomicU32,
    _reserved: AtomicU32,
}

#[repr(C)]
struct CallShared {
    magic: AtomicU64,
    call_id: AtomicU32,
    owner: AtomicU32,
    serial: AtomicU64,
    lock: RawLock,
    secure: AtomicU32,
    destroyed: AtomicU32,
    /// Bumped whenever a quota slot frees up.
    quota_seq: AtomicU32,
    perms: [PermissionSlot; MAX_PERMISSIONS],
    quotas: [QuotaSlot; MAX_QUOTAS],
}

impl CallShared {
    fn permitted(&self, member: FusionId, bits: u32) -> bool {
        if self.secure.load(Ordering::Relaxed) == 0 || member.0 == self.owner.load(Ordering::Relaxed) {
            return true;
        }
        let _guard = self.lock.guard();
        self.perms
            .iter()
            .find(|p| p.fusion_id.load(Ordering::Relaxed) == member.0)
            .is_some_and(|p| p.bits.load(Ordering::Relaxed) & bits == bits)
    }

    /// Take a quota slot if `member` has a quota and one is free.
    ///
    /// `Ok(true)` means a slot was taken, `Ok(false)` that no quota
    /// applies, `Err(seq)` that the caller must wait for `quota_seq` to move.
    fn try_take_slot(&self, member: FusionId) -> std::result::Result<bool, u32> {
        let _guard = self.lock.guard();
        let seq = self.quota_seq.load(Ordering::Relaxed);
        let Some(slot) = self
            .quotas
            .iter()
            .find(|q| q.fusion_id.load(Ordering::Relaxed) == member.0)
        else {
            return Ok(false);
        };
        let limit = slot.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return Ok(false);
        }
        let in_flight = slot.in_flight.load(Ordering::Relaxed);
        if in_flight < limit {
            slot.in_flight.store(in_flight + 1, Ordering::Relaxed);
            return Ok(true);
        }
        Err(seq)
    }

    fn release_slot(&self, member: u32) {
        {
            let _guard = self.lock.guard();
            if let Some(slot) = self
                .quotas
                .iter()
                .find(|q| q.fusion_id.load(Ordering::Relaxed) == member)
            {
                let in_flight = slot.in_flight.load(Ordering::Relaxed);
                slot.in_flight.store(in_flight.saturating_sub(1), Ordering::Relaxed);
            }
            self.quota_seq.fetch_add(1, Ordering::Release);
        }
        futex::wake_all(&self.quota_seq);
    }
}

/// A call owned by one member and executable by the others.
///
/// # Example
///
/// ```rust
/// use fusion::{CallContext, CallFlags, CallOutcome, FusionCall, World, WorldConfig};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let call = FusionCall::new(&world, |ctx: &CallContext<'_>| {
///     Ok(CallOutcome::Return(ctx.call_arg * 2))
/// })
/// .unwrap();
///
/// assert_eq!(call.execute(CallFlags::Blocking, 21, &[]).unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct FusionCall {
    world: World,
    ptr: ShmPtr,
    id: u32,
}

impl FusionCall {
    /// Create a call owned by this member.
    pub fn new(world: &World, handler: impl CallHandler + 'static) -> Result<FusionCall> {
        let id = world.next_call_id()?;
        let ptr = world.alloc(std::mem::size_of::<CallShared>())?;
        // SAFETY: freshly zeroed allocation of the right size.
        let shared = unsafe { world.shared::<CallShared>(ptr)? };
        shared.call_id.store(id, Ordering::Relaxed);
        shared.owner.store(world.fusion_id().0, Ordering::Relaxed);
        shared
            .secure
            .store(world.config().secure_calls as u32, Ordering::Relaxed);
        locked(&world.registries().calls).insert(id, Arc::new(handler));
        shared.magic.store(CALL_MAGIC, Ordering::Release);

        tracing::debug!(call = id, owner = %world.fusion_id(), "created call");
        Ok(FusionCall {
            world: world.clone(),
            ptr,
            id,
        })
    }

    /// Open a call created by any member.
    pub fn open(world: &World, ptr: ShmPtr) -> Result<FusionCall> {
        // SAFETY: checked for the call magic before use.
        let shared = unsafe { world.shared::<CallShared>(ptr)? };
        if shared.magic.load(Ordering::Acquire) != CALL_MAGIC {
            return Err(Error::InvalidSegment(format!("{:?} is not a call", ptr)));
        }
        Ok(FusionCall {
            world: world.clone(),
            ptr,
            id: shared.call_id.load(Ordering::Relaxed),
        })
    }

    fn shared(&self) -> Result<&CallShared> {
        // SAFETY: validated against magic and id below.
        let shared = unsafe { self.world.shared::<CallShared>(self.ptr)? };
        if shared.magic.load(Ordering::Acquire) != CALL_MAGIC
            || shared.call_id.load(Ordering::Relaxed) != self.id
            || shared.destroyed.load(Ordering::Acquire) != 0
        {
            return Err(Error::Destroyed);
        }
        Ok(shared)
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// World-unique call id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The member whose handler executes requests.
    pub fn owner(&self) -> Result<FusionId> {
        Ok(FusionId(self.shared()?.owner.load(Ordering::Relaxed)))
    }

    /// Serial of the most recent request.
    pub fn serial(&self) -> Result<u64> {
        Ok(self.shared()?.serial.load(Ordering::Acquire))
    }

    fn require_owner(&self, shared: &CallShared) -> Result<()> {
        if shared.owner.load(Ordering::Relaxed) != self.world.fusion_id().0 {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    /// Grant `bits` to `member`. Owner only.
    pub fn add_permissions(&self, member: FusionId, bits: u32) -> Result<()> {
        let shared = self.shared()?;
        self.require_owner(shared)?;
        let _guard = shared.lock.guard();
        let slot = match shared
            .perms
            .iter()
            .find(|p| p.fusion_id.load(Ordering::Relaxed) == member.0)
        {
            Some(slot) => slot,
            None => {
                let free = shared
                    .perms
                    .iter()
                    .find(|p| p.fusion_id.load(Ordering::Relaxed) == 0)
                    .ok_or_else(|| Error::LimitExceeded(format!("call has {} permission slots", MAX_PERMISSIONS)))?;
                free.fusion_id.store(member.0, Ordering::Relaxed);
                free
            }
        };
        slot.bits.fetch_or(bits, Ordering::Relaxed);
        Ok(())
    }

    /// Whether `member` holds all of `bits`.
    pub fn has_permissions(&self, member: FusionId, bits: u32) -> Result<bool> {
        Ok(self.shared()?.permitted(member, bits))
    }

    /// Limit how many requests `member` may have in flight; 0 removes the
    /// limit. Owner only.
    pub fn set_quota(&self, member: FusionId, limit: u32) -> Result<()> {
        let shared = self.shared()?;
        self.require_owner(shared)?;
        {
            let _guard = shared.lock.guard();
            let slot = match shared
                .quotas
                .iter()
                .find(|q| q.fusion_id.load(Ordering::Relaxed) == member.0)
            {
                Some(slot) => slot,
                None => {
                    let free = shared
                        .quotas
                        .iter()
                        .find(|q| q.fusion_id.load(Ordering::Relaxed) == 0)
                        .ok_or_else(|| Error::LimitExceeded(format!("call has {} quota slots", MAX_QUOTAS)))?;
                    free.fusion_id.store(member.0, Ordering::Relaxed);
                    free
                }
            };
            slot.limit.store(limit, Ordering::Relaxed);
            shared.quota_seq.fetch_add(1, Ordering::Release);
        }
        futex::wake_all(&shared.quota_seq);
        Ok(())
    }

    /// Execute the call.
    ///
    /// Blocking requests return the handler's value; one-way requests
    /// return 0 as soon as they are queued. Fails [`Error::AccessDenied`]
    /// without running the handler if the caller lacks [`EXECUTE`], and
    /// [`Error::Dead`] if the owner leaves the World before answering.
    pub fn execute(&self, flags: CallFlags, call_arg: i32, payload: &[u8]) -> Result<i32> {
        let shared = self.shared()?;
        let me = self.world.fusion_id();
        let owner = FusionId(shared.owner.load(Ordering::Relaxed));

        if owner == me {
            return self.execute_local(shared, flags, call_arg, payload);
        }

        if !shared.permitted(me, EXECUTE) {
            observability::record_call_denied(self.id);
            tracing::debug!(call = self.id, caller = %me, "execute denied");
            return Err(Error::AccessDenied);
        }

        let quota = self.acquire_quota(shared, me, owner)?;
        let serial = shared.serial.fetch_add(1, Ordering::AcqRel) + 1;

        let message = match Message::create(self.world.main_pool(), mailbox::KIND_CALL, me.0, self.ptr, payload) {
            Ok(message) => message,
            Err(e) => {
                if quota {
                    shared.release_slot(me.0);
                }
                return Err(e);
            }
        };
        let mut bits = 0;
        if flags == CallFlags::Oneway {
            bits |= mailbox::FLAG_ONEWAY;
        }
        if quota {
            bits |= mailbox::FLAG_QUOTA;
        }
        let h = message.header;
        h.flags.store(bits, Ordering::Relaxed);
        h.call_arg.store(call_arg, Ordering::Relaxed);
        h.serial.store(serial, Ordering::Relaxed);
        h.call_id.store(self.id, Ordering::Relaxed);

        if let Err(e) = self.world.post(owner, message.ptr) {
            message.discard();
            if quota {
                shared.release_slot(me.0);
            }
            return Err(e);
        }
        if flags == CallFlags::Oneway {
            return Ok(0);
        }

        let metrics = CallMetrics::new(self.id);
        let timer = metrics.start_timer();
        let result = self.await_result(&message, owner);
        drop(timer);
        message.discard();
        if quota {
            // The call may have been destroyed while we waited.
            if let Ok(shared) = self.shared() {
                shared.release_slot(me.0);
            }
        }
        result
    }

    fn execute_local(&self, shared: &CallShared, flags: CallFlags, call_arg: i32, payload: &[u8]) -> Result<i32> {
        let me = self.world.fusion_id();
        let serial = shared.serial.fetch_add(1, Ordering::AcqRel) + 1;

        if flags == CallFlags::Oneway {
            let message = Message::create(self.world.main_pool(), mailbox::KIND_CALL, me.0, self.ptr, payload)?;
            let h = message.header;
            h.flags.store(mailbox::FLAG_ONEWAY, Ordering::Relaxed);
            h.call_arg.store(call_arg, Ordering::Relaxed);
            h.serial.store(serial, Ordering::Relaxed);
            h.call_id.store(self.id, Ordering::Relaxed);
            if let Err(e) = self.world.post(me, message.ptr) {
                message.discard();
                return Err(e);
            }
            return Ok(0);
        }

        let ctx = CallContext {
            caller: me,
            call_arg,
            payload,
            serial,
            call_id: self.id,
        };
        match run_handler(self, &ctx)? {
            CallOutcome::Return(value) => Ok(value),
            CallOutcome::Retain => Err(Error::InvalidArgument(
                "an owner's own blocking request cannot be retained".into(),
            )),
        }
    }

    fn acquire_quota(&self, shared: &CallShared, me: FusionId, owner: FusionId) -> Result<bool> {
        let poll = self.world.config().liveness_poll;
        loop {
            let seq = match shared.try_take_slot(me) {
                Ok(taken) => return Ok(taken),
                Err(seq) => seq,
            };
            futex::wait(&shared.quota_seq, seq, Some(poll));
            self.shared()?;
            if !self.world.is_alive(owner) {
                return Err(Error::Dead);
            }
        }
    }

    fn await_result(&self, message: &Message<'_>, owner: FusionId) -> Result<i32> {
        let poll = self.world.config().liveness_poll;
        let h = message.header;
        loop {
            match h.state.load(Ordering::Acquire) {
                mailbox::STATE_DONE => break,
                mailbox::STATE_PENDING => {}
                _ => return Err(Error::Dead),
            }
            futex::wait(&h.state, mailbox::STATE_PENDING, Some(poll));
            if h.state.load(Ordering::Acquire) == mailbox::STATE_PENDING && !self.world.is_alive(owner) {
                // Whoever reclaims the dead owner's mailbox frees it.
                let abandoned = h
                    .state
                    .compare_exchange(
                        mailbox::STATE_PENDING,
                        mailbox::STATE_ABANDONED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if abandoned {
                    tracing::debug!(call = self.id, owner = %owner, "owner died during call");
                    return Err(Error::Dead);
                }
            }
        }

        let result = h.result.load(Ordering::Relaxed);
        match Error::from_code(result, self.world.results()) {
            Some(e) => Err(e),
            None => Ok(h.ret_val.load(Ordering::Relaxed)),
        }
    }

    /// Answer a request the handler retained. Owner only.
    pub fn return_value(&self, serial: u64, ret_val: i32) -> Result<()> {
        let shared = self.shared()?;
        self.require_owner(shared)?;
        let ptr = locked(&self.world.registries().retained)
            .remove(&(self.id, serial))
            .ok_or_else(|| Error::ItemNotFound(format!("retained request {} of call {}", serial, self.id)))?;
        let message = Message::open(self.world.main_pool(), ptr)?;
        if !message.complete(code::OK, ret_val) {
            message.free()?;
        }
        Ok(())
    }

    /// Destroy the call. Retained and later requests fail
    /// [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let shared = self.shared()?;
        {
            let _guard = shared.lock.guard();
            if shared.destroyed.swap(1, Ordering::AcqRel) != 0 {
                return Err(Error::Destroyed);
            }
            shared.quota_seq.fetch_add(1, Ordering::Release);
        }
        futex::wake_all(&shared.quota_seq);

        let owner = FusionId(shared.owner.load(Ordering::Relaxed));
        if owner == self.world.fusion_id() {
            forget_call(&self.world, self.id);
        } else {
            self.notify_owner(owner);
        }

        shared.magic.store(0, Ordering::Release);
        self.world.free(self.ptr)?;
        tracing::debug!(call = self.id, "destroyed call");
        Ok(())
    }

    /// Have the owner drop its handler and fail what it retained.
    fn notify_owner(&self, owner: FusionId) {
        let me = self.world.fusion_id();
        let message = match Message::create(self.world.main_pool(), mailbox::KIND_CALL_DESTROYED, me.0, self.ptr, &[]) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(call = self.id, error = %e, "cannot tell owner about destroyed call");
                return;
            }
        };
        message.header.call_id.store(self.id, Ordering::Relaxed);
        let ptr = message.ptr;
        if let Err(e) = self.world.post(owner, ptr) {
            tracing::debug!(call = self.id, owner = %owner, error = %e, "owner of destroyed call is gone");
            message.discard();
        }
    }
}

impl fmt::Debug for FusionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionCall")
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Check access and run the registered handler of `call`.
fn run_handler(call: &FusionCall, ctx: &CallContext<'_>) -> Result<CallOutcome> {
    let shared = call.shared()?;
    if !shared.permitted(ctx.caller, EXECUTE) {
        observability::record_call_denied(call.id);
        return Err(Error::AccessDenied);
    }
    let handler = locked(&call.world.registries().calls)
        .get(&call.id)
        .cloned()
        .ok_or(Error::Destroyed)?;

    CallMetrics::new(call.id).record_executed();
    handler.handle(ctx)
}

/// Run a request from the mailbox of this member.
pub(crate) fn handle_request(world: &World, message: Message<'_>) {
    let h = message.header;
    let flags = h.flags.load(Ordering::Relaxed);
    let caller = h.sender.load(Ordering::Relaxed);
    let serial = h.serial.load(Ordering::Relaxed);
    let oneway = flags & mailbox::FLAG_ONEWAY != 0;
    // `shared()` rejects the target once it no longer holds this call id.
    let call = FusionCall {
        world: world.clone(),
        ptr: h.target.load(),
        id: h.call_id.load(Ordering::Relaxed),
    };

    let outcome = message.payload().and_then(|payload| {
        let ctx = CallContext {
            caller: FusionId(caller),
            call_arg: h.call_arg.load(Ordering::Relaxed),
            payload,
            serial,
            call_id: call.id,
        };
        run_handler(&call, &ctx)
    });

    if oneway {
        if flags & mailbox::FLAG_QUOTA != 0 {
            release_quota(world.main_pool(), call.ptr, call.id, caller);
        }
        match outcome {
            Ok(CallOutcome::Return(_)) => {}
            Ok(CallOutcome::Retain) => tracing::trace!(caller, "one-way request retained, nothing to answer"),
            Err(e) => tracing::debug!(call = call.id, caller, error = %e, "one-way request failed"),
        }
        message.discard();
        return;
    }

    let (result, ret_val) = match outcome {
        Ok(CallOutcome::Return(value)) => (code::OK, value),
        Ok(CallOutcome::Retain) if call.shared().is_ok() => {
            locked(&world.registries().retained).insert((call.id, serial), message.ptr);
            return;
        }
        Ok(CallOutcome::Retain) => (code::DESTROYED, 0),
        Err(e) => (e.code(), 0),
    };
    if !message.complete(result, ret_val) {
        message.discard();
    }
}

/// Handle notice that another member destroyed a call owned here.
pub(crate) fn handle_destroyed(world: &World, message: Message<'_>) {
    let call_id = message.header.call_id.load(Ordering::Relaxed);
    forget_call(world, call_id);
    tracing::debug!(call = call_id, "released handler of destroyed call");
    message.discard();
}

/// Drop the handler of a destroyed call and fail its retained requests.
fn forget_call(world: &World, call_id: u32) {
    let registries = world.registries();
    // Dropped outside the registry lock.
    let handler = locked(&registries.calls).remove(&call_id);
    drop(handler);

    let retained: Vec<ShmPtr> = {
        let mut retained = locked(&registries.retained);
        let keys: Vec<(u32, u64)> = retained.keys().filter(|(id, _)| *id == call_id).copied().collect();
        keys.into_iter().filter_map(|k| retained.remove(&k)).collect()
    };
    for ptr in retained {
        if let Ok(message) = Message::open(world.main_pool(), ptr) {
            if !message.complete(code::DESTROYED, 0) {
                message.discard();
            }
        }
    }
}

/// Give back the quota slot `caller` holds on call `call_id` at `call`.
pub(crate) fn release_quota(main: &SharedMemoryPool, call: ShmPtr, call_id: u32, caller: u32) {
    // SAFETY: checked for the call magic and id before use.
    let Ok(shared) = (unsafe { main.get::<CallShared>(call) }) else {
        return;
    };
    if shared.magic.load(Ordering::Acquire) == CALL_MAGIC && shared.call_id.load(Ordering::Relaxed) == call_id {
        shared.release_slot(caller);
    }
}

/// Destroy a call by pointer, from whichever member.
pub(crate) fn destroy_shared(world: &World, ptr: ShmPtr) -> Result<()> {
    FusionCall::open(world, ptr)?.destroy()
}
