//! Publish/subscribe notification delivery.
//!
//! A [`Reactor`] lives in the main pool. Local reactions are closures
//! registered in one process; global reactions are `(index, context)` pairs
//! stored in the reactor itself and resolved in every receiving process
//! through that process's global-reaction registry.
//!
//! [`Reactor::dispatch`] runs the globals and then the local reactions of
//! the calling process synchronously, then posts a copy of the notification
//! to every other member that attached to the reactor. Their dispatcher
//! threads run globals and locals the same way. No lock is held while a
//! reaction runs, so reactions may call back into any Fusion API.

use crate::error::{Error, Result};
use crate::futex::RawLock;
use crate::mailbox::{self, Message};
use crate::memory::ShmPtr;
use crate::observability;
use crate::world::{FusionId, World, locked};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

/// Maximum number of global reactions per reactor.
pub const MAX_GLOBALS: usize = 8;
/// Maximum number of members attached to one reactor.
pub const MAX_ATTACHED: usize = 32;

/// Marks a free global slot; not a valid global index.
pub(crate) const EMPTY_GLOBAL: u32 = u32::MAX;

const REACTOR_MAGIC: u64 = 0x4655_5352_4541_4331; // "FUSREAC1"

/// What a reaction wants done after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionResult {
    /// Keep the reaction attached.
    Ok,
    /// Detach this reaction.
    Remove,
    /// Stop delivering this notification to further reactions.
    Drop,
}

/// Handle of an attached local reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactionId(u64);

pub(crate) type LocalReaction = Arc<dyn Fn(&[u8]) -> ReactionResult + Send + Sync>;
pub(crate) type GlobalReaction = Arc<dyn Fn(&[u8], u64) -> ReactionResult + Send + Sync>;

#[repr(C)]
struct GlobalSlot {
    index: AtomicU32,
    _reserved: AtomicU32,
    ctx: AtomicU64,
}

#[repr(C)]
pub(crate) struct ReactorShared {
    magic: AtomicU64,
    id: AtomicU32,
    destroyed: AtomicU32,
    msg_size: AtomicU64,
    lock: RawLock,
    dispatches: AtomicU64,
    globals: [GlobalSlot; MAX_GLOBALS],
    /// FusionIDs of members with reactions on this reactor; 0 is free.
    attached: [AtomicU32; MAX_ATTACHED],
}

impl ReactorShared {
    fn join(&self, member: FusionId) -> Result<()> {
        let _guard = self.lock.guard();
        if self.attached.iter().any(|a| a.load(Ordering::Relaxed) == member.0) {
            return Ok(());
        }
        let slot = self
            .attached
            .iter()
            .find(|a| a.load(Ordering::Relaxed) == 0)
            .ok_or_else(|| Error::LimitExceeded(format!("reactor has {} members", MAX_ATTACHED)))?;
        slot.store(member.0, Ordering::Relaxed);
        Ok(())
    }

    fn leave(&self, member: FusionId) {
        let _guard = self.lock.guard();
        for slot in &self.attached {
            if slot.load(Ordering::Relaxed) == member.0 {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }

    fn remove_global(&self, index: u32, ctx: u64) -> bool {
        let _guard = self.lock.guard();
        for slot in &self.globals {
            if slot.index.load(Ordering::Relaxed) == index && slot.ctx.load(Ordering::Relaxed) == ctx {
                slot.index.store(EMPTY_GLOBAL, Ordering::Relaxed);
                slot.ctx.store(0, Ordering::Relaxed);
                return true;
            }
        }
        false
    }
}

/// A notification channel shared by all members.
///
/// # Example
///
/// ```rust
/// use fusion::{Reactor, ReactionResult, World, WorldConfig};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let world = World::enter(WorldConfig::local()).unwrap();
/// let reactor = Reactor::new(&world, 16).unwrap();
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// reactor.attach(move |msg| {
///     counter.fetch_add(msg.len(), Ordering::SeqCst);
///     ReactionResult::Ok
/// }).unwrap();
///
/// reactor.dispatch(b"hello", true).unwrap();
/// assert_eq!(seen.load(Ordering::SeqCst), 5);
/// ```
#[derive(Clone)]
pub struct Reactor {
    world: World,
    ptr: ShmPtr,
    id: u32,
}

impl Reactor {
    /// Create a reactor for notifications of at most `msg_size` bytes.
    pub fn new(world: &World, msg_size: usize) -> Result<Reactor> {
        let id = world.next_reactor_id()?;
        let ptr = world.alloc(std::mem::size_of::<ReactorShared>())?;
        // SAFETY: freshly zeroed allocation of the right size.
        let shared = unsafe { world.shared::<ReactorShared>(ptr)? };
        shared.id.store(id, Ordering::Relaxed);
        shared.msg_size.store(msg_size as u64, Ordering::Relaxed);
        for slot in &shared.globals {
            slot.index.store(EMPTY_GLOBAL, Ordering::Relaxed);
        }
        shared.magic.store(REACTOR_MAGIC, Ordering::Release);

        tracing::trace!(reactor = id, msg_size, "created reactor");
        Ok(Reactor {
            world: world.clone(),
            ptr,
            id,
        })
    }

    /// Open a reactor created by any member.
    pub fn open(world: &World, ptr: ShmPtr) -> Result<Reactor> {
        // SAFETY: checked for the reactor magic before use.
        let shared = unsafe { world.shared::<ReactorShared>(ptr)? };
        if shared.magic.load(Ordering::Acquire) != REACTOR_MAGIC {
            return Err(Error::InvalidSegment(format!("{:?} is not a reactor", ptr)));
        }
        Ok(Reactor {
            world: world.clone(),
            ptr,
            id: shared.id.load(Ordering::Relaxed),
        })
    }

    fn shared(&self) -> Result<&ReactorShared> {
        // SAFETY: validated against magic and id below.
        let shared = unsafe { self.world.shared::<ReactorShared>(self.ptr)? };
        if shared.magic.load(Ordering::Acquire) != REACTOR_MAGIC
            || shared.id.load(Ordering::Relaxed) != self.id
        {
            return Err(Error::Destroyed);
        }
        if shared.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed);
        }
        Ok(shared)
    }

    /// Shared pointer to hand to other members.
    pub fn ptr(&self) -> ShmPtr {
        self.ptr
    }

    /// World-unique reactor id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Maximum notification size.
    pub fn msg_size(&self) -> Result<usize> {
        Ok(self.shared()?.msg_size.load(Ordering::Relaxed) as usize)
    }

    /// Number of dispatches so far, across all members.
    pub fn dispatch_count(&self) -> Result<u64> {
        Ok(self.shared()?.dispatches.load(Ordering::Relaxed))
    }

    /// Attach a local reaction. Reactions run in attach order.
    pub fn attach<F>(&self, reaction: F) -> Result<ReactionId>
    where
        F: Fn(&[u8]) -> ReactionResult + Send + Sync + 'static,
    {
        let shared = self.shared()?;
        shared.join(self.world.fusion_id())?;

        let registries = self.world.registries();
        let id = ReactionId(registries.next_reaction.fetch_add(1, Ordering::Relaxed) + 1);
        locked(&registries.reactions)
            .entry(self.id)
            .or_default()
            .push((id, Arc::new(reaction)));
        Ok(id)
    }

    /// Detach a local reaction.
    pub fn detach(&self, reaction: ReactionId) -> Result<()> {
        let now_empty = {
            let mut reactions = locked(&self.world.registries().reactions);
            let list = reactions
                .get_mut(&self.id)
                .ok_or_else(|| Error::ItemNotFound(format!("{:?}", reaction)))?;
            let before = list.len();
            list.retain(|(id, _)| *id != reaction);
            if list.len() == before {
                return Err(Error::ItemNotFound(format!("{:?}", reaction)));
            }
            let empty = list.is_empty();
            if empty {
                reactions.remove(&self.id);
            }
            empty
        };
        if now_empty {
            if let Ok(shared) = self.shared() {
                shared.leave(self.world.fusion_id());
            }
        }
        Ok(())
    }

    /// Add a global reaction: every receiving process calls its registered
    /// reaction `index` with `ctx`.
    pub fn attach_global(&self, index: u32, ctx: u64) -> Result<()> {
        if index == EMPTY_GLOBAL {
            return Err(Error::InvalidArgument(format!("global index {} is reserved", index)));
        }
        let shared = self.shared()?;
        shared.join(self.world.fusion_id())?;

        let _guard = shared.lock.guard();
        let slot = shared
            .globals
            .iter()
            .find(|s| s.index.load(Ordering::Relaxed) == EMPTY_GLOBAL)
            .ok_or_else(|| Error::LimitExceeded(format!("reactor has {} globals", MAX_GLOBALS)))?;
        slot.ctx.store(ctx, Ordering::Relaxed);
        slot.index.store(index, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a global reaction.
    pub fn detach_global(&self, index: u32, ctx: u64) -> Result<()> {
        if self.shared()?.remove_global(index, ctx) {
            Ok(())
        } else {
            Err(Error::ItemNotFound(format!("global reaction {} ({})", index, ctx)))
        }
    }

    /// Publish a notification.
    ///
    /// Reactions of the calling process run before this returns; unless
    /// `self_only` is set, every other attached member receives it through
    /// its dispatcher. A reaction returning [`ReactionResult::Drop`] stops
    /// the round, including the fan-out to other members.
    pub fn dispatch(&self, msg: &[u8], self_only: bool) -> Result<()> {
        let shared = self.shared()?;
        let msg_size = shared.msg_size.load(Ordering::Relaxed) as usize;
        if msg.len() > msg_size {
            return Err(Error::InvalidArgument(format!(
                "notification of {} bytes exceeds reactor size {}",
                msg.len(),
                msg_size
            )));
        }
        shared.dispatches.fetch_add(1, Ordering::Relaxed);

        let (delivered, dropped) = deliver_locally(&self.world, shared, self.id, msg);
        observability::record_reactor_deliveries(self.id, delivered);
        if dropped || self_only {
            return Ok(());
        }

        let me = self.world.fusion_id();
        let targets: Vec<FusionId> = {
            let _guard = shared.lock.guard();
            shared
                .attached
                .iter()
                .map(|a| a.load(Ordering::Relaxed))
                .filter(|&id| id != 0 && id != me.0)
                .map(FusionId)
                .collect()
        };

        for target in targets {
            let message = Message::create(
                self.world.main_pool(),
                mailbox::KIND_REACTION,
                me.0,
                self.ptr,
                msg,
            )?;
            message.header.serial.store(self.id as u64, Ordering::Relaxed);
            let ptr = message.ptr;
            match self.world.post(target, ptr) {
                Ok(()) => {}
                Err(Error::Dead) => {
                    message.discard();
                    tracing::debug!(reactor = self.id, member = target.0, "dropping departed member");
                    shared.leave(target);
                }
                Err(e) => {
                    message.discard();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Whether the reactor was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.shared().is_err()
    }

    /// Destroy the reactor. Later dispatches fail [`Error::Destroyed`] and
    /// queued deliveries are dropped.
    pub fn destroy(&self) -> Result<()> {
        let shared = self.shared()?;
        {
            let _guard = shared.lock.guard();
            if shared.destroyed.swap(1, Ordering::AcqRel) != 0 {
                return Err(Error::Destroyed);
            }
            shared.magic.store(0, Ordering::Release);
        }
        locked(&self.world.registries().reactions).remove(&self.id);
        self.world.free(self.ptr)?;
        tracing::trace!(reactor = self.id, "destroyed reactor");
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Run globals, then local reactions of this process.
///
/// Returns how many reactions ran and whether one of them dropped the
/// notification.
fn deliver_locally(world: &World, shared: &ReactorShared, reactor_id: u32, msg: &[u8]) -> (usize, bool) {
    let globals: Vec<(u32, u64)> = {
        let _guard = shared.lock.guard();
        shared
            .globals
            .iter()
            .map(|s| (s.index.load(Ordering::Relaxed), s.ctx.load(Ordering::Relaxed)))
            .filter(|(index, _)| *index != EMPTY_GLOBAL)
            .collect()
    };
    let registries = world.registries();
    let resolved: Vec<(u32, u64, Option<GlobalReaction>)> = {
        let table = registries.globals.read().unwrap_or_else(PoisonError::into_inner);
        globals
            .into_iter()
            .map(|(index, ctx)| (index, ctx, table.get(&index).cloned()))
            .collect()
    };

    let mut delivered = 0;
    for (index, ctx, reaction) in resolved {
        let Some(reaction) = reaction else {
            tracing::trace!(reactor = reactor_id, index, "global reaction not registered here");
            continue;
        };
        delivered += 1;
        match reaction(msg, ctx) {
            ReactionResult::Ok => {}
            ReactionResult::Remove => {
                shared.remove_global(index, ctx);
            }
            ReactionResult::Drop => return (delivered, true),
        }
    }

    let locals = locked(&registries.reactions)
        .get(&reactor_id)
        .cloned()
        .unwrap_or_default();
    let mut removed = Vec::new();
    let mut dropped = false;
    for (id, reaction) in locals {
        delivered += 1;
        match reaction(msg) {
            ReactionResult::Ok => {}
            ReactionResult::Remove => removed.push(id),
            ReactionResult::Drop => {
                dropped = true;
                break;
            }
        }
    }

    if !removed.is_empty() {
        let now_empty = {
            let mut reactions = locked(&registries.reactions);
            match reactions.get_mut(&reactor_id) {
                Some(list) => {
                    list.retain(|(id, _)| !removed.contains(id));
                    let empty = list.is_empty();
                    if empty {
                        reactions.remove(&reactor_id);
                    }
                    empty
                }
                None => false,
            }
        };
        if now_empty {
            shared.leave(world.fusion_id());
        }
    }

    (delivered, dropped)
}

/// Deliver a notification posted by another member.
pub(crate) fn deliver(world: &World, message: &Message<'_>) -> Result<()> {
    let ptr = message.header.target.load();
    let id = message.header.serial.load(Ordering::Relaxed) as u32;
    // SAFETY: checked against magic and id before use.
    let shared = unsafe { world.shared::<ReactorShared>(ptr)? };
    if shared.magic.load(Ordering::Acquire) != REACTOR_MAGIC
        || shared.id.load(Ordering::Relaxed) != id
        || shared.destroyed.load(Ordering::Acquire) != 0
    {
        locked(&world.registries().reactions).remove(&id);
        return Err(Error::Destroyed);
    }

    let (delivered, _) = deliver_locally(world, shared, id, message.payload()?);
    observability::record_reactor_deliveries(id, delivered);
    Ok(())
}
