//! # Fusion
//!
//! A multi-process object runtime built on shared memory.
//!
//! Processes that enter the same [`World`] share a main memory pool and can
//! build on it:
//!
//! - **Pools**: named shared-memory arenas addressed by [`ShmPtr`](memory::ShmPtr)
//! - **Skirmish**: a distributed recursive mutex with wait/notify
//! - **Objects**: pooled, reference-counted shared objects with a lifecycle
//! - **Reactors**: notifications delivered in-process and across processes
//! - **Calls**: request/response execution in the owning process
//! - **Properties**: lease/purchase arbitration of exclusive resources
//! - **Serials**: overflow-safe version counters with wait/notify
//!
//! Blocking operations sleep on futex words inside the shared memory, so
//! processes wake each other without any broker.
//!
//! ## Quick Start
//!
//! ```rust
//! use fusion::prelude::*;
//!
//! let world = World::enter(WorldConfig::local())?;
//!
//! let lock = Skirmish::new(&world, "layers")?;
//! {
//!     let _guard = lock.guard()?;
//!     // critical section
//! }
//!
//! let windows = ObjectPool::create(&world, "windows", 64, 16, |_, _| {})?;
//! let window = windows.new_object()?;
//! window.activate()?;
//! assert_eq!(window.id(), 1);
//! window.unref()?;
//! # Ok::<(), fusion::Error>(())
//! ```
//!
//! Processes on one machine join the same World by using the same
//! [`WorldConfig::world_index`] and `shm_dir`; see [`WorldConfig::new`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod call;
pub mod config;
pub mod error;
pub mod futex;
mod mailbox;
pub mod memory;
pub mod object;
pub mod observability;
pub mod property;
pub mod reactor;
pub mod serial;
pub mod skirmish;
pub mod world;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::call::{CallContext, CallFlags, CallHandler, CallOutcome, FusionCall, TaggedHandler};
    pub use crate::config::{MemoryPolicy, WorldConfig};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{SharedMemoryPool, ShmPtr};
    pub use crate::object::{Object, ObjectPool, ObjectState};
    pub use crate::property::{Property, PropertyState};
    pub use crate::reactor::{ReactionResult, Reactor};
    pub use crate::serial::{Serial, SerialStamp, SharedSerial};
    pub use crate::skirmish::{Skirmish, SkirmishGuard};
    pub use crate::world::{FusionId, World};
}

pub use call::{CallContext, CallFlags, CallHandler, CallOutcome, EXECUTE, FusionCall, TaggedHandler};
pub use config::{MemoryPolicy, WorldConfig};
pub use error::{Error, Result, ResultRegistry};
pub use object::{Destructor, Object, ObjectPool, ObjectState};
pub use property::{Property, PropertyState};
pub use reactor::{ReactionId, ReactionResult, Reactor};
pub use serial::{Serial, SerialStamp, SharedSerial};
pub use skirmish::{Skirmish, SkirmishGuard};
pub use world::{FusionId, World};
