//! Error types for Fusion.
//!
//! Every error has a stable numeric code so it can cross a process boundary
//! inside a call response record. Codes below [`ResultRegistry::EXTENSION_BASE`]
//! belong to Fusion itself; consumers register their own ranges above it.

use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

/// Result type alias using Fusion's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fusion operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Contended, or already in the desired state. Expected to be retried.
    #[error("resource busy")]
    Busy,

    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,

    /// The handle refers to an object or member that is gone.
    #[error("object or member is dead")]
    Dead,

    /// A named item does not exist.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// An id was never issued.
    #[error("id not found: {0}")]
    IdNotFound(u32),

    /// The shared pool cannot satisfy an allocation.
    #[error("out of shared memory: {requested} bytes requested")]
    NoSharedMemory {
        /// Size of the failed request in bytes.
        requested: usize,
    },

    /// A process-local allocation failed.
    #[error("out of local memory")]
    NoLocalMemory,

    /// The caller lacks the permission for this operation.
    #[error("access denied")]
    AccessDenied,

    /// The primitive was destroyed.
    #[error("destroyed")]
    Destroyed,

    /// The caller does not hold the lock or lease it tries to release.
    #[error("caller is not the holder")]
    NotHolder,

    /// A fixed-size shared table is full.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Invalid argument or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shared memory does not contain what the handle claims.
    #[error("invalid shared segment: {0}")]
    InvalidSegment(String),

    /// An error code returned by a call handler in another process.
    #[error("remote error {code:#x}: {description}")]
    Remote {
        /// Numeric result code.
        code: u32,
        /// Description from the result registry.
        description: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Numeric result codes for the core taxonomy.
pub mod code {
    /// Success.
    pub const OK: u32 = 0;
    /// See [`super::Error::Busy`].
    pub const BUSY: u32 = 1;
    /// See [`super::Error::Timeout`].
    pub const TIMEOUT: u32 = 2;
    /// See [`super::Error::Dead`].
    pub const DEAD: u32 = 3;
    /// See [`super::Error::ItemNotFound`].
    pub const ITEM_NOT_FOUND: u32 = 4;
    /// See [`super::Error::IdNotFound`].
    pub const ID_NOT_FOUND: u32 = 5;
    /// See [`super::Error::NoSharedMemory`].
    pub const NO_SHARED_MEMORY: u32 = 6;
    /// See [`super::Error::NoLocalMemory`].
    pub const NO_LOCAL_MEMORY: u32 = 7;
    /// See [`super::Error::AccessDenied`].
    pub const ACCESS_DENIED: u32 = 8;
    /// See [`super::Error::Destroyed`].
    pub const DESTROYED: u32 = 9;
    /// See [`super::Error::NotHolder`].
    pub const NOT_HOLDER: u32 = 10;
    /// See [`super::Error::LimitExceeded`].
    pub const LIMIT_EXCEEDED: u32 = 11;
    /// See [`super::Error::InvalidArgument`].
    pub const INVALID_ARGUMENT: u32 = 12;
    /// See [`super::Error::InvalidSegment`].
    pub const INVALID_SEGMENT: u32 = 13;
    /// I/O and errno failures.
    pub const FAILURE: u32 = 14;
}

impl Error {
    /// The numeric code carried across process boundaries.
    pub fn code(&self) -> u32 {
        match self {
            Error::Busy => code::BUSY,
            Error::Timeout => code::TIMEOUT,
            Error::Dead => code::DEAD,
            Error::ItemNotFound(_) => code::ITEM_NOT_FOUND,
            Error::IdNotFound(_) => code::ID_NOT_FOUND,
            Error::NoSharedMemory { .. } => code::NO_SHARED_MEMORY,
            Error::NoLocalMemory => code::NO_LOCAL_MEMORY,
            Error::AccessDenied => code::ACCESS_DENIED,
            Error::Destroyed => code::DESTROYED,
            Error::NotHolder => code::NOT_HOLDER,
            Error::LimitExceeded(_) => code::LIMIT_EXCEEDED,
            Error::InvalidArgument(_) => code::INVALID_ARGUMENT,
            Error::InvalidSegment(_) => code::INVALID_SEGMENT,
            Error::Remote { code, .. } => *code,
            Error::Io(_) | Error::System(_) => code::FAILURE,
        }
    }

    /// Rebuild an error from a code received from another process.
    ///
    /// Returns `None` for [`code::OK`].
    pub fn from_code(value: u32, registry: &ResultRegistry) -> Option<Self> {
        let err = match value {
            code::OK => return None,
            code::BUSY => Error::Busy,
            code::TIMEOUT => Error::Timeout,
            code::DEAD => Error::Dead,
            code::ITEM_NOT_FOUND => Error::ItemNotFound("remote".into()),
            code::ID_NOT_FOUND => Error::IdNotFound(0),
            code::NO_SHARED_MEMORY => Error::NoSharedMemory { requested: 0 },
            code::NO_LOCAL_MEMORY => Error::NoLocalMemory,
            code::ACCESS_DENIED => Error::AccessDenied,
            code::DESTROYED => Error::Destroyed,
            code::NOT_HOLDER => Error::NotHolder,
            code::LIMIT_EXCEEDED => Error::LimitExceeded("remote".into()),
            code::INVALID_ARGUMENT => Error::InvalidArgument("remote".into()),
            code::INVALID_SEGMENT => Error::InvalidSegment("remote".into()),
            other => Error::Remote {
                code: other,
                description: registry.describe(other),
            },
        };
        Some(err)
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Timeout)
    }
}

/// Maps result codes to human readable descriptions.
///
/// One registry lives in every [`World`](crate::World) handle. The core codes
/// are pre-registered; consumers add their own ranges with [`register`].
///
/// [`register`]: ResultRegistry::register
#[derive(Debug)]
pub struct ResultRegistry {
    ranges: RwLock<BTreeMap<u32, Vec<String>>>,
}

impl ResultRegistry {
    /// First code available to consumers.
    pub const EXTENSION_BASE: u32 = 0x1000;

    /// A registry holding the core codes.
    pub fn new() -> Self {
        let core = [
            "OK",
            "BUSY",
            "TIMEOUT",
            "DEAD",
            "ITEMNOTFOUND",
            "IDNOTFOUND",
            "NOSHAREDMEMORY",
            "NOLOCALMEMORY",
            "ACCESSDENIED",
            "DESTROYED",
            "NOTHOLDER",
            "LIMITEXCEEDED",
            "INVALIDARGUMENT",
            "INVALIDSEGMENT",
            "FAILURE",
        ];
        let mut ranges = BTreeMap::new();
        ranges.insert(0, core.iter().map(|s| s.to_string()).collect());
        Self {
            ranges: RwLock::new(ranges),
        }
    }

    /// Register descriptions for the codes `base..base + names.len()`.
    ///
    /// Fails if `base` is below [`Self::EXTENSION_BASE`] or the range overlaps
    /// an existing one.
    pub fn register(&self, base: u32, names: &[&str]) -> Result<()> {
        if base < Self::EXTENSION_BASE {
            return Err(Error::InvalidArgument(format!(
                "result base {:#x} is reserved",
                base
            )));
        }
        let end = base
            .checked_add(names.len() as u32)
            .ok_or_else(|| Error::InvalidArgument("result range overflows".into()))?;

        let mut ranges = self
            .ranges
            .write()
            .map_err(|_| Error::InvalidArgument("result registry poisoned".into()))?;
        let overlaps = ranges
            .iter()
            .any(|(&b, v)| base < b + v.len() as u32 && b < end);
        if overlaps {
            return Err(Error::InvalidArgument(format!(
                "result range {:#x}..{:#x} overlaps",
                base, end
            )));
        }
        ranges.insert(base, names.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    /// Description for `code`, or a generic placeholder.
    pub fn describe(&self, code: u32) -> String {
        let Ok(ranges) = self.ranges.read() else {
            return format!("result {:#x}", code);
        };
        ranges
            .range(..=code)
            .next_back()
            .and_then(|(&base, names)| names.get((code - base) as usize))
            .cloned()
            .unwrap_or_else(|| format!("result {:#x}", code))
    }
}

impl Default for ResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}
