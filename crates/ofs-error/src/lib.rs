#![forbid(unsafe_code)]
//! Error types for OakFS.
//!
//! # Error Taxonomy
//!
//! OakFS uses the same two-layer model for every crate:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ofs-types` | Byte-level layout violations while decoding a node or item |
//! | Runtime | `OfsError` | `ofs-error` (this crate) | Result codes returned by the tree, journal and allocator |
//!
//! `ofs-error` does not depend on `ofs-types`. A `ParseError` is converted where
//! the context is known: while reading a live node it becomes
//! `Corruption { block, detail }`, while parsing bootstrap data (the system
//! chunk array, configuration) it becomes `Format(detail)`.
//!
//! ## Engine result codes
//!
//! | Condition | Variant | errno |
//! |-----------|---------|-------|
//! | search found no qualifying slot, iterator exhausted, no sibling | `NotFound` | `ENOENT` |
//! | copy/insert/remove size out of range, duplicate key, bad index | `BadValue` | `EINVAL` |
//! | zero-length free-extent candidate | `BadData` | `EBADMSG` |
//! | operation on an unbound chunk, node or transaction | `NotInitialized` | `ENXIO` |
//! | call on a stopped iterator | `Interrupted` | `EINTR` |
//! | logical address with no chunk mapping | `Unmapped` | `EIO` |
//! | device read or write failed | `Io` | raw errno or `EIO` |
//! | payload copy could not be allocated | `NoMemory` | `ENOMEM` |
//! | node header failed validation | `Corruption` | `EIO` |
//! | bootstrap data malformed | `Format` | `EINVAL` |
//! | node size or chunk geometry rejected | `InvalidGeometry` | `EINVAL` |
//! | metadata range exhausted | `NoSpace` | `ENOSPC` |
//! | split would exceed eight levels | `TreeTooDeep` | `EOVERFLOW` |
//! | block already bound writable by another transaction | `Busy` | `EBUSY` |
//!
//! Callers above the engine treat `NotFound` as "absent" and everything else
//! as a failure of the requested operation. Use [`OfsError::is_not_found`]
//! rather than matching the variant so the contract stays in one place.

use thiserror::Error;

/// Unified error type for all OakFS engine operations.
#[derive(Debug, Error)]
pub enum OfsError {
    /// No entry satisfies the requested search, or a cursor ran off the tree.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// A request whose arguments cannot be satisfied by the target node.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Derived data is malformed, e.g. a zero-length free extent.
    #[error("bad data: {0}")]
    BadData(String),

    /// The object was used before being bound to its backing state.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// The iterator was stopped because its tree was torn down.
    #[error("operation interrupted")]
    Interrupted,

    /// No chunk maps this logical address.
    #[error("logical address {logical:#x} is not mapped")]
    Unmapped { logical: u64 },

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation of a payload copy or node structure failed.
    #[error("out of memory")]
    NoMemory,

    /// A node read from the cache did not pass header validation.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Bootstrap structures (system chunk array, config) are malformed.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Node size or chunk geometry outside the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The node allocator has no metadata space left.
    #[error("no space left on device")]
    NoSpace,

    /// A root split would grow the tree past its level ceiling.
    #[error("tree depth {depth} exceeds the maximum")]
    TreeTooDeep { depth: usize },

    /// The block is already bound writable under a different transaction.
    #[error("block {block} is busy in another transaction")]
    Busy { block: u64 },
}

impl OfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: adding a variant is a compile error until
    /// its errno is assigned here.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::BadValue(_) | Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::BadData(_) => libc::EBADMSG,
            Self::NotInitialized(_) => libc::ENXIO,
            Self::Interrupted => libc::EINTR,
            Self::Unmapped { .. } | Self::Corruption { .. } => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoMemory => libc::ENOMEM,
            Self::NoSpace => libc::ENOSPC,
            Self::TreeTooDeep { .. } => libc::EOVERFLOW,
            Self::Busy { .. } => libc::EBUSY,
        }
    }

    /// `true` for the "absent" signal callers are expected to handle.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `OfsError`.
pub type Result<T> = std::result::Result<T, OfsError>;
