#![forbid(unsafe_code)]
//! Error types for kmem.
//!
//! # Error Taxonomy
//!
//! The system distinguishes three failure classes, and only one of them
//! is an error value:
//!
//! | Class | Mechanism | Examples |
//! |-------|-----------|----------|
//! | Recoverable resource condition | [`KmemError`] | page pool exhausted, device transfer fault |
//! | Caller-contract violation | `panic!` | unpin of a non-resident block, `ref_count` underflow, free of a misaligned or out-of-range address |
//! | Fixed-pool invariant violation | `panic!` | no unreferenced buffer anywhere in the cache |
//!
//! Invariant violations indicate a bug in a trusted caller or a
//! misconfigured pool, not a runtime condition; they never propagate as
//! `Result`s. The single expected steady-state failure is
//! [`KmemError::OutOfPages`], which callers handle as normal control
//! flow.
//!
//! ## Mapping Policy: `ConfigError` → `KmemError`
//!
//! `kmem-error` is intentionally independent of `kmem-types` to avoid
//! cyclic dependencies. Rejected geometry (`ConfigError`) is converted
//! to [`KmemError::Config`] by the component crates at their
//! construction boundaries, carrying the rendered message.
//!
//! ## Device faults
//!
//! A failed block transfer surfaces as [`KmemError::Device`] with the
//! buffer identity attached. No retry is attempted anywhere in this
//! core; retry policy belongs to the driver. Callers treat the error as
//! fatal to the operation in progress.

use thiserror::Error;

/// Unified error type for all kmem operations.
#[derive(Debug, Error)]
pub enum KmemError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block transfer to or from the device failed.
    #[error("device {device} block {block} transfer failed: {detail}")]
    Device {
        device: u32,
        block: u64,
        detail: String,
    },

    /// Every free list is empty.
    ///
    /// The one recoverable steady-state failure: the caller decides
    /// whether to retry, degrade, or propagate.
    #[error("out of physical pages")]
    OutOfPages,

    /// Rejected configuration or geometry at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using `KmemError`.
pub type Result<T> = std::result::Result<T, KmemError>;
