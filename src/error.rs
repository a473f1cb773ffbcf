//! Error types for the code generator.
//!
//! Compilation failure is never partial: the conditions below are either
//! recovered internally (a failed register steal falls back to a physical
//! replace) or abort the compilation outright.

use thiserror::Error;

/// Fatal and internally-recoverable compilation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("no register satisfies mask {mask:#010x}")]
    NoRegister { mask: u32 },

    #[error("frame slot {index} is held by a live value with no save site")]
    FrameSlotConflict { index: u32 },

    #[error("value cannot be displaced from its only site")]
    NoSaveSite,

    #[error("promise read before resolution")]
    Unresolved,

    #[error("{op} has no direct encoding and no thunk substitution here")]
    UnsupportedThunk { op: String },
}

/// Result alias for operations that may fail recoverably.
pub type CompileResult<T> = Result<T, CompileError>;
