//! Error types for the next-maxsim loader

use thiserror::Error;

/// Result type alias for next-maxsim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while loading and binding kernel variants
#[derive(Error, Debug)]
pub enum Error {
    /// A kernel artifact could not be opened
    #[error("Kernel load failed: {0}")]
    KernelLoad(String),

    /// A kernel artifact does not expose a required symbol
    #[error("Kernel artifact is missing symbol `{0}`")]
    Symbol(String),

    /// A kernel artifact was built against a different export table
    #[error("Kernel artifact ABI version {found} does not match loader ABI version {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    /// No variant could be bound, including the baseline
    #[error("Kernel dispatch failed: {0}")]
    Dispatch(String),

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
