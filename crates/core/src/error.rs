//! Error taxonomy for the puzzle engine.
//!
//! Everything here is recoverable from the caller's point of view: a GPU
//! crash disables the GPU for the session but never poisons the engine, and a
//! cooperative stop is reported as [`Error::Aborted`] rather than a failure
//! of the data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A request parameter or payload field is out of range. Raised
    /// synchronously, before any chain work starts.
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// The payload failed authentication: checksum mismatch, tampered
    /// ciphertext, or a wrong replay order. Deliberately a single
    /// indistinguishable outcome.
    #[error("payload corrupted or tampered")]
    Integrity,

    /// The payload could not be parsed at all.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// No usable GPU device; the engine keeps working CPU-only.
    #[error("gpu unavailable: {0}")]
    GpuUnavailable(String),

    /// The GPU device was lost mid-run. The run is abandoned and the GPU is
    /// disabled for the rest of the session.
    #[error("gpu device lost during run")]
    GpuCrashed,

    /// The operation was stopped cooperatively before completion.
    #[error("operation stopped before completion")]
    Aborted,

    /// Another operation is already in flight on this engine.
    #[error("engine is busy with another operation")]
    Busy,
}

pub type Result<T> = core::result::Result<T, Error>;
