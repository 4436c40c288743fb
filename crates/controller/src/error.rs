//! Error taxonomy for the link, the poll protocol, and frame integrity.
//!
//! `LinkError` and `ProtocolError` fail a single poll or actuation; the
//! orchestrator logs them and moves on to the next zone. `IntegrityWarning`
//! is never fatal: the frame is still used.

use std::time::Duration;

use thiserror::Error;

use crate::config::ZoneId;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("could not attach to zone {zone} after {attempts} connect attempts")]
    AttachExhausted { zone: ZoneId, attempts: u32 },

    #[error("radio stuck in command mode while polling zone {zone}")]
    StuckCommandMode { zone: ZoneId },

    #[error("zone {zone} did not answer within {timeout:?}")]
    Timeout { zone: ZoneId, timeout: Duration },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty response from zone {zone}")]
    Empty { zone: ZoneId },

    #[error("expected {expected} tokens, got {got}")]
    TokenCount { expected: usize, got: usize },

    #[error("malformed token '{token}'")]
    MalformedToken { token: String },

    #[error("value '{value}' of '{name}' is not a number")]
    BadValue { name: String, value: String },
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntegrityWarning {
    #[error("first field is '{found}', expected hardware_id; check data link integrity")]
    HardwareIdMissing { found: String },

    #[error("hardware id {reported} does not match polled zone {expected}; check radio addressing")]
    HardwareIdMismatch { expected: ZoneId, reported: f64 },

    #[error("last field is '{found}', expected water_on; value kept as valve state")]
    TrailerMisplaced { found: String },

    #[error("reading '{name}' matches no known measurement kind")]
    UnclassifiedReading { name: String },
}

/// Rejected override request. Always a client error; scheduler state is
/// left untouched.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OverrideError {
    #[error("unknown zone {0}")]
    UnknownZone(ZoneId),

    #[error("zone {0} has no watering scheduled")]
    NotPending(ZoneId),

    #[error("zone {0} is not watering")]
    NotActive(ZoneId),

    #[error("zone {0} is already watering")]
    AlreadyActive(ZoneId),

    #[error("delay for zone {0} is too long")]
    DelayTooLong(ZoneId),
}
