//! Error types surfaced by the administrative API.

/// Error enumeration surfaced across the public API.
///
/// Only the administrative path produces these. Real-time accessors degrade to
/// neutral values (`None`, unity gain, silence) instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Operation referenced a client id that is not connected.
    #[error("unknown client id: {0}")]
    InvalidClient(u32),
    /// A process id was negative where a real pid is required.
    #[error("invalid process id: {0}")]
    InvalidPid(i32),
    /// A raw parameter value fell outside its validated range.
    #[error("{field} value {value} is out of range")]
    OutOfRange {
        /// Name of the rejected field.
        field: &'static str,
        /// Offending value.
        value: f64,
    },
    /// A bulk entry lacked a field needed to apply it.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// An IO reference counter would exceed its representable range.
    #[error("IO counter overflow")]
    CounterOverflow,
    /// An IO reference counter would drop below zero.
    #[error("IO counter underflow")]
    CounterUnderflow,
    /// Every slot of the real-time client table holds a live client.
    #[error("client table is full ({capacity} slots)")]
    TableFull {
        /// Number of slots in the table.
        capacity: usize,
    },
    /// Engine configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for administrative results.
pub type EngineResult<T> = Result<T, EngineError>;
