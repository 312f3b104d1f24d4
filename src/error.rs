use thiserror::Error;

/// User-protocol errors surfaced through the reply writer. The `#[error]`
/// strings are the exact wire messages and must not be reworded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("value is not a valid float")]
    NotAFloat,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("unknown module type")]
    UnknownModuleType,
}
