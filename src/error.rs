use thiserror::Error as ThisError;

/// Failure talking to the remote state store.
///
/// On a subscription these only ever show up as a connectivity downgrade;
/// writes return them to the caller.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store is offline")]
    Offline,

    #[error("write to {path} rejected: {reason}")]
    WriteRejected { path: String, reason: String },
}

/// User-facing login failure.
///
/// Deliberately carries no cause: wrong secret, unknown account and an
/// unreachable auth service all read the same.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Login failed. Check email & password.")]
pub struct LoginError;

/// Why the auth service refused a credential exchange. Logged, never shown.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("wrong secret for {0}")]
    WrongSecret(String),

    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// A store payload that cannot be read as a device record.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("device record must be a JSON object, got {0}")]
pub struct DecodeError(pub String);

#[derive(ThisError, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
