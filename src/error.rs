use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level error codes carried on the wire inside `RequestError` and
/// `ResponseError` envelopes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The envelope itself was structurally malformed (wrong arity, wrong
    /// field types).
    FormationViolation,
    /// The action payload could not be interpreted by the message catalog.
    CouldNotParse,
    /// No handler is registered for the action, or none produced a result.
    NotImplemented,
    /// A policy-mandated signature was missing or failed verification.
    SecurityError,
    /// A handler faulted while processing the request.
    ExceptionOccurred,
    /// Catch-all for failures with no more specific code.
    GenericError,
    /// An internal fault on the responding node.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::CouldNotParse => "CouldNotParse",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::ExceptionOccurred => "ExceptionOccurred",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
        }
    }

    pub fn from_str_lossy(s: &str) -> ErrorCode {
        match s {
            "FormationViolation" => ErrorCode::FormationViolation,
            "CouldNotParse" => ErrorCode::CouldNotParse,
            "NotImplemented" => ErrorCode::NotImplemented,
            "SecurityError" => ErrorCode::SecurityError,
            "ExceptionOccurred" => ErrorCode::ExceptionOccurred,
            "InternalError" => ErrorCode::InternalError,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate error taxonomy.
///
/// Parse, signature and handler failures are converted into protocol error
/// envelopes by the dispatcher and sent back along the message's path; they
/// never cross the transport boundary as panics. Routing loops and decrypt
/// failures are terminal for the single message concerned.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    FormationViolation(String),

    #[error("could not parse payload for action {action}: {reason}")]
    CouldNotParse { action: String, reason: String },

    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("connection lost before a response arrived")]
    ConnectionLost,

    #[error("routing loop: node {0} already present in network path")]
    RoutingLoop(String),

    #[error("no route toward destination {0}")]
    NoRoute(String),

    #[error("secure data transfer decrypt failed: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("unknown key id {0}")]
    UnknownKey(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a signature was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("policy requires a signature but none was attached")]
    MissingSignature,
    #[error("no key material resolved for key id {0}")]
    UnknownKeyId(String),
    #[error("digest mismatch for key id {0}")]
    InvalidSignature(String),
    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("signed field {0} is absent from the message")]
    MissingField(String),
    #[error("policy rejects unsigned messages for action {0}")]
    UnsignedRejected(String),
}

/// Why a Secure Data Transfer payload could not be decrypted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("payload truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("declared ciphertext length {declared} disagrees with remaining {remaining} bytes")]
    LengthMismatch { declared: u64, remaining: u64 },
    #[error("no cipher key registered under id {0}")]
    UnknownKeyId(u16),
    #[error("authentication tag rejected")]
    TagMismatch,
}

impl Error {
    /// Map an internal error onto the wire-level code used when reporting it
    /// to the remote side.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Error::FormationViolation(_) => ErrorCode::FormationViolation,
            Error::CouldNotParse { .. } => ErrorCode::CouldNotParse,
            Error::Signature(_) => ErrorCode::SecurityError,
            Error::HandlerFault(_) => ErrorCode::ExceptionOccurred,
            Error::UnknownKey(_) => ErrorCode::SecurityError,
            _ => ErrorCode::GenericError,
        }
    }
}
