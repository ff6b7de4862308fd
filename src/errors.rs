//! Engine-wide error kinds with stable numeric codes.
//!
//! Codes are identifier-stable across releases; messages are not. Callers
//! that need to branch on a failure match on the variant or on [`Error::code`],
//! never on the message text.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured errors surfaced by the planner, executor, and prepared cache.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Lookup of a prepared statement by name found nothing.
    #[error("no such prepared statement: {name}")]
    NoSuchPrepared {
        /// Requested statement name.
        name: String,
    },
    /// The prepared reference was neither a name nor a decodable object.
    #[error("unrecognizable prepared statement: {reason}")]
    UnrecognizedPrepared {
        /// Why the reference could not be understood.
        reason: String,
    },
    /// A prepared statement with this name already holds different text.
    #[error("unable to add name: {reason}")]
    PreparedName {
        /// Conflict detail, e.g. `duplicate name: p1`.
        reason: String,
    },
    /// The encoded plan could not be base64/gzip/JSON decoded.
    #[error("unable to decode prepared statement: {reason}")]
    PreparedDecoding {
        /// Decoder failure detail.
        reason: String,
    },
    /// The name embedded in an encoded plan disagrees with the declared name.
    #[error("encoded plan parameter does not match encoded plan: {name}")]
    EncodingNameMismatch {
        /// Name the caller declared.
        name: String,
    },
    /// The cached plan under this name was built from different text.
    #[error("encoded plan parameter does not match cached plan: {name}")]
    PreparedEncodingMismatch {
        /// Name of the conflicting entry.
        name: String,
    },
    /// Re-parsing or re-planning a stale prepared statement failed.
    #[error("unable to reprepare statement: {reason}")]
    Reprepare {
        /// Underlying parse or plan failure.
        reason: String,
    },
    /// An item flowing through the pipeline was structurally invalid.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// What was malformed.
        reason: String,
    },
    /// Semantic check failed after parsing.
    #[error("semantic error: {reason}")]
    Semantics {
        /// Violation detail.
        reason: String,
    },
    /// No usable primary index exists on the keyspace.
    #[error(
        "no index available on keyspace {keyspace} that matches your query. \
         Use CREATE PRIMARY INDEX ON {keyspace} to create a primary index, \
         or check that your expected index is online."
    )]
    NoPrimaryIndex {
        /// Keyspace the scan targeted.
        keyspace: String,
    },
    /// The planner could not produce a plan.
    #[error("planning error: {reason}")]
    Planning {
        /// Planner failure detail.
        reason: String,
    },
    /// Name resolution against the datastore failed.
    #[error("datastore error: {reason}")]
    Datastore {
        /// Resolution failure detail.
        reason: String,
    },
    /// The request exceeded its deadline.
    #[error("request timed out after {ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        ms: u64,
    },
    /// The engine is draining requests ahead of shutdown.
    #[error("service is shutting down")]
    ServiceShuttingDown,
    /// The engine has shut down.
    #[error("service has shut down")]
    ServiceShutDown,
    /// Transaction could not be started.
    #[error("unable to start transaction: {reason}")]
    StartTransaction {
        /// Underlying failure.
        reason: String,
    },
    /// Transaction-scoped statement failed.
    #[error("transaction error: {reason}")]
    Transaction {
        /// Underlying failure.
        reason: String,
    },
    /// Statement rewrite failed.
    #[error("rewrite error: {reason}")]
    Rewrite {
        /// Rewriter failure detail.
        reason: String,
    },
    /// Invariant violation inside the engine.
    #[error("internal error: {reason}")]
    Internal {
        /// Invariant description.
        reason: String,
    },
}

impl Error {
    /// Stable numeric code for the error kind.
    pub fn code(&self) -> u32 {
        match self {
            Error::NoSuchPrepared { .. } => 4040,
            Error::UnrecognizedPrepared { .. } => 4050,
            Error::PreparedName { .. } => 4060,
            Error::PreparedDecoding { .. } => 4070,
            Error::EncodingNameMismatch { .. } => 4080,
            Error::PreparedEncodingMismatch { .. } => 4090,
            Error::Reprepare { .. } => 4100,
            Error::InvalidValue { .. } => 5010,
            Error::Semantics { .. } => 3100,
            Error::NoPrimaryIndex { .. } => 4000,
            Error::Planning { .. } => 4010,
            Error::Datastore { .. } => 4020,
            Error::Timeout { .. } => 1080,
            Error::ServiceShuttingDown => 1180,
            Error::ServiceShutDown => 1190,
            Error::StartTransaction { .. } => 17000,
            Error::Transaction { .. } => 17010,
            Error::Rewrite { .. } => 3300,
            Error::Internal { .. } => 5000,
        }
    }

    /// Builds a [`Error::NoSuchPrepared`] for `name`.
    pub fn no_such_prepared(name: impl Into<String>) -> Self {
        Error::NoSuchPrepared { name: name.into() }
    }

    /// Builds a [`Error::PreparedName`] duplicate-name failure.
    pub fn duplicate_name(name: &str) -> Self {
        Error::PreparedName {
            reason: format!("duplicate name: {name}"),
        }
    }

    /// Builds an [`Error::Internal`] invariant failure.
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }
}

/// Non-fatal diagnostic accumulated on a result instead of aborting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Stable warning code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::no_such_prepared("p").code(), 4040);
        assert_eq!(Error::duplicate_name("p").code(), 4060);
        assert_eq!(
            Error::EncodingNameMismatch { name: "x".into() }.code(),
            4080
        );
    }

    #[test]
    fn duplicate_name_message_shape() {
        let err = Error::duplicate_name("p1");
        assert!(err.to_string().contains("duplicate name: p1"));
    }

    #[test]
    fn missing_primary_index_names_keyspace() {
        let err = Error::NoPrimaryIndex {
            keyspace: "orders".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("CREATE PRIMARY INDEX"));
    }
}
