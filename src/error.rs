//! Error types for Timescape

use thiserror::Error;

use crate::version::Tsv;

/// Result type for Timescape operations
pub type Result<T> = std::result::Result<T, TimescapeError>;

/// Timescape errors
#[derive(Error, Debug)]
pub enum TimescapeError {
    #[error("Version not found for {handler_path}: {detail}")]
    VersionNotFound { handler_path: String, detail: String },

    #[error("Invalid version format: {token:?} ({reason})")]
    InvalidVersionFormat { token: String, reason: String },

    #[error("Duplicate content: {handler_path} already has content hash {content_hash} at its latest version {tsv}")]
    DuplicateContent {
        handler_path: String,
        content_hash: String,
        tsv: Tsv,
    },

    #[error("Slug collision: {handler_path} would mint versions as '{slug}', already used by {other}")]
    SlugCollision {
        handler_path: String,
        slug: String,
        other: String,
    },

    #[error("Duplicate tag: '{label}' already points to {existing}")]
    DuplicateTag { label: String, existing: Tsv },

    #[error("Versions are not timeline-adjacent: {from} -> {to}")]
    NonAdjacentVersions { from: Tsv, to: Tsv },

    #[error("Transformer pair already registered for {from} -> {to}")]
    DuplicatePair { from: Tsv, to: Tsv },

    #[error("Transformer immutability violation: cannot redefine {from} -> {to}; create a new version instead")]
    ImmutabilityViolation { from: Tsv, to: Tsv },

    #[error("Chain {from} -> {to} needs {hops} hops, maximum is {max}")]
    ChainLengthExceeded {
        from: Tsv,
        to: Tsv,
        hops: usize,
        max: usize,
    },

    #[error("Incomplete chain {from} -> {to}: no transformer registered for hop {missing_from} -> {missing_to}")]
    IncompleteChain {
        from: Tsv,
        to: Tsv,
        missing_from: Tsv,
        missing_to: Tsv,
    },

    #[error("Cannot chain across handlers: {from} belongs to {from_handler}, {to} belongs to {to_handler}")]
    CrossHandlerChain {
        from: Tsv,
        to: Tsv,
        from_handler: String,
        to_handler: String,
    },

    #[error("Transformation failed at hop {hop} ({from} -> {to}): {cause}")]
    Transformation {
        hop: usize,
        from: Tsv,
        to: Tsv,
        cause: String,
    },

    #[error("Schema migration failed for {schema_version}: {reason}")]
    SchemaMigration {
        schema_version: String,
        reason: String,
    },

    #[error("Schema rollback failed for {schema_version}: {reason}")]
    SchemaRollback {
        schema_version: String,
        reason: String,
    },

    #[error("Unknown database schema: {0}")]
    UnknownSchema(String),

    #[error("Version {tsv} carries protected tag '{tag}'; pass force to deactivate")]
    ProtectedTagViolation { tsv: Tsv, tag: String },

    #[error("Handler {handler_path} failed: {message}")]
    Handler {
        handler_path: String,
        message: String,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TimescapeError {
    pub(crate) fn not_found(handler_path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::VersionNotFound {
            handler_path: handler_path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_format(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersionFormat {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error describes a client-side problem (bad or unknown version)
    /// rather than a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::VersionNotFound { .. } | Self::InvalidVersionFormat { .. }
        )
    }
}
