//! Shared primitives for all Rust crates in Fleetward.

#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type used across Fleetward crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl Display for NonEmptyString {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Identity of one worker process for the lifetime of that process.
///
/// Holder ids are random and never derived from hostnames, so a restarted
/// process on the same machine is a new holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(Uuid);

impl HolderId {
    /// Creates a random holder identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a holder identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HolderId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl FromStr for HolderId {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|error| AppError::Validation(format!("invalid holder id '{value}': {error}")))
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create targeted a key that is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic write lost against a concurrent writer.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// The caller no longer owns the lease it was relying on.
    #[error("lost lease: {0}")]
    LostLease(String),

    /// Item exceeded the dequeue threshold and was forced to failure.
    #[error("poison item: {0}")]
    PoisonItem(String),

    /// Transient document store or network failure.
    #[error("store error: {0}")]
    Store(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true for optimistic concurrency conflicts.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }

    /// Returns true when lease ownership was lost mid-operation.
    #[must_use]
    pub fn is_lost_lease(&self) -> bool {
        matches!(self, Self::LostLease(_))
    }

    /// Returns true when the requested document does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true when a create raced with an existing document.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, HolderId, NonEmptyString};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn holder_id_round_trips_through_display() {
        let holder_id = HolderId::new();
        let parsed = holder_id.to_string().parse::<HolderId>();
        assert!(matches!(parsed, Ok(value) if value == holder_id));
    }

    #[test]
    fn holder_id_rejects_garbage() {
        assert!(matches!(
            "not-a-holder".parse::<HolderId>(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn error_predicates_match_variants() {
        assert!(AppError::VersionConflict("etag".to_owned()).is_version_conflict());
        assert!(AppError::LostLease("item".to_owned()).is_lost_lease());
        assert!(!AppError::Store("timeout".to_owned()).is_lost_lease());
    }
}
