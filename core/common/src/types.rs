//! Common types used throughout ledgersync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
///
/// Used for both the local logical clock and the remote `last_modified`.
pub type Timestamp = i64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if id is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot be empty",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of the authenticated user owning a session.
    UserId,
    "UserId"
);

string_id!(
    /// Identifier of one client installation.
    ///
    /// Part of every change id, so two clients enqueuing at the same
    /// millisecond never produce the same id.
    ClientId,
    "ClientId"
);

string_id!(
    /// Identity of a domain record (transaction, account, ...).
    EntityId,
    "EntityId"
);

/// Identifier of a queued change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    /// Build a change id from its provenance parts.
    ///
    /// Format: `{client_id}-{timestamp}-{suffix}`.
    pub fn compose(client_id: &ClientId, timestamp: Timestamp, suffix: &str) -> Self {
        Self(format!("{}-{}-{}", client_id, timestamp, suffix))
    }

    /// Wrap an existing id string (e.g. read back from the CLI).
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
