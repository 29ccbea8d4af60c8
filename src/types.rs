//! NewType wrappers for the identifiers that flow through a query.
//!
//! These types keep reference IDs, datasource uids and datasource plugin
//! types from being mixed up (e.g. routing a batch by a refId).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Return `true` if the value is empty or only whitespace.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Caller-assigned key for one query (e.g. "A", "B").
    ///
    /// Unique within a single datasource batch, and used as the merge key
    /// when partial responses are combined. Two batches of the same call
    /// are not guaranteed to use disjoint reference IDs.
    RefId
);

newtype_string!(
    /// Identifier of a configured datasource instance (e.g. "prom-main").
    DatasourceUid
);

newtype_string!(
    /// Plugin type of a datasource (e.g. "testdata", "http").
    ///
    /// Used to route a batch when no instance with a matching uid is
    /// registered.
    DatasourceType
);
