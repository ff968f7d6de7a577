//! Branded ID newtypes for type safety.
//!
//! Session and node identities are distinct newtypes around `String` so a
//! node id can never be passed where a session id is expected. Both are
//! generated from UUID v7 values; callers must treat them as opaque.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string.
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new collision-resistant random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identity of one client connection. Generated at accept time and never reused.
    SessionId
);

branded_id!(
    /// Identity of one running process in the cluster. Generated once per start.
    NodeId
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn node_and_session_ids_differ() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_matches_inner() {
        let id = SessionId::from_string("sess-1".into());
        assert_eq!(id.to_string(), "sess-1");
        assert_eq!(id.as_str(), "sess-1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = NodeId::from("node-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"node-a\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_contain_no_key_separator() {
        // Ids are embedded in colon-separated store keys.
        let id = SessionId::new();
        assert!(!id.contains(':'));
    }

    #[test]
    fn into_inner_returns_string() {
        let id = SessionId::from("abc");
        assert_eq!(id.into_inner(), "abc");
    }
}
