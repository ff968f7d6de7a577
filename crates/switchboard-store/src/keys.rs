//! Key and channel layout in the coordination store.
//!
//! ```text
//! {prefix}:node:{nodeId}               -> NodeRecord JSON (TTL)
//! {prefix}:route:{path}:{sessionId}    -> owning nodeId   (TTL)
//! {prefix}:broadcast:{path}            pub/sub channel per path
//! {prefix}:control                     pub/sub control channel
//! ```

use switchboard_core::{NodeId, SessionId};

use crate::glob;

/// Namespaced key builder shared by every node in a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Key space rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Liveness record key for `node`.
    pub fn node_key(&self, node: &NodeId) -> String {
        format!("{}:node:{node}", self.prefix)
    }

    /// Prefix shared by every node record.
    pub fn node_prefix(&self) -> String {
        format!("{}:node:", self.prefix)
    }

    /// Routing record key for `(path, session)`.
    pub fn route_key(&self, path: &str, session: &SessionId) -> String {
        format!("{}:route:{path}:{session}", self.prefix)
    }

    /// Prefix shared by every routing record.
    pub fn route_prefix(&self) -> String {
        format!("{}:route:", self.prefix)
    }

    /// Split a routing key back into `(path, session)`.
    ///
    /// Paths may contain `:`; session ids never do, so the last segment is
    /// the session.
    pub fn parse_route_key(&self, key: &str) -> Option<(String, SessionId)> {
        let rest = key.strip_prefix(&self.route_prefix())?;
        let (path, session) = rest.rsplit_once(':')?;
        if session.is_empty() {
            return None;
        }
        Some((path.to_string(), SessionId::from(session)))
    }

    /// Pub/sub channel carrying broadcasts for `path`.
    pub fn broadcast_channel(&self, path: &str) -> String {
        format!("{}:broadcast:{path}", self.prefix)
    }

    /// Pattern matching every broadcast channel in this key space.
    pub fn broadcast_pattern(&self) -> String {
        format!("{}:broadcast:*", glob::escape(&self.prefix))
    }

    /// Path addressed by a broadcast channel name.
    pub fn path_from_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(":broadcast:")
    }

    /// Control channel for membership notices.
    pub fn control_channel(&self) -> String {
        format!("{}:control", self.prefix)
    }

    /// Subscription pattern matching exactly the control channel.
    pub fn control_pattern(&self) -> String {
        glob::escape(&self.control_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glob::glob_match;

    #[test]
    fn node_keys() {
        let keys = KeySpace::new("sb");
        let node = NodeId::from("n1");
        assert_eq!(keys.node_key(&node), "sb:node:n1");
        assert!(keys.node_key(&node).starts_with(&keys.node_prefix()));
    }

    #[test]
    fn route_key_round_trip_with_colon_in_path() {
        let keys = KeySpace::new("sb");
        let sid = SessionId::new();
        let key = keys.route_key("/rooms:lobby", &sid);
        let (path, parsed) = keys.parse_route_key(&key).unwrap();
        assert_eq!(path, "/rooms:lobby");
        assert_eq!(parsed, sid);
    }

    #[test]
    fn parse_route_key_rejects_foreign_keys() {
        let keys = KeySpace::new("sb");
        assert!(keys.parse_route_key("sb:node:n1").is_none());
        assert!(keys.parse_route_key("other:route:/chat:s1").is_none());
        assert!(keys.parse_route_key("sb:route:/chat:").is_none());
    }

    #[test]
    fn broadcast_pattern_matches_channels() {
        let keys = KeySpace::new("sb");
        let channel = keys.broadcast_channel("/chat");
        assert!(glob_match(&keys.broadcast_pattern(), &channel));
        assert!(!glob_match(&keys.broadcast_pattern(), &keys.control_channel()));
        assert_eq!(keys.path_from_channel(&channel), Some("/chat"));
        assert_eq!(keys.path_from_channel("sb:control"), None);
    }

    #[test]
    fn prefixes_do_not_collide() {
        let a = KeySpace::new("a");
        let ab = KeySpace::new("a*");
        assert!(!glob_match(&ab.broadcast_pattern(), &a.broadcast_channel("/x")));
    }

    #[test]
    fn control_pattern_is_literal() {
        let wild = KeySpace::new("sb*");
        let other = KeySpace::new("sbx");
        assert!(glob_match(&wild.control_pattern(), &wild.control_channel()));
        assert!(!glob_match(&wild.control_pattern(), &other.control_channel()));

        let bracket = KeySpace::new("sb[1]");
        assert!(glob_match(&bracket.control_pattern(), &bracket.control_channel()));
        assert!(!glob_match(&bracket.control_pattern(), "sb1:control"));
    }
}
