use serde::{Deserialize, Serialize};

/// Identifier of a node within one graph.
///
/// Ids are chosen by whoever writes the graph spec; they only need to be
/// unique inside that graph. Their numeric order is the tie-break key for
/// topological ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identity of a remote worker (its configured name, also carried in heartbeats).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_and_order() {
        assert_eq!(NodeId(7).to_string(), "n7");
        assert!(NodeId(2) < NodeId(10));
    }

    #[test]
    fn worker_ids_order_lexically() {
        let mut ids = vec![WorkerId::from("w2"), WorkerId::from("w10"), WorkerId::from("w1")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "w1");
        assert_eq!(ids[1].as_str(), "w10");
    }

    #[test]
    fn ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&NodeId(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&WorkerId::from("a")).unwrap(), "\"a\"");
    }
}
