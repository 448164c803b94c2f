//! Node identities.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeIdError {
    #[error("invalid node id: empty {0}")]
    Empty(&'static str),
    #[error("invalid node id: `{0}` contains illegal characters")]
    InvalidCharacter(String),
}

/// A node identity: a name qualified by a category.
///
/// Identities are opaque to the protocol; they only need to be unique
/// within the reachable set of nodes. Displayed as `category/name`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    name: String,
    category: String,
}

impl NodeId {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Result<Self, NodeIdError> {
        let name = name.into();
        let category = category.into();

        if name.is_empty() {
            return Err(NodeIdError::Empty("name"));
        }
        if category.is_empty() {
            return Err(NodeIdError::Empty("category"));
        }
        for part in [&name, &category] {
            if part.contains('/') || part.chars().any(char::is_whitespace) {
                return Err(NodeIdError::InvalidCharacter(part.clone()));
            }
        }
        Ok(Self { name, category })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Generate a random node id, for tests.
    #[cfg(any(test, feature = "test"))]
    pub fn gen(rng: &mut fastrand::Rng) -> Self {
        let name = (0..12)
            .map(|_| rng.alphanumeric())
            .collect::<String>();

        Self {
            name,
            category: String::from("node"),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((category, name)) => Self::new(category, name),
            None => Err(NodeIdError::Empty("category")),
        }
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::from_str("node/weather-1").unwrap();
        assert_eq!(id.category(), "node");
        assert_eq!(id.name(), "weather-1");
        assert_eq!(id.to_string(), "node/weather-1");

        assert!(NodeId::from_str("weather-1").is_err());
        assert!(NodeId::from_str("/weather-1").is_err());
        assert!(NodeId::from_str("node/").is_err());
        assert!(NodeId::new("node", "has space").is_err());
    }
}
