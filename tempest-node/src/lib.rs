pub mod service;
#[cfg(test)]
pub mod test;
pub mod wire;

pub use localtime::{LocalDuration, LocalTime};
pub use tempest::{clock, hub, node, policy, sample, topic};

use std::fmt;
use std::str::FromStr;

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

impl Link {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

/// An opaque transport connection identifier, assigned by the transport.
/// Several sessions may share one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl From<u64> for ConnId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid address `{0}`")]
pub struct AddressParseError(String);

/// A transport endpoint address. The transport interprets it; the service
/// only requires it to be well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(AddressParseError(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod prelude {
    pub use crate::clock::Timestamp;
    pub use crate::node::NodeId;
    pub use crate::service::message::{Message, NodeRef};
    pub use crate::service::{DisconnectReason, Service};
    pub use crate::{Address, ConnId, Link};
    pub use crate::{LocalDuration, LocalTime};
}
