//! String identifiers for node ports.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The identifier of an input or output port on a node.
///
/// Port ids are free-form names chosen by node authors (`"value"`,
/// `"input1Default"`, `"break"`); they are compared case-sensitively and
/// never normalized. `PortId` is a thin string wrapper that serializes as a
/// plain string and can be looked up in maps by `&str` via [`Borrow`].
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    /// Create a new `PortId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PortId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for PortId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PortId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<PortId> for String {
    fn from(id: PortId) -> Self {
        id.0
    }
}

impl AsRef<str> for PortId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Hash/Ord are derived from the inner String, so borrowing as `str` keeps
// map lookups consistent.
impl Borrow<str> for PortId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PortId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PortId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl PartialEq<String> for PortId {
    fn eq(&self, other: &String) -> bool {
        self.0 == *other
    }
}
