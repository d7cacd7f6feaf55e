//! Small identifier types shared by every Dockyard crate.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Project identifier. Serializes as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(s: impl Into<String>) -> Result<Self, SchemaError> {
        let s = s.into();
        validate_project_id(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ProjectId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = SchemaError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

/// Project ids end up in container and volume names, so they are restricted
/// to characters every container engine accepts.
pub fn validate_project_id(id: &str) -> Result<(), SchemaError> {
    let valid = !id.is_empty()
        && id.len() <= 48
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidProjectId(id.to_owned()))
    }
}

/// A versioned copy of a project's persistent volumes. Always `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Slot(u32);

impl Slot {
    /// The primordial slot every project starts in.
    pub const PRIMARY: Slot = Slot(1);

    pub fn new(n: u32) -> Result<Self, SchemaError> {
        if n == 0 {
            return Err(SchemaError::InvalidSlot(n));
        }
        Ok(Self(n))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::PRIMARY
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for Slot {
    type Error = SchemaError;
    fn try_from(n: u32) -> Result<Self, Self::Error> {
        Self::new(n)
    }
}

impl From<Slot> for u32 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl FromStr for Slot {
    type Err = SchemaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = s
            .trim()
            .parse::<u32>()
            .map_err(|_| SchemaError::InvalidSlot(0))?;
        Self::new(n)
    }
}

/// The kind of object a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    App,
    Worker,
    Service,
    Router,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::App => "app",
            ObjectType::Worker => "worker",
            ObjectType::Service => "service",
            ObjectType::Router => "router",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = SchemaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(ObjectType::App),
            "worker" => Ok(ObjectType::Worker),
            "service" => Ok(ObjectType::Service),
            "router" => Ok(ObjectType::Router),
            other => Err(SchemaError::UnknownObjectType(other.to_owned())),
        }
    }
}
