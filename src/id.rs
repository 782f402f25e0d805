//! Opaque unique identifiers.
//!
//! Every addressable element carries an [`Id`]: a UUID-v4 value with a
//! canonical textual form. Equality is value equality; ids carry no
//! ordering. Ids are minted at element construction and never change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A 128-bit opaque identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Uuid);

#[derive(Debug, Error)]
#[error("not a valid v4 id: {0:?}")]
pub struct IdParseError(String);

impl Id {
    /// Mint a fresh random id.
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }

    /// Validate and parse a canonical textual id.
    ///
    /// Only version-4 UUIDs are accepted; other versions are rejected so
    /// externally supplied ids stay in the same domain as minted ones.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        let uuid = Uuid::parse_str(value).map_err(|_| IdParseError(value.to_string()))?;
        if uuid.get_version_num() != 4 {
            return Err(IdParseError(value.to_string()));
        }
        Ok(Id(uuid))
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        let a = Id::new();
        let b = Id::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip_canonical_form() {
        let id = Id::new();
        let text = id.to_string();
        assert_eq!(Id::parse(&text).unwrap(), id);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Id::parse("not-an-id").is_err());
        assert!(Id::parse("").is_err());
    }

    #[test]
    fn test_rejects_non_v4() {
        // v1 (time-based) UUID
        assert!(Id::parse("c232ab00-9414-11ec-b3c8-9f6bdeced846").is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = Id::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
