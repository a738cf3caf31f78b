//! Replication destinations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const PRIVATE_KEY: &str = "private";

/// Identifier of a shared group store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Validate and wrap a group identifier
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("group id cannot be empty".into()));
        }
        if trimmed.eq_ignore_ascii_case(PRIVATE_KEY) {
            return Err(Error::InvalidInput(format!(
                "'{PRIVATE_KEY}' is reserved and cannot be used as a group id"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote location an entry is replicated to
///
/// Serialized as `"private"` or the bare group id, matching the target
/// lists the clients have always sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Destination {
    /// The owner's private diary
    Private,
    /// A shared group diary
    Group(GroupId),
}

impl Destination {
    /// Build a group destination from a raw id
    pub fn group(raw: impl Into<String>) -> Result<Self> {
        GroupId::new(raw).map(Self::Group)
    }

    pub const fn is_private(&self) -> bool {
        matches!(self, Self::Private)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => f.write_str(PRIVATE_KEY),
            Self::Group(group) => write!(f, "{group}"),
        }
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim() == PRIVATE_KEY {
            Ok(Self::Private)
        } else {
            Self::group(s)
        }
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Destination {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_private_and_groups() {
        assert_eq!("private".parse::<Destination>().unwrap(), Destination::Private);
        assert_eq!(
            " family ".parse::<Destination>().unwrap(),
            Destination::Group(GroupId::new("family").unwrap())
        );
        assert!("   ".parse::<Destination>().is_err());
    }

    #[test]
    fn group_id_rejects_reserved_name() {
        assert!(GroupId::new("PRIVATE").is_err());
    }

    #[test]
    fn private_sorts_before_groups() {
        let mut targets = vec![Destination::group("b").unwrap(), Destination::Private];
        targets.sort();
        assert_eq!(targets[0], Destination::Private);
    }

    #[test]
    fn serializes_as_plain_strings_and_map_keys() {
        let json = serde_json::to_string(&vec![
            Destination::Private,
            Destination::group("friends").unwrap(),
        ])
        .unwrap();
        assert_eq!(json, r#"["private","friends"]"#);

        let map = BTreeMap::from([(Destination::group("friends").unwrap(), 1)]);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"friends":1}"#);
        let back: BTreeMap<Destination, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
