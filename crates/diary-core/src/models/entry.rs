//! Diary entry model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Destination;
use crate::error::{Error, Result};

/// A unique identifier for an entry, using UUID v7 (time-sortable)
///
/// Generated on the client and reused as the remote key, so replaying a
/// create never produces a second remote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new unique entry ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a photo was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Colors extracted from the entry photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Palette {
    pub dominant: String,
    pub vibrant: String,
    pub muted: String,
    #[serde(default)]
    pub all: Vec<String>,
}

/// A diary entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Client-generated identifier, also the remote key
    pub id: EntryId,
    /// When the moment was captured (Unix ms); local listings sort on it
    pub recorded_at: i64,
    /// Free-text caption
    pub caption: String,
    /// Mood label chosen by the user
    pub mood: String,
    /// Media reference (remote path, signed URL or data URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// User tags (lowercase, deduplicated)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tags suggested by image analysis
    #[serde(default)]
    pub ai_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<Palette>,
    /// Destinations this entry must exist in
    #[serde(default = "default_targets")]
    pub targets: BTreeSet<Destination>,
}

fn default_targets() -> BTreeSet<Destination> {
    BTreeSet::from([Destination::Private])
}

impl Entry {
    /// Create a new private entry captured now
    #[must_use]
    pub fn new(caption: impl Into<String>, mood: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            recorded_at: chrono::Utc::now().timestamp_millis(),
            caption: caption.into(),
            mood: mood.into(),
            photo: None,
            location: None,
            tags: Vec::new(),
            ai_tags: Vec::new(),
            palette: None,
            targets: default_targets(),
        }
    }

    /// Replace the destination set
    #[must_use]
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Destination>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    /// Set the capture timestamp (Unix ms)
    #[must_use]
    pub const fn with_recorded_at(mut self, recorded_at: i64) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Set the media reference
    #[must_use]
    pub fn with_photo(mut self, photo: impl Into<String>) -> Self {
        self.photo = Some(photo.into());
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set user tags, normalizing them
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    /// Whether the entry belongs in the owner's private store
    pub fn targets_private(&self) -> bool {
        self.targets.contains(&Destination::Private)
    }

    /// User and AI tags together, deduplicated
    #[must_use]
    pub fn all_tags(&self) -> Vec<String> {
        normalize_tags(self.tags.iter().chain(self.ai_tags.iter()))
    }

    /// Check the fields the backend requires before anything is written locally
    pub fn validate(&self) -> Result<()> {
        if self.caption.trim().is_empty() {
            return Err(Error::InvalidInput("entry caption cannot be empty".into()));
        }
        if self.mood.trim().is_empty() {
            return Err(Error::InvalidInput("entry mood cannot be empty".into()));
        }
        if self.targets.is_empty() {
            return Err(Error::InvalidInput(
                "entry must target at least one destination".into(),
            ));
        }
        if let Some(location) = &self.location {
            if !(-90.0..=90.0).contains(&location.lat) || !(-180.0..=180.0).contains(&location.lng)
            {
                return Err(Error::InvalidInput(format!(
                    "location out of range: {}, {}",
                    location.lat, location.lng
                )));
            }
        }
        Ok(())
    }
}

/// Normalize tags: trim, strip a leading `#`, lowercase, deduplicate.
///
/// First occurrence order is kept.
///
/// # Examples
///
/// ```
/// use diary_core::models::normalize_tags;
///
/// let tags = normalize_tags(["#Beach", "beach", " sunset "]);
/// assert_eq!(tags, vec!["beach".to_string(), "sunset".to_string()]);
/// ```
#[must_use]
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().trim_start_matches('#').to_lowercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entry_id_unique() {
        let id1 = EntryId::new();
        let id2 = EntryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_entry_id_parse() {
        let id = EntryId::new();
        let parsed: EntryId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_entry_new_targets_private() {
        let entry = Entry::new("Sunset at the pier", "calm");
        assert!(entry.targets_private());
        assert_eq!(entry.targets.len(), 1);
        assert!(entry.recorded_at > 0);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(Entry::new("  ", "happy").validate().is_err());
        assert!(Entry::new("caption", "").validate().is_err());
        assert!(Entry::new("caption", "happy")
            .with_targets(Vec::<Destination>::new())
            .validate()
            .is_err());
        assert!(Entry::new("caption", "happy").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_location() {
        let entry = Entry::new("caption", "happy").with_location(Location {
            lat: 120.0,
            lng: 0.0,
            name: None,
        });
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(["#Travel", "travel", "", "  Food "]);
        assert_eq!(tags, vec!["travel".to_string(), "food".to_string()]);
    }

    #[test]
    fn test_all_tags_merges_ai_tags() {
        let mut entry = Entry::new("caption", "happy").with_tags(["beach"]);
        entry.ai_tags = vec!["Beach".to_string(), "ocean".to_string()];
        assert_eq!(entry.all_tags(), vec!["beach".to_string(), "ocean".to_string()]);
    }

    #[test]
    fn test_json_uses_camel_case_and_default_targets() {
        let entry = Entry::new("caption", "happy").with_targets([
            Destination::Private,
            Destination::Group(GroupId::new("family").unwrap()),
        ]);
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("recordedAt").is_some());
        assert!(json.get("aiTags").is_some());

        let mut stripped = json;
        stripped.as_object_mut().unwrap().remove("targets");
        let parsed: Entry = serde_json::from_value(stripped).unwrap();
        assert_eq!(parsed.targets, BTreeSet::from([Destination::Private]));
    }
}
