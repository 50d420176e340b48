//! Core domain types for Cascade.
//!
//! These types mirror the on-disk artifacts of a planning hierarchy:
//! markdown work items with frontmatter, per-directory aggregate records
//! (`state.json`) and the root registry (`work-item-registry.json`).
//! Serialization field order matches the canonical file layouts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The seven work item kinds, from root to leaf.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Project,
    Epic,
    Feature,
    Story,
    Bug,
    Phase,
    Task,
}

impl NodeKind {
    /// Identifier prefix letter(s) for this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Project => "P",
            Self::Epic => "E",
            Self::Feature => "F",
            Self::Story => "S",
            Self::Bug => "B",
            Self::Phase => "PH",
            Self::Task => "T",
        }
    }

    /// Tasks are always leaves and carry no aggregate record.
    pub fn is_leaf(self) -> bool {
        matches!(self, Self::Task)
    }

    /// All kinds, for counter iteration and table dispatch.
    pub fn all() -> [NodeKind; 7] {
        [
            Self::Project,
            Self::Epic,
            Self::Feature,
            Self::Story,
            Self::Bug,
            Self::Phase,
            Self::Task,
        ]
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Project => "project",
            Self::Epic => "epic",
            Self::Feature => "feature",
            Self::Story => "story",
            Self::Bug => "bug",
            Self::Phase => "phase",
            Self::Task => "task",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for NodeKind {
    type Err = ParseIdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "epic" => Ok(Self::Epic),
            "feature" => Ok(Self::Feature),
            "story" => Ok(Self::Story),
            "bug" => Ok(Self::Bug),
            "phase" => Ok(Self::Phase),
            "task" => Ok(Self::Task),
            _ => Err(ParseIdError::UnknownKind(s.to_string())),
        }
    }
}

/// Error raised when a work item identifier cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("unknown kind prefix in id '{0}'")]
    UnknownPrefix(String),

    #[error("unknown kind name '{0}'")]
    UnknownKind(String),

    #[error("invalid numeric suffix in id '{0}'")]
    InvalidNumber(String),
}

/// Typed work item identifier: a kind prefix plus a numeric counter,
/// rendered zero-padded to at least four digits (`P0001`, `PH0012`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId {
    kind: NodeKind,
    num: u32,
}

impl NodeId {
    pub fn new(kind: NodeKind, num: u32) -> Self {
        Self { kind, num }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The numeric suffix, without padding.
    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:04}", self.kind.prefix(), self.num)
    }
}

impl std::str::FromStr for NodeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Longest prefix first so "PH0001" is not read as "P" + "H0001".
        let kind = if let Some(rest) = s.strip_prefix("PH") {
            return parse_suffix(NodeKind::Phase, rest, s);
        } else {
            match s.chars().next() {
                Some('P') => NodeKind::Project,
                Some('E') => NodeKind::Epic,
                Some('F') => NodeKind::Feature,
                Some('S') => NodeKind::Story,
                Some('B') => NodeKind::Bug,
                Some('T') => NodeKind::Task,
                _ => return Err(ParseIdError::UnknownPrefix(s.to_string())),
            }
        };
        parse_suffix(kind, &s[1..], s)
    }
}

fn parse_suffix(kind: NodeKind, rest: &str, original: &str) -> Result<NodeId, ParseIdError> {
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseIdError::InvalidNumber(original.to_string()));
    }
    rest.parse::<u32>()
        .map(|num| NodeId::new(kind, num))
        .map_err(|_| ParseIdError::InvalidNumber(original.to_string()))
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = ParseIdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Work item status. The engine treats this as a tag; any ordering is a
/// presentation concern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Planned,
    InProgress,
    Completed,
    Blocked,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planned => "planned",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Status {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("unknown status '{}'", s)),
        }
    }
}

/// Work item priority.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Work item complexity estimate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
    VeryComplex,
}

/// Child status counts rolled up into a parent record.
///
/// `blocked` is implicit: `total_items - completed - in_progress - planned`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressMetrics {
    pub total_items: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub planned: u32,
    /// Integer percentage in `[0, 100]`, rounded half away from zero.
    pub percentage: u32,
}

impl ProgressMetrics {
    /// Derived count of blocked children.
    pub fn blocked(&self) -> u32 {
        self.total_items
            .saturating_sub(self.completed)
            .saturating_sub(self.in_progress)
            .saturating_sub(self.planned)
    }

    pub fn is_complete(&self) -> bool {
        self.total_items > 0 && self.completed == self.total_items
    }
}

/// One child's contribution as stored in the parent's aggregate record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildSummary {
    pub status: Status,
    /// Leaf children report 100 when completed, 0 otherwise; interior
    /// children report their own aggregate percentage.
    pub progress: u32,
}

/// The per-directory rollup state of a non-leaf node (`state.json`).
///
/// Unknown top-level keys are captured in `extra` and re-emitted after the
/// named fields on round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRecord {
    pub id: NodeId,
    pub status: Status,
    pub progress: ProgressMetrics,
    pub children: BTreeMap<NodeId, ChildSummary>,
    #[serde(with = "timestamp_ms")]
    pub updated: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AggregateRecord {
    /// A fresh record for a node with no children yet.
    pub fn empty(id: NodeId, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id,
            status: Status::Planned,
            progress: ProgressMetrics::default(),
            children: BTreeMap::new(),
            updated: now,
            extra: serde_json::Map::new(),
        }
    }
}

/// One row of the registry (`work_items` map).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Markdown file path relative to the hierarchy root.
    pub path: String,
    pub title: String,
    pub status: Status,
    pub parent: Option<NodeId>,
    pub created: chrono::NaiveDate,
    pub updated: chrono::NaiveDate,
    /// Soft-delete marker. Entries are never removed, so historical ids
    /// stay allocated.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RegistryEntry {
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// The master registry mapping every id to its metadata
/// (`work-item-registry.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub version: String,
    #[serde(with = "timestamp_ms")]
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub work_items: BTreeMap<NodeId, RegistryEntry>,
    /// High-water id counters keyed by kind prefix letter.
    pub id_counters: BTreeMap<String, u32>,
}

impl Registry {
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn new(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
            last_updated: now,
            work_items: BTreeMap::new(),
            id_counters: BTreeMap::new(),
        }
    }
}

/// ISO-8601 UTC timestamps with millisecond precision, e.g.
/// `2026-03-01T12:34:56.789Z`.
pub mod timestamp_ms {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
