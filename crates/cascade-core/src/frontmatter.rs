//! Frontmatter codec for work item markdown files.
//!
//! A work item file starts with a `---` delimited YAML mapping followed by
//! the markdown body. The codec parses the mapping into an
//! order-preserving structure, exposes the typed fields the engine cares
//! about, and re-emits files with the body untouched byte for byte.
//! Unknown keys round-trip verbatim; keys written by the engine update in
//! place when present and are appended otherwise.

use crate::types::{Complexity, NodeId, NodeKind, Priority, Status};
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml_ng::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontmatterError {
    /// The file does not begin with the opening delimiter line.
    #[error("file does not start with a frontmatter block")]
    NoFrontmatter,

    #[error("invalid frontmatter syntax: {0}")]
    InvalidSyntax(String),

    #[error("frontmatter is not a key/value mapping")]
    NotAMapping,
}

pub type Result<T> = std::result::Result<T, FrontmatterError>;

/// Line ending style observed on parse, reproduced on emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Newline {
    Lf,
    CrLf,
}

const DELIMITER: &str = "---";

/// A parsed frontmatter block.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontmatter {
    mapping: Mapping,
    newline: Newline,
}

impl Default for Frontmatter {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontmatter {
    /// An empty block for a document the engine is about to create.
    pub fn new() -> Self {
        Self {
            mapping: Mapping::new(),
            newline: Newline::Lf,
        }
    }

    /// Split `bytes` into the frontmatter mapping and the untouched body.
    pub fn parse(bytes: &[u8]) -> Result<(Self, Vec<u8>)> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| FrontmatterError::InvalidSyntax(format!("not UTF-8: {}", e)))?;

        let (newline, after_open) = if let Some(rest) = text.strip_prefix("---\r\n") {
            (Newline::CrLf, rest)
        } else if let Some(rest) = text.strip_prefix("---\n") {
            (Newline::Lf, rest)
        } else {
            return Err(FrontmatterError::NoFrontmatter);
        };

        let (block, body) = split_at_closing_delimiter(after_open)
            .ok_or_else(|| FrontmatterError::InvalidSyntax("unterminated frontmatter".into()))?;

        // Normalize line endings for the YAML parser; the mapping is
        // re-emitted from parsed values, never from the raw block.
        let yaml_text = if newline == Newline::CrLf {
            block.replace("\r\n", "\n")
        } else {
            block.to_string()
        };

        let value: Value = serde_yaml_ng::from_str(&yaml_text)
            .map_err(|e| FrontmatterError::InvalidSyntax(e.to_string()))?;
        let mapping = match value {
            Value::Mapping(m) => m,
            _ => return Err(FrontmatterError::NotAMapping),
        };

        Ok((Self { mapping, newline }, body.as_bytes().to_vec()))
    }

    /// Render the block followed by `body`, reproducing the line ending
    /// style observed on parse. Key order is the order of the mapping.
    pub fn emit(&self, body: &[u8]) -> Result<Vec<u8>> {
        let yaml = serde_yaml_ng::to_string(&Value::Mapping(self.mapping.clone()))
            .map_err(|e| FrontmatterError::InvalidSyntax(e.to_string()))?;

        let mut head = String::with_capacity(yaml.len() + 16);
        head.push_str(DELIMITER);
        head.push('\n');
        head.push_str(&yaml);
        head.push_str(DELIMITER);
        head.push('\n');

        let head = match self.newline {
            Newline::Lf => head,
            Newline::CrLf => head.replace('\n', "\r\n"),
        };

        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        Ok(out)
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.mapping
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        if value.is_null() {
            return None;
        }
        serde_yaml_ng::from_value(value.clone()).ok()
    }

    fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        let value = serde_yaml_ng::to_value(value).unwrap_or(Value::Null);
        self.mapping.insert(Value::String(key.to_string()), value);
    }

    pub fn id(&self) -> Option<NodeId> {
        self.get_typed("id")
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.get_typed("kind")
    }

    pub fn title(&self) -> Option<String> {
        self.get_typed("title")
    }

    pub fn status(&self) -> Option<Status> {
        self.get_typed("status")
    }

    pub fn priority(&self) -> Option<Priority> {
        self.get_typed("priority")
    }

    pub fn complexity(&self) -> Option<Complexity> {
        self.get_typed("complexity")
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.get_typed("parent")
    }

    pub fn created(&self) -> Option<NaiveDate> {
        self.get_typed("created")
    }

    pub fn updated(&self) -> Option<NaiveDate> {
        self.get_typed("updated")
    }

    pub fn assignee(&self) -> Option<String> {
        self.get_typed("assignee")
    }

    pub fn tags(&self) -> Vec<String> {
        self.get_typed("tags").unwrap_or_default()
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.get_typed("due_date")
    }

    pub fn set_id(&mut self, id: NodeId) {
        self.set("id", &id);
    }

    pub fn set_kind(&mut self, kind: NodeKind) {
        self.set("kind", &kind);
    }

    pub fn set_title(&mut self, title: &str) {
        self.set("title", &title);
    }

    pub fn set_status(&mut self, status: Status) {
        self.set("status", &status);
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.set("priority", &priority);
    }

    pub fn set_complexity(&mut self, complexity: Complexity) {
        self.set("complexity", &complexity);
    }

    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        self.set("parent", &parent);
    }

    pub fn set_created(&mut self, date: NaiveDate) {
        self.set("created", &date.format("%Y-%m-%d").to_string());
    }

    pub fn set_updated(&mut self, date: NaiveDate) {
        self.set("updated", &date.format("%Y-%m-%d").to_string());
    }
}

/// Find the `---` line closing the block. Returns the YAML text before it
/// and the body after it, both borrowed from the input.
fn split_at_closing_delimiter(text: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.strip_suffix('\n').unwrap_or(line);
        let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
        if trimmed == DELIMITER {
            let body_start = offset + line.len();
            return Some((&text[..offset], &text[body_start..]));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "---\n\
id: S0001\n\
kind: story\n\
title: Wire the codec\n\
status: in-progress\n\
priority: high\n\
complexity: medium\n\
parent: F0001\n\
created: 2026-02-27\n\
updated: 2026-02-28\n\
---\n\
\n\
## Notes\n\
Body text stays untouched.\n";

    #[test]
    fn parses_typed_fields() {
        let (fm, body) = Frontmatter::parse(CANONICAL.as_bytes()).unwrap();
        assert_eq!(fm.id().unwrap().to_string(), "S0001");
        assert_eq!(fm.kind(), Some(NodeKind::Story));
        assert_eq!(fm.title().as_deref(), Some("Wire the codec"));
        assert_eq!(fm.status(), Some(Status::InProgress));
        assert_eq!(fm.priority(), Some(Priority::High));
        assert_eq!(fm.complexity(), Some(Complexity::Medium));
        assert_eq!(fm.parent().unwrap().to_string(), "F0001");
        assert_eq!(
            fm.created(),
            Some(NaiveDate::from_ymd_opt(2026, 2, 27).unwrap())
        );
        assert!(body.starts_with(b"\n## Notes"));
    }

    #[test]
    fn canonical_files_round_trip_byte_for_byte() {
        let (fm, body) = Frontmatter::parse(CANONICAL.as_bytes()).unwrap();
        let emitted = fm.emit(&body).unwrap();
        assert_eq!(std::str::from_utf8(&emitted).unwrap(), CANONICAL);
    }

    #[test]
    fn crlf_files_round_trip() {
        let crlf = CANONICAL.replace('\n', "\r\n");
        let (fm, body) = Frontmatter::parse(crlf.as_bytes()).unwrap();
        assert_eq!(fm.status(), Some(Status::InProgress));
        let emitted = fm.emit(&body).unwrap();
        assert_eq!(std::str::from_utf8(&emitted).unwrap(), crlf);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let text = "---\nid: T0001\ncustom_field: kept\ntags:\n- core\n- io\n---\nbody\n";
        let (fm, body) = Frontmatter::parse(text.as_bytes()).unwrap();
        assert_eq!(fm.tags(), vec!["core".to_string(), "io".to_string()]);
        let emitted = fm.emit(&body).unwrap();
        assert_eq!(std::str::from_utf8(&emitted).unwrap(), text);
    }

    #[test]
    fn set_status_updates_in_place() {
        let (mut fm, body) = Frontmatter::parse(CANONICAL.as_bytes()).unwrap();
        fm.set_status(Status::Completed);
        fm.set_updated(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let emitted = String::from_utf8(fm.emit(&body).unwrap()).unwrap();
        assert!(emitted.contains("status: completed\npriority: high"));
        assert!(emitted.contains("updated: 2026-03-01\n---\n"));
    }

    #[test]
    fn engine_written_keys_append_in_call_order() {
        let text = "---\nid: T0001\n---\n";
        let (mut fm, body) = Frontmatter::parse(text.as_bytes()).unwrap();
        fm.set_status(Status::Planned);
        fm.set_updated(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let emitted = String::from_utf8(fm.emit(&body).unwrap()).unwrap();
        assert_eq!(
            emitted,
            "---\nid: T0001\nstatus: planned\nupdated: 2026-03-01\n---\n"
        );
    }

    #[test]
    fn missing_block_is_no_frontmatter() {
        let err = Frontmatter::parse(b"# Just markdown\n").unwrap_err();
        assert!(matches!(err, FrontmatterError::NoFrontmatter));
    }

    #[test]
    fn unterminated_block_is_invalid_syntax() {
        let err = Frontmatter::parse(b"---\nid: T0001\n").unwrap_err();
        assert!(matches!(err, FrontmatterError::InvalidSyntax(_)));
    }

    #[test]
    fn scalar_block_is_not_a_mapping() {
        let err = Frontmatter::parse(b"---\njust a string\n---\n").unwrap_err();
        assert!(matches!(err, FrontmatterError::NotAMapping));
    }

    #[test]
    fn null_parent_reads_as_none() {
        let text = "---\nid: P0001\nparent: null\n---\n";
        let (fm, _) = Frontmatter::parse(text.as_bytes()).unwrap();
        assert_eq!(fm.parent(), None);
        assert_eq!(fm.id().unwrap().kind(), NodeKind::Project);
    }
}
