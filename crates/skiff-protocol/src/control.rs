//! Control message grammar.
//!
//! PUB and SUB payloads name their target as `TYPE " " NAME "\n"`, for
//! example `queue orders\n` or `topic prices\n`.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Maximum queue/topic name length.
pub const MAX_NAME_LENGTH: usize = 256;

/// Validate a queue or topic name.
///
/// Names are used as directory components by the file relay, so path
/// separators and dot-only names are rejected along with whitespace.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("name too long");
    }
    if name == "." || name == ".." {
        return Err("name cannot be a relative path component");
    }
    if !name.chars().all(|c| c.is_ascii_graphic() && c != '/' && c != '\\') {
        return Err("name contains invalid characters");
    }
    Ok(())
}

/// Kind of a named endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Work queue: each message reaches one reader.
    Queue,
    /// Fan-out: each message reaches every subscriber.
    Topic,
}

impl TargetKind {
    /// Keyword used on the wire and in paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TargetKind::Queue => "queue",
            TargetKind::Topic => "topic",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(TargetKind::Queue),
            "topic" => Ok(TargetKind::Topic),
            other => Err(ProtocolError::InvalidControl(format!(
                "unknown endpoint type {other:?}"
            ))),
        }
    }
}

/// A queue or topic reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Queue or topic.
    pub kind: TargetKind,
    /// Endpoint name.
    pub name: String,
}

impl Target {
    /// Create a target.
    #[must_use]
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Reference a queue.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(TargetKind::Queue, name)
    }

    /// Reference a topic.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(TargetKind::Topic, name)
    }

    /// Encode as a control payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{} {}\n", self.kind, self.name))
    }

    /// Parse a control payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidControl`] if the payload does not
    /// follow `TYPE NAME\n` or the name is invalid.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::InvalidControl("payload is not utf-8".into()))?;
        let line = text
            .strip_suffix('\n')
            .ok_or_else(|| ProtocolError::InvalidControl("missing trailing newline".into()))?;
        let (kind, name) = line
            .split_once(' ')
            .ok_or_else(|| ProtocolError::InvalidControl(format!("malformed target {line:?}")))?;

        let kind = kind.parse()?;
        validate_name(name).map_err(|e| ProtocolError::InvalidControl(e.to_string()))?;

        Ok(Self::new(kind, name))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}
