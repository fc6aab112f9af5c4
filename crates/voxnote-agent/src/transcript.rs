//! Conversation transcripts.
//!
//! A [`Transcript`] is an ordered, append-only log of [`Entry`] values.  Each
//! entry carries typed [`Segment`]s (text, structured values, images).  The
//! session that produced a transcript owns it; adapters only ever see a
//! read-only view and hand back new entries.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use voxnote_schema::{Schema, Value};

use crate::error::TranscriptError;
use crate::tool::ToolSpec;

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// One atomic unit of content inside an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    /// A structured value together with the schema it was generated for.
    Structured { value: Value, schema: Schema },
    Image(ImageSegment),
}

/// Discriminant used by [`Transcript::segments`] to filter segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Text,
    Structured,
    Image,
}

/// An image attached to a prompt or tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSegment {
    pub source: ImageSource,
}

/// Where an image's pixels come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Url {
        url: String,
    },
    /// Encoded image bytes (PNG, JPEG, ...).  Serialized as base64.
    Bytes {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime_type: String,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn structured(value: Value, schema: Schema) -> Self {
        Self::Structured { value, schema }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image(ImageSegment {
            source: ImageSource::Url { url: url.into() },
        })
    }

    pub fn image_bytes(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Image(ImageSegment {
            source: ImageSource::Bytes {
                data,
                mime_type: mime_type.into(),
            },
        })
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Text(_) => SegmentKind::Text,
            Self::Structured { .. } => SegmentKind::Structured,
            Self::Image(_) => SegmentKind::Image,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Textual rendering sent to text-only backends: text as-is, structured
    /// values as compact JSON, images omitted.
    pub fn render_text(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Structured { value, .. } => Some(value.to_json()),
            Self::Image(_) => None,
        }
    }
}

/// Concatenate the textual rendering of `segments` with no separator.
pub fn join_text(segments: &[Segment]) -> String {
    segments.iter().filter_map(Segment::render_text).collect()
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the call with its [`Entry::ToolOutput`].  Unique per turn.
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Entry {
    /// System-level guidance plus the tools visible for the turn.
    Instructions {
        segments: Vec<Segment>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<ToolSpec>,
    },
    Prompt {
        segments: Vec<Segment>,
    },
    Response {
        segments: Vec<Segment>,
    },
    ToolCalls {
        calls: Vec<ToolCall>,
    },
    ToolOutput {
        id: String,
        tool_name: String,
        segments: Vec<Segment>,
    },
}

impl Entry {
    pub fn instructions(text: impl Into<String>) -> Self {
        Self::Instructions {
            segments: vec![Segment::text(text)],
            tools: Vec::new(),
        }
    }

    pub fn prompt(text: impl Into<String>) -> Self {
        Self::Prompt {
            segments: vec![Segment::text(text)],
        }
    }

    pub fn response(text: impl Into<String>) -> Self {
        Self::Response {
            segments: vec![Segment::text(text)],
        }
    }

    /// The entry's segments.  [`Entry::ToolCalls`] has none.
    pub fn segments(&self) -> &[Segment] {
        match self {
            Self::Instructions { segments, .. }
            | Self::Prompt { segments }
            | Self::Response { segments }
            | Self::ToolOutput { segments, .. } => segments,
            Self::ToolCalls { .. } => &[],
        }
    }

    /// Concatenated text of the entry's segments.
    pub fn text(&self) -> String {
        join_text(self.segments())
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// An ordered, append-only conversation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Append an entry.
    pub fn append(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All segments of the given kind, in transcript order.
    pub fn segments(&self, kind: SegmentKind) -> impl Iterator<Item = &Segment> {
        self.entries
            .iter()
            .flat_map(Entry::segments)
            .filter(move |s| s.kind() == kind)
    }

    /// Segments of the most recently appended [`Entry::Prompt`], or
    /// `fallback` wrapped as one text segment when there is none.
    pub fn prompt_segments(&self, fallback: &str) -> Vec<Segment> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| match entry {
                Entry::Prompt { segments } => Some(segments.clone()),
                _ => None,
            })
            .unwrap_or_else(|| vec![Segment::text(fallback)])
    }

    /// Segments of the first [`Entry::Instructions`], else `fallback` wrapped
    /// as one text segment, else `None`.
    pub fn instruction_segments(&self, fallback: Option<&str>) -> Option<Vec<Segment>> {
        self.entries
            .iter()
            .find_map(|entry| match entry {
                Entry::Instructions { segments, .. } => Some(segments.clone()),
                _ => None,
            })
            .or_else(|| fallback.map(|text| vec![Segment::text(text)]))
    }

    /// Check that every tool output answers a tool call issued earlier in
    /// the same turn and that call ids are unique per turn.  A turn starts
    /// at each [`Entry::Prompt`].
    pub fn validate(&self) -> Result<(), TranscriptError> {
        let mut issued: HashSet<&str> = HashSet::new();

        for (index, entry) in self.entries.iter().enumerate() {
            match entry {
                Entry::Prompt { .. } => issued.clear(),
                Entry::ToolCalls { calls } => {
                    for call in calls {
                        if !issued.insert(call.id.as_str()) {
                            return Err(TranscriptError::DuplicateToolCallId {
                                id: call.id.clone(),
                                index,
                            });
                        }
                    }
                }
                Entry::ToolOutput { id, .. } if !issued.contains(id.as_str()) => {
                    return Err(TranscriptError::OrphanToolOutput {
                        id: id.clone(),
                        index,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Extend<Entry> for Transcript {
    fn extend<I: IntoIterator<Item = Entry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
