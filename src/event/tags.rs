//! Stream tags: descriptive metadata carried by tag events and messages.
//!
//! A tag may hold several values (for example two artists). Merging two
//! lists follows a [`TagMergeMode`].
//!
//! # Example
//!
//! ```rust
//! use sluice::event::{TagList, TagMergeMode};
//!
//! let mut tags = TagList::new();
//! tags.add("title", "Intro");
//! tags.add("bitrate", 128_000u64);
//!
//! let mut more = TagList::new();
//! more.add("title", "Other");
//! more.add("artist", "Someone");
//!
//! tags.merge(&more, TagMergeMode::Keep);
//! assert_eq!(tags.get_string("title"), Some("Intro"));
//! assert_eq!(tags.get_string("artist"), Some("Someone"));
//! ```

use std::collections::BTreeMap;

/// Common tag names.
pub mod names {
    /// Track title.
    pub const TITLE: &str = "title";
    /// Performer.
    pub const ARTIST: &str = "artist";
    /// Duration in nanoseconds.
    pub const DURATION: &str = "duration";
    /// Nominal bitrate in bits per second.
    pub const BITRATE: &str = "bitrate";
    /// Codec description.
    pub const CODEC: &str = "codec";
    /// Container format.
    pub const CONTAINER: &str = "container-format";
    /// ISO 639 language code.
    pub const LANGUAGE: &str = "language-code";
}

/// A single tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Text.
    String(String),
    /// Unsigned integer (durations, bitrates).
    UInt(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Opaque bytes (cover art and the like).
    Binary(Vec<u8>),
}

impl TagValue {
    /// Text value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Unsigned value, if this is one.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            TagValue::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Signed value, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TagValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean value, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

macro_rules! tag_value_from {
    ($($ty:ty => |$v:ident| $e:expr),* $(,)?) => {
        $(
            impl From<$ty> for TagValue {
                fn from($v: $ty) -> Self {
                    $e
                }
            }
        )*
    };
}

tag_value_from! {
    String => |s| TagValue::String(s),
    &str => |s| TagValue::String(s.to_string()),
    u64 => |n| TagValue::UInt(n),
    u32 => |n| TagValue::UInt(n.into()),
    i64 => |n| TagValue::Int(n),
    i32 => |n| TagValue::Int(n.into()),
    f64 => |n| TagValue::Double(n),
    bool => |b| TagValue::Bool(b),
    Vec<u8> => |b| TagValue::Binary(b),
}

/// How [`TagList::merge`] combines two lists.
///
/// In the descriptions, "existing" is the list being merged into and "new"
/// is the argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TagMergeMode {
    /// Drop every existing tag, take the new list as is.
    ReplaceAll,
    /// New values replace existing values of the same tag.
    #[default]
    Replace,
    /// New values are added after existing values.
    Append,
    /// New values are added before existing values.
    Prepend,
    /// Existing values win; new tags are only added when absent.
    Keep,
    /// Ignore the new list entirely.
    KeepAll,
}

/// An ordered map from tag name to one or more values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagList {
    tags: BTreeMap<String, Vec<TagValue>>,
}

impl TagList {
    /// Create an empty tag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.insert(name.into(), vec![value.into()]);
    }

    /// Add a value to `name`, keeping existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.entry(name.into()).or_default().push(value.into());
    }

    /// First value of a tag.
    pub fn get(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name).and_then(|v| v.first())
    }

    /// All values of a tag.
    pub fn get_all(&self, name: &str) -> &[TagValue] {
        self.tags.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// First value of a tag as text.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(TagValue::as_str)
    }

    /// First value of a tag as an unsigned integer.
    pub fn get_uint(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(TagValue::as_uint)
    }

    /// Remove a tag and all its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<TagValue>> {
        self.tags.remove(name)
    }

    /// Whether a tag is present.
    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Number of distinct tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the list holds no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate over tags in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TagValue])> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Merge `other` into `self`.
    pub fn merge(&mut self, other: &TagList, mode: TagMergeMode) {
        match mode {
            TagMergeMode::ReplaceAll => self.tags = other.tags.clone(),
            TagMergeMode::KeepAll => {}
            _ => {
                for (name, values) in &other.tags {
                    let existing = self.tags.entry(name.clone()).or_default();
                    match mode {
                        TagMergeMode::Replace => *existing = values.clone(),
                        TagMergeMode::Append => existing.extend(values.iter().cloned()),
                        TagMergeMode::Prepend => {
                            let mut merged = values.clone();
                            merged.append(existing);
                            *existing = merged;
                        }
                        TagMergeMode::Keep if existing.is_empty() => *existing = values.clone(),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Merge two lists into a new one.
    pub fn merged(&self, other: &TagList, mode: TagMergeMode) -> TagList {
        let mut out = self.clone();
        out.merge(other, mode);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TagList {
        let mut tags = TagList::new();
        tags.add(names::TITLE, "one");
        tags.add(names::ARTIST, "a");
        tags
    }

    fn other() -> TagList {
        let mut tags = TagList::new();
        tags.add(names::TITLE, "two");
        tags.add(names::BITRATE, 320u32);
        tags
    }

    #[test]
    fn test_set_and_add() {
        let mut tags = TagList::new();
        tags.add(names::ARTIST, "a");
        tags.add(names::ARTIST, "b");
        assert_eq!(tags.get_all(names::ARTIST).len(), 2);
        assert_eq!(tags.get_string(names::ARTIST), Some("a"));

        tags.set(names::ARTIST, "c");
        assert_eq!(tags.get_all(names::ARTIST), &[TagValue::from("c")]);
        assert!(tags.get_all("missing").is_empty());
    }

    #[test]
    fn test_merge_replace_and_keep() {
        let replaced = sample().merged(&other(), TagMergeMode::Replace);
        assert_eq!(replaced.get_string(names::TITLE), Some("two"));
        assert_eq!(replaced.get_string(names::ARTIST), Some("a"));
        assert_eq!(replaced.get_uint(names::BITRATE), Some(320));

        let kept = sample().merged(&other(), TagMergeMode::Keep);
        assert_eq!(kept.get_string(names::TITLE), Some("one"));
        assert_eq!(kept.get_uint(names::BITRATE), Some(320));
    }

    #[test]
    fn test_merge_append_and_prepend() {
        let appended = sample().merged(&other(), TagMergeMode::Append);
        let titles: Vec<_> = appended
            .get_all(names::TITLE)
            .iter()
            .filter_map(TagValue::as_str)
            .collect();
        assert_eq!(titles, ["one", "two"]);

        let prepended = sample().merged(&other(), TagMergeMode::Prepend);
        assert_eq!(prepended.get_string(names::TITLE), Some("two"));
    }

    #[test]
    fn test_merge_all_modes() {
        let all = sample().merged(&other(), TagMergeMode::ReplaceAll);
        assert_eq!(all, other());
        let none = sample().merged(&other(), TagMergeMode::KeepAll);
        assert_eq!(none, sample());
    }
}
