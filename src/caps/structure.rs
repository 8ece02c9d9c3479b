//! Named format structures: a media type name plus constrained fields.

use super::value::{CapsValue, Value};
use smallvec::SmallVec;
use std::fmt;

/// One format alternative inside a [`Caps`](super::Caps).
///
/// Fields absent from a structure are unconstrained, so adding fields only
/// ever narrows the set of formats it describes.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Structure {
    name: String,
    fields: SmallVec<[(String, CapsValue<Value>); 4]>,
}

impl Structure {
    /// Create a structure with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: SmallVec::new(),
        }
    }

    /// Builder-style field setter.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<CapsValue<Value>>) -> Self {
        self.set(name, value);
        self
    }

    /// The media type name (may be empty).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a field, replacing any previous constraint under that name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<CapsValue<Value>>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Get a field's constraint.
    pub fn get(&self, name: &str) -> Option<&CapsValue<Value>> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Get a field's value if it is fixed.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(CapsValue::as_fixed)
    }

    /// Remove a field.
    pub fn remove(&mut self, name: &str) -> Option<CapsValue<Value>> {
        let idx = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Whether a field is present.
    pub fn has_field(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue<Value>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the structure has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A structure is fixed when every field holds exactly one value.
    pub fn is_fixed(&self) -> bool {
        self.fields.iter().all(|(_, v)| v.is_fixed())
    }

    /// Intersect two structures.
    ///
    /// Names must match. Fields present on both sides are intersected;
    /// fields present on one side only are carried over unchanged.
    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }
        let mut out = Structure::new(self.name.clone());
        for (key, value) in &self.fields {
            let merged = match other.get(key) {
                Some(theirs) => value.intersect_typed(theirs)?,
                None => value.clone(),
            };
            out.fields.push((key.clone(), merged));
        }
        for (key, value) in &other.fields {
            if !self.has_field(key) {
                out.fields.push((key.clone(), value.clone()));
            }
        }
        Some(out)
    }

    /// Whether the two structures share at least one format.
    pub fn can_intersect(&self, other: &Structure) -> bool {
        self.intersect(other).is_some()
    }

    /// Whether every format described by `self` is described by `other`.
    pub fn is_subset(&self, other: &Structure) -> bool {
        if self.name != other.name {
            return false;
        }
        other.fields.iter().all(|(key, theirs)| match self.get(key) {
            Some(ours) => ours.is_subset_typed(theirs),
            None => theirs.is_any(),
        })
    }

    /// Pick one concrete value for every field.
    ///
    /// Fails when a field is unconstrained (`Any`).
    pub fn fixate(&self) -> Option<Structure> {
        let mut out = Structure::new(self.name.clone());
        for (key, value) in &self.fields {
            out.fields.push((key.clone(), CapsValue::Fixed(value.fixate()?)));
        }
        Some(out)
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 || !self.name.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Fraction;

    fn video() -> Structure {
        Structure::new("video/raw")
            .field("format", CapsValue::List(vec![Value::from("I420"), Value::from("NV12")]))
            .field("width", 16..=4096)
            .field("framerate", Fraction::new(30, 1).unwrap())
    }

    #[test]
    fn test_field_access() {
        let s = video();
        assert_eq!(s.name(), "video/raw");
        assert_eq!(s.len(), 3);
        assert!(s.has_field("width"));
        assert_eq!(
            s.get_value("framerate"),
            Some(&Value::Fraction(Fraction::new(30, 1).unwrap()))
        );
        assert!(s.get_value("width").is_none());
        assert!(!s.is_fixed());
    }

    #[test]
    fn test_set_replaces() {
        let mut s = Structure::new("a").field("x", 1);
        s.set("x", 2);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get_value("x"), Some(&Value::Int(2)));
        assert_eq!(s.remove("x"), Some(CapsValue::Fixed(Value::Int(2))));
        assert!(s.is_empty());
    }

    #[test]
    fn test_intersect_carries_one_sided_fields() {
        let a = Structure::new("video/raw").field("width", 640);
        let b = Structure::new("video/raw").field("height", 480);
        let c = a.intersect(&b).unwrap();
        assert_eq!(c.get_value("width"), Some(&Value::Int(640)));
        assert_eq!(c.get_value("height"), Some(&Value::Int(480)));
    }

    #[test]
    fn test_wide_range_not_subset_of_list() {
        let wide = Structure::new("audio/raw").field(
            "channels",
            CapsValue::Range {
                min: Value::Int(i64::MIN),
                max: Value::Int(i64::MAX),
            },
        );
        let listed = Structure::new("audio/raw")
            .field("channels", CapsValue::List(vec![Value::Int(1), Value::Int(2)]));
        assert!(!wide.is_subset(&listed));
    }

    #[test]
    fn test_intersect_name_mismatch() {
        let a = Structure::new("video/raw");
        let b = Structure::new("audio/raw");
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn test_subset() {
        let narrow = Structure::new("video/raw")
            .field("format", "I420")
            .field("width", 640)
            .field("framerate", Fraction::new(30, 1).unwrap());
        assert!(narrow.is_subset(&video()));
        assert!(!video().is_subset(&narrow));
        // Missing constrained field means not a subset.
        assert!(!Structure::new("video/raw").is_subset(&video()));
    }

    #[test]
    fn test_fixate() {
        let fixed = video().fixate().unwrap();
        assert!(fixed.is_fixed());
        assert_eq!(fixed.get_value("format"), Some(&Value::from("I420")));
        assert_eq!(fixed.get_value("width"), Some(&Value::Int(16)));

        let open = Structure::new("x").field("y", CapsValue::<Value>::Any);
        assert!(open.fixate().is_none());
    }

    #[test]
    fn test_display() {
        let s = Structure::new("audio/raw").field("rate", 48000);
        assert_eq!(s.to_string(), "audio/raw, rate=48000");
        let unnamed = Structure::new("").field("format", "A");
        assert_eq!(unnamed.to_string(), "format=A");
    }
}
