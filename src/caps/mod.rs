//! Capability sets: descriptions of the data formats a pad can produce or accept.
//!
//! A [`Caps`] is either ANY (every format), EMPTY (no format), or an ordered
//! list of [`Structure`]s. Order expresses preference, first is best.
//!
//! # Example
//!
//! ```rust
//! use sluice::caps::Caps;
//!
//! let src: Caps = "video/raw, format={I420, NV12}, width=[1, 1920]".parse().unwrap();
//! let sink: Caps = "video/raw, format=NV12".parse().unwrap();
//!
//! let common = src.intersect(&sink);
//! assert!(!common.is_empty());
//!
//! let fixed = common.fixate().unwrap();
//! assert!(fixed.is_fixed());
//! assert_eq!(fixed.to_string(), "video/raw, format=NV12, width=1");
//! ```

mod parse;
mod structure;
mod value;

pub use parse::parse_caps;
pub use structure::Structure;
pub use value::{CapsValue, Fraction, Value, ValueKind};

use crate::error::Error;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// A set of formats.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Caps {
    any: bool,
    structures: SmallVec<[Structure; 2]>,
}

impl Caps {
    /// Caps matching every format.
    pub fn new_any() -> Self {
        Self {
            any: true,
            structures: SmallVec::new(),
        }
    }

    /// Caps matching no format.
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// Caps holding a single structure.
    pub fn from_structure(structure: Structure) -> Self {
        let mut structures = SmallVec::new();
        structures.push(structure);
        Self {
            any: false,
            structures,
        }
    }

    /// Caps holding a structure with only a name.
    pub fn new_simple(name: impl Into<String>) -> Self {
        Self::from_structure(Structure::new(name))
    }

    /// Whether this is the ANY set.
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// Whether this is the EMPTY set.
    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// Fixed caps hold exactly one structure whose fields are all fixed.
    pub fn is_fixed(&self) -> bool {
        !self.any && self.structures.len() == 1 && self.structures[0].is_fixed()
    }

    /// Number of structures (zero for ANY and EMPTY).
    pub fn size(&self) -> usize {
        self.structures.len()
    }

    /// Get a structure by index.
    pub fn structure(&self, index: usize) -> Option<&Structure> {
        self.structures.get(index)
    }

    /// Iterate over structures.
    pub fn structures(&self) -> impl Iterator<Item = &Structure> {
        self.structures.iter()
    }

    /// Append a structure unless an existing one already covers it.
    ///
    /// Appending to ANY is a no-op.
    pub fn append_structure(&mut self, structure: Structure) {
        if self.any {
            return;
        }
        if !self.structures.iter().any(|s| structure.is_subset(s)) {
            self.structures.push(structure);
        }
    }

    /// Intersection: the formats described by both sets.
    ///
    /// The result follows the preference order of `self`.
    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }
        let mut out = Caps::new_empty();
        for ours in &self.structures {
            for theirs in &other.structures {
                if let Some(s) = ours.intersect(theirs) {
                    out.append_structure(s);
                }
            }
        }
        out
    }

    /// Whether the sets share at least one format.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if self.any || other.any {
            return true;
        }
        self.structures
            .iter()
            .any(|a| other.structures.iter().any(|b| a.can_intersect(b)))
    }

    /// Union: the formats described by either set.
    pub fn union(&self, other: &Caps) -> Caps {
        if self.any || other.any {
            return Caps::new_any();
        }
        let mut out = self.clone();
        for s in &other.structures {
            out.append_structure(s.clone());
        }
        out
    }

    /// Whether every format of `self` is also in `other`.
    pub fn is_subset(&self, other: &Caps) -> bool {
        if other.any || self.is_empty() {
            return true;
        }
        if self.any {
            return false;
        }
        self.structures
            .iter()
            .all(|s| other.structures.iter().any(|o| s.is_subset(o)))
    }

    /// Set equality.
    pub fn is_equal(&self, other: &Caps) -> bool {
        self.is_subset(other) && other.is_subset(self)
    }

    /// Drop structures that are covered by another structure in the set.
    pub fn simplify(&self) -> Caps {
        if self.any {
            return self.clone();
        }
        let mut out = Caps::new_empty();
        for (i, s) in self.structures.iter().enumerate() {
            let covered = self
                .structures
                .iter()
                .enumerate()
                .any(|(j, o)| j != i && s.is_subset(o) && (!o.is_subset(s) || j < i));
            if !covered {
                out.structures.push(s.clone());
            }
        }
        out
    }

    /// Keep only the first (preferred) structure.
    pub fn truncate(&self) -> Caps {
        match self.structures.first() {
            Some(s) if !self.any => Caps::from_structure(s.clone()),
            _ => self.clone(),
        }
    }

    /// Pick one concrete format: the first structure with every field fixed
    /// to its preferred value.
    ///
    /// Fails for ANY, EMPTY and structures with unconstrained fields.
    pub fn fixate(&self) -> Option<Caps> {
        if self.any {
            return None;
        }
        self.structures
            .first()
            .and_then(Structure::fixate)
            .map(Caps::from_structure)
    }
}

impl From<Structure> for Caps {
    fn from(structure: Structure) -> Self {
        Caps::from_structure(structure)
    }
}

impl FromStr for Caps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_caps(s)
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }
        for (i, s) in self.structures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(s: &str) -> Caps {
        s.parse().unwrap()
    }

    #[test]
    fn test_special_caps() {
        assert!(Caps::new_any().is_any());
        assert!(!Caps::new_any().is_empty());
        assert!(Caps::new_empty().is_empty());
        assert!(!Caps::new_empty().is_fixed());
        assert!(!Caps::new_any().is_fixed());
    }

    #[test]
    fn test_disjoint_formats() {
        let a = caps("format=A");
        let b = caps("format=B");
        assert!(a.intersect(&b).is_empty());
        assert!(!a.can_intersect(&b));
    }

    #[test]
    fn test_intersect_with_any() {
        let a = caps("video/raw, width=[1, 100]");
        assert!(a.intersect(&Caps::new_any()).is_equal(&a));
        assert!(Caps::new_any().intersect(&a).is_equal(&a));
        assert!(a.intersect(&Caps::new_empty()).is_empty());
    }

    #[test]
    fn test_intersect_commutative() {
        let a = caps("video/raw, format={I420, NV12}, width=[1, 1920]; audio/raw, rate=[8000, 96000]");
        let b = caps("audio/raw, rate={44100, 48000, 192000}; video/raw, width=[640, 4096]");
        let ab = a.intersect(&b);
        let ba = b.intersect(&a);
        assert!(!ab.is_empty());
        assert!(ab.is_equal(&ba));
    }

    #[test]
    fn test_intersect_associative() {
        let a = caps("video/raw, width=[1, 1000]");
        let b = caps("video/raw, width=[500, 2000], height=[1, 100]");
        let c = caps("video/raw, width={600, 1500}");
        let left = a.intersect(&b).intersect(&c);
        let right = a.intersect(&b.intersect(&c));
        assert!(left.is_equal(&right));
        assert_eq!(left.to_string(), "video/raw, width=600, height=[1, 100]");
    }

    #[test]
    fn test_intersect_keeps_first_operand_order() {
        let a = caps("x/a; x/b");
        let b = caps("x/b; x/a");
        assert_eq!(a.intersect(&b).to_string(), "x/a; x/b");
        assert_eq!(b.intersect(&a).to_string(), "x/b; x/a");
    }

    #[test]
    fn test_union_and_simplify() {
        let a = caps("audio/raw, rate=[8000, 96000]");
        let b = caps("audio/raw, rate=48000");
        let u = a.union(&b);
        assert_eq!(u.size(), 1);
        assert!(b.is_subset(&u));

        let c = caps("video/raw");
        let u = a.union(&c);
        assert_eq!(u.size(), 2);
        assert!(a.union(&Caps::new_any()).is_any());

        let mut redundant = Caps::new_empty();
        redundant.structures.push(Structure::new("x").field("v", 1));
        redundant.structures.push(Structure::new("x"));
        let simple = redundant.simplify();
        assert_eq!(simple.size(), 1);
        assert_eq!(simple.to_string(), "x");
    }

    #[test]
    fn test_subset() {
        let narrow = caps("video/raw, width=640");
        let wide = caps("video/raw, width=[1, 1920]; audio/raw");
        assert!(narrow.is_subset(&wide));
        assert!(!wide.is_subset(&narrow));
        assert!(Caps::new_empty().is_subset(&narrow));
        assert!(narrow.is_subset(&Caps::new_any()));
        assert!(!Caps::new_any().is_subset(&narrow));
    }

    #[test]
    fn test_fixate() {
        let c = caps("video/raw, format={NV12, I420}, width=[320, 1920]; audio/raw");
        let fixed = c.fixate().unwrap();
        assert!(fixed.is_fixed());
        assert_eq!(fixed.to_string(), "video/raw, format=NV12, width=320");
        assert!(fixed.is_subset(&c));

        assert!(Caps::new_any().fixate().is_none());
        assert!(Caps::new_empty().fixate().is_none());
    }

    #[test]
    fn test_truncate() {
        let c = caps("x/a; x/b");
        assert_eq!(c.truncate().to_string(), "x/a");
        assert!(Caps::new_any().truncate().is_any());
    }
}
