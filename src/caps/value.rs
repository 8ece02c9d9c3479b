//! Typed field values and the constraint algebra used by caps structures.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Fraction
// ============================================================================

/// A reduced rational number, used for framerates and aspect ratios.
///
/// The denominator is always positive and the pair is kept in lowest terms,
/// so structural equality is numeric equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: i32,
    den: i32,
}

impl Fraction {
    /// Create a fraction in lowest terms.
    ///
    /// Fails on a zero denominator and when the normalized pair does not fit
    /// in `i32` (only `i32::MIN` over a negative denominator).
    pub fn new(num: i32, den: i32) -> Result<Self> {
        if den == 0 {
            return Err(Error::InvalidArgument(format!("fraction {num}/0")));
        }
        let (mut wide_num, mut wide_den) = (i64::from(num), i64::from(den));
        if wide_den < 0 {
            wide_num = -wide_num;
            wide_den = -wide_den;
        }
        let g = gcd(wide_num.unsigned_abs(), wide_den.unsigned_abs()).max(1) as i64;
        let overflow = || Error::InvalidArgument(format!("fraction {num}/{den} overflows"));
        Ok(Self {
            num: i32::try_from(wide_num / g).map_err(|_| overflow())?,
            den: i32::try_from(wide_den / g).map_err(|_| overflow())?,
        })
    }

    /// Numerator.
    pub fn numer(&self) -> i32 {
        self.num
    }

    /// Denominator (always positive).
    pub fn denom(&self) -> i32 {
        self.den
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num as i64 * other.den as i64).cmp(&(other.num as i64 * self.den as i64))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

// ============================================================================
// Value
// ============================================================================

/// Kind of a [`Value`]. Values of different kinds never intersect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
    /// String.
    Str,
    /// Fraction.
    Fraction,
}

/// A concrete field value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
    /// Fraction.
    Fraction(Fraction),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
            Value::Fraction(_) => ValueKind::Fraction,
        }
    }

    /// Get as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Get as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as a fraction.
    pub fn as_fraction(&self) -> Option<Fraction> {
        match self {
            Value::Fraction(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Fraction(a), Value::Fraction(b)) => a.cmp(b),
            (a, b) => a.kind().cmp(&b.kind()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => {
                if v.is_empty() || v.chars().any(|c| !is_bare_char(c)) {
                    write!(f, "\"{v}\"")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Fraction(v) => write!(f, "{v}"),
        }
    }
}

/// Characters allowed in an unquoted string value.
pub(crate) fn is_bare_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '+' | '/' | ':')
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Fraction> for Value {
    fn from(v: Fraction) -> Self {
        Value::Fraction(v)
    }
}

// ============================================================================
// CapsValue
// ============================================================================

/// A constraint on one field: a fixed value, an inclusive range, a list of
/// alternatives ordered by preference, or unconstrained.
///
/// ```rust
/// use sluice::caps::{CapsValue, Value};
///
/// let fixed = CapsValue::Fixed(Value::Int(1920));
/// let range = CapsValue::Range { min: Value::Int(720), max: Value::Int(1920) };
///
/// assert_eq!(fixed.intersect(&range), Some(CapsValue::Fixed(Value::Int(1920))));
/// ```
#[derive(Clone, Debug, PartialEq, Default)]
pub enum CapsValue<T> {
    /// Exact value (fully constrained).
    Fixed(T),
    /// Range of acceptable values (inclusive).
    Range {
        /// Minimum acceptable value.
        min: T,
        /// Maximum acceptable value.
        max: T,
    },
    /// List of acceptable values (ordered by preference, first is best).
    List(Vec<T>),
    /// Any value accepted (unconstrained).
    #[default]
    Any,
}

impl<T: Clone + Ord> CapsValue<T> {
    /// Check if a value is accepted by this constraint.
    pub fn accepts(&self, value: &T) -> bool {
        match self {
            Self::Fixed(v) => v == value,
            Self::Range { min, max } => value >= min && value <= max,
            Self::List(values) => values.contains(value),
            Self::Any => true,
        }
    }

    /// Intersect two constraints, finding common values.
    ///
    /// Returns `None` if there's no overlap. Lists keep the order of `self`.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Any, other) => Some(other.clone()),
            (self_, Self::Any) => Some(self_.clone()),

            (Self::Fixed(a), Self::Fixed(b)) => (a == b).then(|| Self::Fixed(a.clone())),

            (Self::Fixed(v), Self::Range { min, max })
            | (Self::Range { min, max }, Self::Fixed(v)) => {
                (v >= min && v <= max).then(|| Self::Fixed(v.clone()))
            }

            (Self::Fixed(v), Self::List(list)) | (Self::List(list), Self::Fixed(v)) => {
                list.contains(v).then(|| Self::Fixed(v.clone()))
            }

            (
                Self::Range {
                    min: min1,
                    max: max1,
                },
                Self::Range {
                    min: min2,
                    max: max2,
                },
            ) => {
                let new_min = min1.max(min2);
                let new_max = max1.min(max2);
                match new_min.cmp(new_max) {
                    Ordering::Greater => None,
                    Ordering::Equal => Some(Self::Fixed(new_min.clone())),
                    Ordering::Less => Some(Self::Range {
                        min: new_min.clone(),
                        max: new_max.clone(),
                    }),
                }
            }

            (Self::Range { min, max }, Self::List(list)) => {
                Self::from_candidates(list.iter().filter(|v| *v >= min && *v <= max))
            }
            (Self::List(list), Self::Range { min, max }) => {
                Self::from_candidates(list.iter().filter(|v| *v >= min && *v <= max))
            }

            (Self::List(list1), Self::List(list2)) => {
                Self::from_candidates(list1.iter().filter(|v| list2.contains(v)))
            }
        }
    }

    fn from_candidates<'a>(values: impl Iterator<Item = &'a T>) -> Option<Self>
    where
        T: 'a,
    {
        let mut common: Vec<T> = Vec::new();
        for v in values {
            if !common.contains(v) {
                common.push(v.clone());
            }
        }
        match common.len() {
            0 => None,
            1 => common.pop().map(Self::Fixed),
            _ => Some(Self::List(common)),
        }
    }

    /// Check whether every value accepted by `self` is accepted by `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::Any) => true,
            (Self::Any, _) => false,
            (Self::Fixed(v), other) => other.accepts(v),
            (Self::List(values), other) => values.iter().all(|v| other.accepts(v)),
            (Self::Range { min, max }, Self::Range { min: omin, max: omax }) => {
                min >= omin && max <= omax
            }
            (Self::Range { min, max }, Self::Fixed(v)) => min == v && max == v,
            (Self::Range { .. }, Self::List(_)) => false,
        }
    }

    /// Fixate: choose a single value from the constraint.
    ///
    /// Returns the preferred value (first in list, min in range).
    /// Returns `None` for `Any` (cannot fixate without default).
    pub fn fixate(&self) -> Option<T> {
        match self {
            Self::Fixed(v) => Some(v.clone()),
            Self::Range { min, .. } => Some(min.clone()),
            Self::List(values) => values.first().cloned(),
            Self::Any => None,
        }
    }

    /// Check if this is a fixed value.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    /// Check if this accepts any value.
    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Get the fixed value if this is fixed.
    #[inline]
    pub fn as_fixed(&self) -> Option<&T> {
        match self {
            Self::Fixed(v) => Some(v),
            _ => None,
        }
    }
}

impl CapsValue<Value> {
    /// The value kind constrained by this field, if any.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Fixed(v) => Some(v.kind()),
            Self::Range { min, .. } => Some(min.kind()),
            Self::List(values) => values.first().map(Value::kind),
            Self::Any => None,
        }
    }

    /// Intersect, treating constraints of different kinds as disjoint.
    pub fn intersect_typed(&self, other: &Self) -> Option<Self> {
        match (self.kind(), other.kind()) {
            (Some(a), Some(b)) if a != b => None,
            _ => self.intersect(other),
        }
    }

    /// Subset test, treating constraints of different kinds as disjoint.
    pub fn is_subset_typed(&self, other: &Self) -> bool {
        match (self.kind(), other.kind()) {
            (Some(a), Some(b)) if a != b => false,
            _ => match (self, other) {
                (Self::Range { min, max }, Self::List(list)) => {
                    // An integer range is covered by a list holding each of its values.
                    match (min.as_int(), max.as_int()) {
                        (Some(lo), Some(hi))
                            if hi.checked_sub(lo).is_some_and(|d| d < list.len() as i64) =>
                        {
                            (lo..=hi).all(|i| list.contains(&Value::Int(i)))
                        }
                        _ => false,
                    }
                }
                _ => self.is_subset(other),
            },
        }
    }
}

impl<T: fmt::Display> fmt::Display for CapsValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(v) => write!(f, "{v}"),
            Self::Range { min, max } => write!(f, "[{min}, {max}]"),
            Self::List(values) => {
                write!(f, "{{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Self::Any => write!(f, "ANY"),
        }
    }
}

impl<T: Clone + Ord> From<T> for CapsValue<T> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}

impl<T: Clone + Ord> From<Vec<T>> for CapsValue<T> {
    fn from(mut values: Vec<T>) -> Self {
        match values.len() {
            0 => Self::Any,
            1 => values.pop().map(Self::Fixed).unwrap_or(Self::Any),
            _ => Self::List(values),
        }
    }
}

macro_rules! impl_fixed_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CapsValue<Value> {
                fn from(value: $ty) -> Self {
                    Self::Fixed(Value::from(value))
                }
            }
        )*
    };
}

impl_fixed_from!(i32, i64, bool, &str, String, Fraction);

impl From<std::ops::RangeInclusive<i32>> for CapsValue<Value> {
    fn from(range: std::ops::RangeInclusive<i32>) -> Self {
        let (min, max) = range.into_inner();
        Self::Range {
            min: Value::from(min),
            max: Value::from(max),
        }
    }
}
