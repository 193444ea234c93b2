//! The TLA+ value algebra.
//!
//! A [`Value`] is an immutable, structurally compared, totally ordered datum.
//! Aggregate variants share their payload behind an [`Arc`], so cloning is
//! cheap and values can be held simultaneously by an archetype, its
//! resources, and in-flight network frames without copying.
//!
//! The derived order (variant rank first, then contents, with sets and
//! function entries compared in ascending element order) is the canonical
//! total order: set enumeration, `CHOOSE`, and the binary codec all iterate
//! in it, which is what makes serialization deterministic across nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::TypeError;

/// Result alias for operator applications.
pub type Result<T> = std::result::Result<T, TypeError>;

/// An immutable TLA+ value.
///
/// | Variant | TLA+ counterpart |
/// |---|---|
/// | `Bool` | `BOOLEAN` |
/// | `Number` | `Int` (signed 64-bit; overflow is an error, never a wrap) |
/// | `String` | `STRING` |
/// | `Set` | finite set |
/// | `Tuple` | sequence / tuple |
/// | `Function` | finite function; records are functions over string keys |
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Number(i64),
    /// An immutable string.
    String(Arc<str>),
    /// A finite set, canonically ordered, without duplicates.
    Set(Arc<BTreeSet<Value>>),
    /// An ordered finite sequence.
    Tuple(Arc<Vec<Value>>),
    /// A finite map, totally defined over its keys.
    Function(Arc<BTreeMap<Value, Value>>),
}

impl Value {
    /// Construct a boolean value.
    #[must_use]
    pub fn bool(b: bool) -> Self {
        Self::Bool(b)
    }

    /// Construct a number value.
    #[must_use]
    pub fn number(n: i64) -> Self {
        Self::Number(n)
    }

    /// Construct a string value.
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::String(s.into())
    }

    /// Construct a set from any iterator of values. Duplicates collapse.
    #[must_use]
    pub fn set(elems: impl IntoIterator<Item = Value>) -> Self {
        Self::Set(Arc::new(elems.into_iter().collect()))
    }

    /// Construct a tuple (sequence) from an iterator of values.
    #[must_use]
    pub fn tuple(elems: impl IntoIterator<Item = Value>) -> Self {
        Self::Tuple(Arc::new(elems.into_iter().collect()))
    }

    /// Construct a function from key/value pairs. Later pairs win on
    /// duplicate keys.
    #[must_use]
    pub fn function(pairs: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Self::Function(Arc::new(pairs.into_iter().collect()))
    }

    /// Record sugar: a function over string keys.
    #[must_use]
    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self::Function(Arc::new(
            fields
                .into_iter()
                .map(|(k, v)| (Value::string(k), v))
                .collect(),
        ))
    }

    /// The single-pair function `key :> value`.
    #[must_use]
    pub fn singleton(key: Value, value: Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key, value);
        Self::Function(Arc::new(map))
    }

    /// Name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "Bool",
            Self::Number(_) => "Number",
            Self::String(_) => "String",
            Self::Set(_) => "Set",
            Self::Tuple(_) => "Tuple",
            Self::Function(_) => "Function",
        }
    }

    // ------------------------------------------------------------------
    // Checked accessors
    // ------------------------------------------------------------------

    /// The boolean payload, or a type error.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(TypeError::mismatch("as_bool", "Bool", other.kind())),
        }
    }

    /// The numeric payload, or a type error.
    pub fn as_number(&self) -> Result<i64> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(TypeError::mismatch("as_number", "Number", other.kind())),
        }
    }

    /// The string payload, or a type error.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(TypeError::mismatch("as_str", "String", other.kind())),
        }
    }

    /// The set payload, or a type error.
    pub fn as_set(&self) -> Result<&BTreeSet<Value>> {
        match self {
            Self::Set(s) => Ok(s),
            other => Err(TypeError::mismatch("as_set", "Set", other.kind())),
        }
    }

    /// The tuple payload, or a type error.
    pub fn as_tuple(&self) -> Result<&[Value]> {
        match self {
            Self::Tuple(t) => Ok(t),
            other => Err(TypeError::mismatch("as_tuple", "Tuple", other.kind())),
        }
    }

    /// The function payload, or a type error.
    pub fn as_function(&self) -> Result<&BTreeMap<Value, Value>> {
        match self {
            Self::Function(f) => Ok(f),
            other => Err(TypeError::mismatch("as_function", "Function", other.kind())),
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic (checked; overflow is an error)
    // ------------------------------------------------------------------

    /// `self + rhs`.
    pub fn add(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        a.checked_add(b)
            .map(Value::Number)
            .ok_or(TypeError::Overflow { op: "+" })
    }

    /// `self - rhs`.
    pub fn sub(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        a.checked_sub(b)
            .map(Value::Number)
            .ok_or(TypeError::Overflow { op: "-" })
    }

    /// `self * rhs`.
    pub fn mul(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        a.checked_mul(b)
            .map(Value::Number)
            .ok_or(TypeError::Overflow { op: "*" })
    }

    /// Mathematical (floored) division, `self \div rhs`.
    pub fn floor_div(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        if b == 0 {
            return Err(TypeError::DivisionByZero);
        }
        let q = a.checked_div(b).ok_or(TypeError::Overflow { op: "\\div" })?;
        let r = a % b;
        let q = if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q };
        Ok(Value::Number(q))
    }

    /// Mathematical (floored) modulo, `self % rhs`. The result carries the
    /// sign of the divisor, so `a = b * (a \div b) + (a % b)` always holds.
    pub fn floor_mod(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        if b == 0 {
            return Err(TypeError::DivisionByZero);
        }
        if a == i64::MIN && b == -1 {
            return Ok(Value::Number(0));
        }
        let r = a % b;
        let r = if r != 0 && (r < 0) != (b < 0) { r + b } else { r };
        Ok(Value::Number(r))
    }

    /// `self ^ rhs` with a non-negative exponent.
    pub fn pow(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_number()?, rhs.as_number()?);
        if b < 0 {
            return Err(TypeError::NegativeExponent { exponent: b });
        }
        let exp = u32::try_from(b).map_err(|_| TypeError::Overflow { op: "^" })?;
        a.checked_pow(exp)
            .map(Value::Number)
            .ok_or(TypeError::Overflow { op: "^" })
    }

    /// Unary negation.
    pub fn neg(&self) -> Result<Value> {
        self.as_number()?
            .checked_neg()
            .map(Value::Number)
            .ok_or(TypeError::Overflow { op: "unary -" })
    }

    /// `self < rhs` on numbers.
    pub fn lt(&self, rhs: &Value) -> Result<Value> {
        Ok(Value::Bool(self.as_number()? < rhs.as_number()?))
    }

    /// `self <= rhs` on numbers.
    pub fn le(&self, rhs: &Value) -> Result<Value> {
        Ok(Value::Bool(self.as_number()? <= rhs.as_number()?))
    }

    /// `self > rhs` on numbers.
    pub fn gt(&self, rhs: &Value) -> Result<Value> {
        Ok(Value::Bool(self.as_number()? > rhs.as_number()?))
    }

    /// `self >= rhs` on numbers.
    pub fn ge(&self, rhs: &Value) -> Result<Value> {
        Ok(Value::Bool(self.as_number()? >= rhs.as_number()?))
    }

    // ------------------------------------------------------------------
    // Set operations
    // ------------------------------------------------------------------

    /// `elem \in self`.
    pub fn contains(&self, elem: &Value) -> Result<bool> {
        Ok(self.as_set()?.contains(elem))
    }

    /// `self \cup rhs`.
    pub fn union(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_set()?, rhs.as_set()?);
        Ok(Value::Set(Arc::new(a.union(b).cloned().collect())))
    }

    /// `self \cap rhs`.
    pub fn intersect(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_set()?, rhs.as_set()?);
        Ok(Value::Set(Arc::new(a.intersection(b).cloned().collect())))
    }

    /// `self \ rhs`.
    pub fn difference(&self, rhs: &Value) -> Result<Value> {
        let (a, b) = (self.as_set()?, rhs.as_set()?);
        Ok(Value::Set(Arc::new(a.difference(b).cloned().collect())))
    }

    /// `self \subseteq rhs`.
    pub fn is_subset_of(&self, rhs: &Value) -> Result<bool> {
        let (a, b) = (self.as_set()?, rhs.as_set()?);
        Ok(a.is_subset(b))
    }

    /// `SUBSET self`: the set of all subsets.
    pub fn powerset(&self) -> Result<Value> {
        let elems: Vec<&Value> = self.as_set()?.iter().collect();
        let mut subsets: Vec<BTreeSet<Value>> = vec![BTreeSet::new()];
        for elem in elems {
            let mut extended: Vec<BTreeSet<Value>> = subsets
                .iter()
                .map(|s| {
                    let mut s = s.clone();
                    s.insert((*elem).clone());
                    s
                })
                .collect();
            subsets.append(&mut extended);
        }
        Ok(Value::Set(Arc::new(
            subsets
                .into_iter()
                .map(|s| Value::Set(Arc::new(s)))
                .collect(),
        )))
    }

    /// `UNION self`: flattens a set of sets.
    pub fn flatten_union(&self) -> Result<Value> {
        let mut out = BTreeSet::new();
        for inner in self.as_set()? {
            out.extend(inner.as_set()?.iter().cloned());
        }
        Ok(Value::Set(Arc::new(out)))
    }

    /// `Cardinality(self)`.
    pub fn cardinality(&self) -> Result<Value> {
        let len = self.as_set()?.len();
        let len = i64::try_from(len).map_err(|_| TypeError::Overflow {
            op: "Cardinality",
        })?;
        Ok(Value::Number(len))
    }

    /// Enumerate a set's elements in the canonical total order.
    pub fn elements(&self) -> Result<impl Iterator<Item = &Value>> {
        Ok(self.as_set()?.iter())
    }

    /// `CHOOSE x \in self : pred(x)`, deterministically the least such
    /// element in the total order.
    pub fn choose(&self, mut pred: impl FnMut(&Value) -> bool) -> Result<Value> {
        self.as_set()?
            .iter()
            .find(|v| pred(v))
            .cloned()
            .ok_or(TypeError::EmptyChoose)
    }

    // ------------------------------------------------------------------
    // Tuple operations (1-based, like the modeling language)
    // ------------------------------------------------------------------

    /// `Len(self)`.
    pub fn len(&self) -> Result<Value> {
        let len = self.as_tuple()?.len();
        let len = i64::try_from(len).map_err(|_| TypeError::Overflow { op: "Len" })?;
        Ok(Value::Number(len))
    }

    /// `Head(self)`.
    pub fn head(&self) -> Result<Value> {
        self.as_tuple()?
            .first()
            .cloned()
            .ok_or(TypeError::EmptySequence { op: "Head" })
    }

    /// `Tail(self)`.
    pub fn tail(&self) -> Result<Value> {
        let elems = self.as_tuple()?;
        if elems.is_empty() {
            return Err(TypeError::EmptySequence { op: "Tail" });
        }
        Ok(Value::tuple(elems[1..].iter().cloned()))
    }

    /// `Append(self, elem)`.
    pub fn append(&self, elem: Value) -> Result<Value> {
        let mut elems = self.as_tuple()?.to_vec();
        elems.push(elem);
        Ok(Value::Tuple(Arc::new(elems)))
    }

    /// `self \o rhs` (sequence concatenation).
    pub fn concat(&self, rhs: &Value) -> Result<Value> {
        let mut elems = self.as_tuple()?.to_vec();
        elems.extend(rhs.as_tuple()?.iter().cloned());
        Ok(Value::Tuple(Arc::new(elems)))
    }

    /// `SubSeq(self, from, to)`, 1-based and inclusive. `from == to + 1`
    /// yields the empty sequence.
    pub fn sub_seq(&self, from: &Value, to: &Value) -> Result<Value> {
        let elems = self.as_tuple()?;
        let (m, n) = (from.as_number()?, to.as_number()?);
        if m > n {
            return Ok(Value::tuple(std::iter::empty()));
        }
        let len = elems.len();
        if m < 1 || usize::try_from(n).map_or(true, |n| n > len) {
            return Err(TypeError::IndexOutOfRange { index: n, len });
        }
        #[allow(clippy::cast_sign_loss)] // checked: 1 <= m <= n above
        let (start, end) = (m as usize - 1, n as usize);
        Ok(Value::tuple(elems[start..end].iter().cloned()))
    }

    /// `self[index]`, 1-based. Out of range is an error.
    pub fn index(&self, index: &Value) -> Result<Value> {
        let elems = self.as_tuple()?;
        let i = index.as_number()?;
        if i < 1 {
            return Err(TypeError::IndexOutOfRange {
                index: i,
                len: elems.len(),
            });
        }
        #[allow(clippy::cast_sign_loss)] // checked: i >= 1 above
        let position = i as usize - 1;
        elems
            .get(position)
            .cloned()
            .ok_or(TypeError::IndexOutOfRange {
                index: i,
                len: elems.len(),
            })
    }

    // ------------------------------------------------------------------
    // Function operations
    // ------------------------------------------------------------------

    /// `DOMAIN self`.
    pub fn domain(&self) -> Result<Value> {
        Ok(Value::Set(Arc::new(
            self.as_function()?.keys().cloned().collect(),
        )))
    }

    /// Pointwise application, `self[key]`. An absent key is an error.
    pub fn apply(&self, key: &Value) -> Result<Value> {
        self.as_function()?
            .get(key)
            .cloned()
            .ok_or_else(|| TypeError::OutOfDomain {
                key: key.to_string(),
            })
    }

    /// `[self EXCEPT ![key] = value]`: a copy updated at one key. The key
    /// need not already be in the domain.
    pub fn update(&self, key: Value, value: Value) -> Result<Value> {
        let mut map = self.as_function()?.clone();
        map.insert(key, value);
        Ok(Value::Function(Arc::new(map)))
    }

    /// `self @@ rhs`: function merge, left wins on overlapping keys.
    pub fn merge(&self, rhs: &Value) -> Result<Value> {
        let mut map = rhs.as_function()?.clone();
        for (k, v) in self.as_function()? {
            map.insert(k.clone(), v.clone());
        }
        Ok(Value::Function(Arc::new(map)))
    }

    /// Record field access: function application with the field name.
    pub fn dot(&self, field: &str) -> Result<Value> {
        self.apply(&Value::string(field))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "TRUE"),
            Self::Bool(false) => write!(f, "FALSE"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Set(elems) => {
                write!(f, "{{")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "}}")
            },
            Self::Tuple(elems) => {
                write!(f, "<<")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ">>")
            },
            Self::Function(map) => {
                if map.is_empty() {
                    return write!(f, "[ |-> ]");
                }
                write!(f, "[")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} |-> {v}")?;
                }
                write!(f, "]")
            },
        }
    }
}
