use crate::element::{DataElement, ElementKind, Shape};
use crate::variant::Variant;
use rand::Rng;
use rand_core::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How far `NumericVariance` strays from a number's default, in each direction.
pub const NUMERIC_VARIANCE_RANGE: i64 = 10;
/// Number of candidates `BlobRandom` enumerates per element.
const BLOB_RANDOM_CANDIDATES: u64 = 100;
/// Upper bound on the bits `BlobBitFlip` walks through.
const BLOB_BIT_FLIP_MAX_BITS: u64 = 4096;
/// Upper bound on the length of a `RandomBytes` value.
const RANDOM_BYTES_MAX_LEN: usize = 1024;
/// Lengths `StringLength` stretches or shrinks a string to.
const STRING_LENGTHS: [usize; 10] = [0, 1, 2, 127, 128, 255, 256, 1024, 4096, 65536];

/// Errors raised while creating or applying mutators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutatorError {
    /// The element's kind is not one the mutator works on.
    #[error("mutator '{mutator}' does not support {kind} element '{element}'")]
    Unsupported {
        mutator: String,
        kind: ElementKind,
        element: String,
    },
    /// A candidate index at or past the mutator's count was requested.
    #[error("mutator '{mutator}' has {count} candidates, index {index} is out of range")]
    OutOfRange {
        mutator: String,
        index: u64,
        count: u64,
    },
    /// A configuration filter named a mutator nobody registered.
    #[error("unknown mutator '{0}'")]
    Unknown(String),
}

/// A `Mutator` produces replacement values for one data element.
///
/// A mutator is created per element, so its candidate list may depend on that
/// element's width or default value. Candidates are enumerated by index: the
/// mutation strategy positions the mutator with [`Mutator::seek`] and then
/// calls [`Mutator::apply`], which writes the current candidate into the
/// element's mutated-value slot. Because the position is all that selects a
/// candidate, any iteration of a run can be reproduced without replaying the
/// ones before it.
pub trait Mutator: Send {
    /// The registry name of this mutator.
    fn name(&self) -> &str;

    /// Number of candidates, or `None` when the mutator never runs out.
    fn count(&self) -> Option<u64>;

    /// Index of the current candidate.
    fn position(&self) -> u64;

    /// Moves to candidate `index`.
    ///
    /// # Errors
    /// Returns [`MutatorError::OutOfRange`] when `index` is not below
    /// [`Mutator::count`].
    fn seek(&mut self, index: u64) -> Result<(), MutatorError>;

    /// Moves to the next candidate. Returns `false` once the candidates are
    /// exhausted, leaving the position unchanged.
    fn advance(&mut self) -> bool {
        let next = self.position() + 1;
        if self.count().is_some_and(|count| next >= count) {
            return false;
        }
        self.seek(next).is_ok()
    }

    /// Writes the current candidate into `element`.
    ///
    /// `rng` is only consulted by mutators whose candidates are random; it is
    /// seeded per iteration so the value is still reproducible.
    fn apply(&self, element: &mut DataElement, rng: &mut dyn RngCore) -> Result<(), MutatorError>;
}

fn check_seek(name: &str, index: u64, count: u64) -> Result<(), MutatorError> {
    if index >= count {
        return Err(MutatorError::OutOfRange {
            mutator: name.to_string(),
            index,
            count,
        });
    }
    Ok(())
}

/// A mutator over a precomputed list of values.
///
/// Used for the numeric, string case and configured fixed-value mutators.
#[derive(Debug, Clone)]
pub struct ValueListMutator {
    name: String,
    values: Vec<Variant>,
    position: u64,
}

impl ValueListMutator {
    pub fn new(name: impl Into<String>, values: Vec<Variant>) -> Self {
        Self {
            name: name.into(),
            values,
            position: 0,
        }
    }

    pub fn values(&self) -> &[Variant] {
        &self.values
    }
}

impl Mutator for ValueListMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> Option<u64> {
        Some(self.values.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), MutatorError> {
        check_seek(&self.name, index, self.values.len() as u64)?;
        self.position = index;
        Ok(())
    }

    fn apply(&self, element: &mut DataElement, _rng: &mut dyn RngCore) -> Result<(), MutatorError> {
        let value = self
            .values
            .get(self.position as usize)
            .cloned()
            .ok_or_else(|| MutatorError::OutOfRange {
                mutator: self.name.clone(),
                index: self.position,
                count: self.values.len() as u64,
            })?;
        element.set_mutated(value);
        Ok(())
    }
}

/// Stretches or shrinks a string to a set of boundary lengths.
///
/// The longest candidates are large, so values are built on `apply` rather
/// than stored.
#[derive(Debug, Clone)]
pub struct StringLengthMutator {
    base: String,
    position: u64,
}

impl StringLengthMutator {
    pub fn new(element: &DataElement) -> Self {
        let base = match element.default_value() {
            Variant::Str(s) if !s.is_empty() => s.clone(),
            _ => "A".to_string(),
        };
        Self { base, position: 0 }
    }
}

impl Mutator for StringLengthMutator {
    fn name(&self) -> &str {
        "StringLength"
    }

    fn count(&self) -> Option<u64> {
        Some(STRING_LENGTHS.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), MutatorError> {
        check_seek(self.name(), index, STRING_LENGTHS.len() as u64)?;
        self.position = index;
        Ok(())
    }

    fn apply(&self, element: &mut DataElement, _rng: &mut dyn RngCore) -> Result<(), MutatorError> {
        let len = STRING_LENGTHS[self.position as usize];
        let value: String = self.base.chars().cycle().take(len).collect();
        element.set_mutated(Variant::Str(value));
        Ok(())
    }
}

/// Flips one bit of a blob's default value per candidate.
#[derive(Debug, Clone)]
pub struct BlobBitFlipMutator {
    base: Vec<u8>,
    bits: u64,
    position: u64,
}

impl BlobBitFlipMutator {
    pub fn new(element: &DataElement) -> Self {
        let base = element.default_value().to_bytes().unwrap_or_default();
        let bits = element
            .default_value()
            .bit_len()
            .unwrap_or(0)
            .min(BLOB_BIT_FLIP_MAX_BITS);
        Self {
            base,
            bits,
            position: 0,
        }
    }
}

impl Mutator for BlobBitFlipMutator {
    fn name(&self) -> &str {
        "BlobBitFlip"
    }

    fn count(&self) -> Option<u64> {
        Some(self.bits)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), MutatorError> {
        check_seek(self.name(), index, self.bits)?;
        self.position = index;
        Ok(())
    }

    fn apply(&self, element: &mut DataElement, _rng: &mut dyn RngCore) -> Result<(), MutatorError> {
        check_seek(self.name(), self.position, self.bits)?;
        let mut data = self.base.clone();
        let byte = (self.position / 8) as usize;
        data[byte] ^= 0x80 >> (self.position % 8);
        let value = match element.default_value() {
            Variant::Bits { len, .. } => Variant::Bits { data, len: *len },
            _ => Variant::Bytes(data),
        };
        element.set_mutated(value);
        Ok(())
    }
}

/// Replaces a value with random bytes.
///
/// With a limit it enumerates that many candidates (each one different
/// because the per-iteration RNG differs); without one it is unbounded.
#[derive(Debug, Clone)]
pub struct RandomBytesMutator {
    name: &'static str,
    limit: Option<u64>,
    max_len: usize,
    as_text: bool,
    position: u64,
}

impl RandomBytesMutator {
    pub fn bounded(element: &DataElement) -> Self {
        let len = element.default_value().to_bytes().map(|b| b.len()).unwrap_or(0);
        Self {
            name: "BlobRandom",
            limit: Some(BLOB_RANDOM_CANDIDATES),
            max_len: (len * 2).clamp(1, RANDOM_BYTES_MAX_LEN),
            as_text: false,
            position: 0,
        }
    }

    pub fn unbounded(element: &DataElement) -> Self {
        Self {
            name: "RandomBytes",
            limit: None,
            max_len: RANDOM_BYTES_MAX_LEN,
            as_text: element.kind() == ElementKind::String,
            position: 0,
        }
    }
}

impl Mutator for RandomBytesMutator {
    fn name(&self) -> &str {
        self.name
    }

    fn count(&self) -> Option<u64> {
        self.limit
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), MutatorError> {
        if let Some(limit) = self.limit {
            check_seek(self.name, index, limit)?;
        }
        self.position = index;
        Ok(())
    }

    fn apply(&self, element: &mut DataElement, rng: &mut dyn RngCore) -> Result<(), MutatorError> {
        let len = rng.random_range(0..=self.max_len);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        let value = if self.as_text {
            Variant::Str(String::from_utf8_lossy(&data).into_owned())
        } else {
            Variant::Bytes(data)
        };
        element.set_mutated(value);
        Ok(())
    }
}

/// Width and signedness of a numeric element.
fn numeric_shape(element: &DataElement) -> Option<(u32, bool)> {
    match element.shape() {
        Shape::Number { bits, signed, .. } => Some((*bits, *signed)),
        Shape::Flag { bits } => Some((*bits, false)),
        _ => None,
    }
}

fn unsigned_max(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Boundary values for a number of the element's width.
pub fn numeric_edge_cases(element: &DataElement) -> Vec<Variant> {
    let Some((bits, signed)) = numeric_shape(element) else {
        return Vec::new();
    };
    let mut values: Vec<Variant> = Vec::new();
    let mut push = |v: Variant| {
        if !values.contains(&v) {
            values.push(v);
        }
    };
    if signed {
        let max = (unsigned_max(bits) >> 1) as i64;
        let min = -max - 1;
        for v in [0, 1, -1, 2, -2, max, max - 1, min, min + 1] {
            push(Variant::Int(v));
        }
    } else {
        let max = unsigned_max(bits);
        let half = max >> 1;
        for v in [0, 1, 2, half, half + 1, max - 1, max] {
            if v <= max {
                push(Variant::UInt(v));
            }
        }
    }
    values
}

/// Values within [`NUMERIC_VARIANCE_RANGE`] of the element's default.
pub fn numeric_variance(element: &DataElement) -> Vec<Variant> {
    let Some((bits, signed)) = numeric_shape(element) else {
        return Vec::new();
    };
    let mask = unsigned_max(bits);
    let base = element.default_value().as_i64().unwrap_or(0);
    (-NUMERIC_VARIANCE_RANGE..=NUMERIC_VARIANCE_RANGE)
        .filter(|delta| *delta != 0)
        .map(|delta| {
            let v = base.wrapping_add(delta);
            if signed {
                Variant::Int(v)
            } else {
                Variant::UInt(v as u64 & mask)
            }
        })
        .collect()
}

/// Upper case, lower case and swapped case forms of a string default.
pub fn string_cases(element: &DataElement) -> Vec<Variant> {
    let base = match element.default_value() {
        Variant::Str(s) => s.clone(),
        other => other.to_string(),
    };
    let swapped: String = base
        .chars()
        .map(|c| {
            if c.is_uppercase() {
                c.to_lowercase().collect::<String>()
            } else {
                c.to_uppercase().collect::<String>()
            }
        })
        .collect();
    vec![
        Variant::Str(base.to_uppercase()),
        Variant::Str(base.to_lowercase()),
        Variant::Str(swapped),
    ]
}

type SupportsFn = Arc<dyn Fn(&DataElement) -> bool + Send + Sync>;
type CreateFn = Arc<dyn Fn(&DataElement) -> Box<dyn Mutator> + Send + Sync>;

/// A named way of building a mutator, plus the predicate deciding which
/// elements it applies to.
#[derive(Clone)]
pub struct MutatorFactory {
    name: String,
    supports: SupportsFn,
    create: CreateFn,
}

impl MutatorFactory {
    pub fn new(
        name: impl Into<String>,
        supports: impl Fn(&DataElement) -> bool + Send + Sync + 'static,
        create: impl Fn(&DataElement) -> Box<dyn Mutator> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            supports: Arc::new(supports),
            create: Arc::new(create),
        }
    }

    /// A factory whose mutators cycle through `values` on elements of `kinds`.
    pub fn fixed_values(name: impl Into<String>, kinds: Vec<ElementKind>, values: Vec<Variant>) -> Self {
        let name = name.into();
        let mutator_name = name.clone();
        Self::new(
            name,
            move |element| kinds.contains(&element.kind()),
            move |_| Box::new(ValueListMutator::new(mutator_name.clone(), values.clone())),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports(&self, element: &DataElement) -> bool {
        (self.supports)(element)
    }

    pub fn create(&self, element: &DataElement) -> Box<dyn Mutator> {
        (self.create)(element)
    }
}

impl fmt::Debug for MutatorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorFactory").field("name", &self.name).finish()
    }
}

fn is_numeric(element: &DataElement) -> bool {
    matches!(element.kind(), ElementKind::Number | ElementKind::Flag)
}

fn is_string(element: &DataElement) -> bool {
    element.kind() == ElementKind::String
}

fn is_blob(element: &DataElement) -> bool {
    element.kind() == ElementKind::Blob
}

/// The set of mutators a run may use, keyed and ordered by name.
///
/// Ordering by name keeps recording deterministic no matter the order in
/// which factories were registered.
#[derive(Debug, Clone, Default)]
pub struct MutatorRegistry {
    factories: BTreeMap<String, MutatorFactory>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in mutator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MutatorFactory::new("NumericEdgeCase", is_numeric, |e| {
            Box::new(ValueListMutator::new("NumericEdgeCase", numeric_edge_cases(e)))
        }));
        registry.register(MutatorFactory::new("NumericVariance", is_numeric, |e| {
            Box::new(ValueListMutator::new("NumericVariance", numeric_variance(e)))
        }));
        registry.register(MutatorFactory::new("StringCase", is_string, |e| {
            Box::new(ValueListMutator::new("StringCase", string_cases(e)))
        }));
        registry.register(MutatorFactory::new("StringLength", is_string, |e| {
            Box::new(StringLengthMutator::new(e))
        }));
        registry.register(MutatorFactory::new("BlobBitFlip", is_blob, |e| {
            Box::new(BlobBitFlipMutator::new(e))
        }));
        registry.register(MutatorFactory::new("BlobRandom", is_blob, |e| {
            Box::new(RandomBytesMutator::bounded(e))
        }));
        registry.register(MutatorFactory::new(
            "RandomBytes",
            |e| is_string(e) || is_blob(e),
            |e| Box::new(RandomBytesMutator::unbounded(e)),
        ));
        registry
    }

    /// Adds a factory, replacing any factory of the same name.
    pub fn register(&mut self, factory: MutatorFactory) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn register_fixed_values(
        &mut self,
        name: impl Into<String>,
        kinds: Vec<ElementKind>,
        values: Vec<Variant>,
    ) {
        self.register(MutatorFactory::fixed_values(name, kinds, values));
    }

    /// Restricts the registry to `include` (all when empty) minus `exclude`.
    ///
    /// # Errors
    /// Returns [`MutatorError::Unknown`] when a listed name is not registered.
    pub fn filter(&mut self, include: &[String], exclude: &[String]) -> Result<(), MutatorError> {
        for name in include.iter().chain(exclude) {
            if !self.factories.contains_key(name) {
                return Err(MutatorError::Unknown(name.clone()));
            }
        }
        self.factories.retain(|name, _| {
            (include.is_empty() || include.contains(name)) && !exclude.contains(name)
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MutatorFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Factories whose predicate accepts `element`, in name order.
    pub fn applicable(&self, element: &DataElement) -> Vec<&MutatorFactory> {
        self.factories
            .values()
            .filter(|factory| factory.supports(element))
            .collect()
    }
}
