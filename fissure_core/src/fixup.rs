//! Values computed for an element at generation time.
//!
//! A [`Fixup`] replaces an element's default value with one derived from the
//! iteration's history. Fixups hold no state of their own: everything they
//! remember lives in the [`FixupStore`] the engine creates for each
//! iteration, so replaying an iteration yields the same bytes.

use crate::element::{DataElement, Shape};
use crate::variant::Variant;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fixup '{fixup}' on '{path}': {reason}")]
pub struct FixupError {
    pub fixup: String,
    pub path: String,
    pub reason: String,
}

/// Values fixups carry from one action to the next within an iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixupStore {
    values: HashMap<String, Variant>,
}

impl FixupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Variant) {
        self.values.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub trait Fixup: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Called before every output action whose data model holds the element.
    fn output_starting(
        &self,
        _element: &DataElement,
        _path: &str,
        _store: &mut FixupStore,
    ) -> Result<(), FixupError> {
        Ok(())
    }

    /// The value the element is generated with. Generation may run several
    /// passes, so this must not change `store`.
    fn value(&self, element: &DataElement, path: &str, store: &FixupStore) -> Result<Variant, FixupError>;
}

/// A shared [`Fixup`] attached to an element. Two handles are equal when
/// their fixups have the same name.
#[derive(Clone)]
pub struct FixupHandle(Arc<dyn Fixup>);

impl FixupHandle {
    pub fn new(fixup: impl Fixup + 'static) -> Self {
        Self(Arc::new(fixup))
    }
}

impl std::ops::Deref for FixupHandle {
    type Target = dyn Fixup;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for FixupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl PartialEq for FixupHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.name() == other.0.name()
    }
}

/// Counts the output actions of an iteration: the first sends the default
/// value plus one, the next plus two, and so on. The count starts over with
/// every iteration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceIncrement;

impl SequenceIncrement {
    const NAME: &'static str = "sequence-increment";

    fn key(path: &str) -> String {
        format!("{}.{path}", Self::NAME)
    }

    fn error(path: &str, reason: impl Into<String>) -> FixupError {
        FixupError {
            fixup: Self::NAME.to_string(),
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl Fixup for SequenceIncrement {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn output_starting(
        &self,
        element: &DataElement,
        path: &str,
        store: &mut FixupStore,
    ) -> Result<(), FixupError> {
        let current = self.value(element, path, store)?;
        let next = match (element.shape(), &current) {
            (Shape::Number { signed: true, .. }, value) => value
                .as_i64()
                .map(|v| Variant::Int(v.wrapping_add(1)))
                .map_err(|e| Self::error(path, e.to_string()))?,
            (Shape::Number { .. }, value) => value
                .as_u64()
                .map(|v| Variant::UInt(v.wrapping_add(1)))
                .map_err(|e| Self::error(path, e.to_string()))?,
            (Shape::String { .. }, Variant::Str(text)) => {
                let number: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| Self::error(path, format!("'{text}' is not a numeric string")))?;
                Variant::Str(number.wrapping_add(1).to_string())
            }
            (_, other) => {
                return Err(Self::error(
                    path,
                    format!("needs a number or numeric string, found {}", other.kind_name()),
                ));
            }
        };
        store.insert(Self::key(path), next);
        Ok(())
    }

    fn value(&self, element: &DataElement, path: &str, store: &FixupStore) -> Result<Variant, FixupError> {
        Ok(store
            .get(&Self::key(path))
            .cloned()
            .unwrap_or_else(|| element.default_value().clone()))
    }
}
