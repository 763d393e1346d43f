use crate::element::{DataElement, Shape};
use crate::fixup::{FixupError, FixupStore};
use crate::generate::{self, GenerateError};
use crate::relation::candidate_paths;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("element name '{name}' under '{parent}' is not a valid name")]
    InvalidName { parent: String, name: String },
    #[error("'{parent}' has more than one child named '{name}'")]
    DuplicateName { parent: String, name: String },
    #[error("number '{path}' has unsupported width {bits} (expected 8, 16, 32 or 64)")]
    NumberWidth { path: String, bits: u32 },
    #[error("flag '{path}' has unsupported width {bits} (expected 1..=64)")]
    FlagWidth { path: String, bits: u32 },
    #[error("choice '{0}' has no branches")]
    EmptyChoice(String),
    #[error("array '{path}' has min-occurs {min} above max-occurs {max}")]
    Occurs { path: String, min: usize, max: usize },
}

/// A validated element tree, addressed by dot separated paths that start with
/// the root's name.
#[derive(Debug, Clone, PartialEq)]
pub struct DataModel {
    root: DataElement,
}

impl DataModel {
    pub fn new(root: DataElement) -> Result<Self, ModelError> {
        validate(&root, root.name())?;
        Ok(Self { root })
    }

    pub fn name(&self) -> &str {
        self.root.name()
    }

    pub fn root(&self) -> &DataElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut DataElement {
        &mut self.root
    }

    pub fn find(&self, path: &str) -> Option<&DataElement> {
        if path == self.root.name() {
            return Some(&self.root);
        }
        let relative = path
            .strip_prefix(self.root.name())
            .and_then(|rest| rest.strip_prefix('.'))?;
        self.root.descendant(relative)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut DataElement> {
        if path == self.root.name() {
            return Some(&mut self.root);
        }
        let relative = path
            .strip_prefix(self.root.name())
            .and_then(|rest| rest.strip_prefix('.'))?;
        self.root.descendant_mut(relative)
    }

    /// Resolves a relation reference made by the element at `owner` to the
    /// path of an existing element.
    pub fn resolve(&self, owner: &str, reference: &str) -> Option<String> {
        candidate_paths(owner, reference)
            .into_iter()
            .find(|candidate| self.find(candidate).is_some())
    }

    /// Visits every reachable element with its full path, in declared order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&str, &'a DataElement)) {
        self.root.walk(self.root.name(), visit);
    }

    pub fn clear_mutations(&mut self) {
        self.root.clear_mutations();
    }

    pub fn generate(&self) -> Result<Vec<u8>, GenerateError> {
        generate::generate(self, &FixupStore::default())
    }

    /// Generates with the values fixups have stored so far this iteration.
    pub fn generate_with(&self, fixups: &FixupStore) -> Result<Vec<u8>, GenerateError> {
        generate::generate(self, fixups)
    }

    /// Lets every fixup in the model see that the model is about to be output.
    pub fn output_starting(&self, fixups: &mut FixupStore) -> Result<(), FixupError> {
        let mut result = Ok(());
        self.walk(&mut |path, element| {
            if result.is_err() {
                return;
            }
            if let Some(fixup) = element.fixup() {
                result = fixup.output_starting(element, path, fixups);
            }
        });
        result
    }
}

fn validate(element: &DataElement, path: &str) -> Result<(), ModelError> {
    match element.shape() {
        Shape::Number { bits, .. } if !matches!(bits, 8 | 16 | 32 | 64) => {
            return Err(ModelError::NumberWidth {
                path: path.to_string(),
                bits: *bits,
            });
        }
        Shape::Flag { bits } if !(1..=64).contains(bits) => {
            return Err(ModelError::FlagWidth {
                path: path.to_string(),
                bits: *bits,
            });
        }
        Shape::Choice { .. } if element.children().is_empty() => {
            return Err(ModelError::EmptyChoice(path.to_string()));
        }
        Shape::Array {
            min_occurs,
            max_occurs: Some(max),
            ..
        } if min_occurs > max => {
            return Err(ModelError::Occurs {
                path: path.to_string(),
                min: *min_occurs,
                max: *max,
            });
        }
        Shape::Array { template, .. } => {
            check_name(path, template.name())?;
            validate(template, &format!("{path}.{}", template.name()))?;
        }
        _ => {}
    }

    let mut seen = HashSet::new();
    for child in element.children() {
        check_name(path, child.name())?;
        if !seen.insert(child.name()) {
            return Err(ModelError::DuplicateName {
                parent: path.to_string(),
                name: child.name().to_string(),
            });
        }
        validate(child, &format!("{path}.{}", child.name()))?;
    }
    Ok(())
}

fn check_name(parent: &str, name: &str) -> Result<(), ModelError> {
    if name.is_empty() || name.contains('.') {
        return Err(ModelError::InvalidName {
            parent: parent.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}
