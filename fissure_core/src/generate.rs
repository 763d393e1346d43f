//! Serialization of a [`DataModel`] back to bytes.
//!
//! Elements referenced by a relation are computed rather than copied: the
//! field holding a size receives the generated size of the relation's owner,
//! a count field receives the owner array's occurrence count and an offset
//! field receives the owner's byte offset in the output. Offsets depend on the
//! layout they describe, so generation runs in passes until they settle.
//! An element with a fixup takes the fixup's value over both.

use crate::bitstream::BitWriter;
use crate::element::{DataElement, Endian, Shape};
use crate::fixup::{FixupError, FixupStore};
use crate::model::DataModel;
use crate::relation::{Relation, SizeUnit, child_path};
use crate::variant::{Variant, VariantError};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::trace;

const MAX_OFFSET_PASSES: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("relation on '{owner}' references unknown element '{reference}'")]
    UnresolvedRelation { owner: String, reference: String },
    #[error("value of '{path}' cannot be encoded: {source}")]
    Value {
        path: String,
        #[source]
        source: VariantError,
    },
    #[error("offset fields did not settle after {0} passes")]
    OffsetsUnstable(usize),
    #[error(transparent)]
    Fixup(#[from] FixupError),
}

#[derive(Debug, Clone)]
enum Computed {
    SizeOf { owner: String, unit: SizeUnit },
    CountOf { owner: String },
    OffsetOf { owner: String },
}

pub(crate) fn generate(model: &DataModel, fixups: &FixupStore) -> Result<Vec<u8>, GenerateError> {
    let computed = computed_fields(model)?;
    let offset_owners: Vec<String> = computed
        .values()
        .filter_map(|c| match c {
            Computed::OffsetOf { owner } => Some(owner.clone()),
            _ => None,
        })
        .collect();

    let mut generator = Generator {
        model,
        fixups,
        computed,
        measuring: HashSet::new(),
        offsets: HashMap::new(),
        positions: HashMap::new(),
    };

    for pass in 0..MAX_OFFSET_PASSES {
        generator.positions.clear();
        let mut out = BitWriter::new();
        generator.emit(model.root(), model.name(), &mut out)?;

        let settled: HashMap<String, u64> = offset_owners
            .iter()
            .map(|owner| {
                let bits = generator.positions.get(owner).copied().unwrap_or(0);
                (owner.clone(), bits / 8)
            })
            .collect();
        if settled == generator.offsets {
            trace!(pass, bits = out.len(), "generated {}", model.name());
            return Ok(out.into_bytes());
        }
        generator.offsets = settled;
    }
    Err(GenerateError::OffsetsUnstable(MAX_OFFSET_PASSES))
}

/// Maps every relation-referenced element path to the value it must carry.
fn computed_fields(model: &DataModel) -> Result<HashMap<String, Computed>, GenerateError> {
    let mut owners: Vec<(String, Relation)> = Vec::new();
    model.walk(&mut |path, element| {
        for relation in element.relations() {
            owners.push((path.to_string(), relation.clone()));
        }
    });

    let mut computed = HashMap::new();
    for (owner, relation) in owners {
        let target = model.resolve(&owner, relation.from()).ok_or_else(|| {
            GenerateError::UnresolvedRelation {
                owner: owner.clone(),
                reference: relation.from().to_string(),
            }
        })?;
        let field = match relation {
            Relation::Size { unit, .. } => Computed::SizeOf { owner, unit },
            Relation::Count { .. } => Computed::CountOf { owner },
            Relation::Offset { .. } => Computed::OffsetOf { owner },
            Relation::When { .. } => continue,
        };
        computed.entry(target).or_insert(field);
    }
    Ok(computed)
}

struct Generator<'a> {
    model: &'a DataModel,
    fixups: &'a FixupStore,
    computed: HashMap<String, Computed>,
    /// Owners whose size is being measured. A size field met while its owner
    /// is measured emits a zero of the same width.
    measuring: HashSet<String>,
    offsets: HashMap<String, u64>,
    positions: HashMap<String, u64>,
}

impl<'a> Generator<'a> {
    fn emit(
        &mut self,
        element: &DataElement,
        path: &str,
        out: &mut BitWriter,
    ) -> Result<(), GenerateError> {
        if !self.condition_holds(element, path)? {
            return Ok(());
        }
        if self.measuring.is_empty() {
            self.positions.insert(path.to_string(), out.len());
        }

        if element.is_container() {
            if let Some(raw) = element.mutated_value() {
                return write_raw(raw, path, out);
            }
            return match element.shape() {
                Shape::Choice { .. } => match element.active_branch() {
                    Some(branch) => self.emit(branch, &child_path(path, branch.name()), out),
                    None => Ok(()),
                },
                _ => {
                    for child in element.children() {
                        self.emit(child, &child_path(path, child.name()), out)?;
                    }
                    Ok(())
                }
            };
        }

        if element.mutated_value().is_none() {
            if let Some(fixup) = element.fixup() {
                let value = fixup.value(element, path, self.fixups)?;
                return encode_leaf(element, &value, path, true, out);
            }
        }
        match element.mutated_value() {
            Some(value) => encode_leaf(element, value, path, false, out),
            None => match self.computed.get(path).cloned() {
                Some(computed) => {
                    let value = self.compute(&computed)?;
                    encode_leaf(element, &Variant::UInt(value), path, true, out)
                }
                None => encode_leaf(element, element.default_value(), path, true, out),
            },
        }
    }

    fn condition_holds(&self, element: &DataElement, path: &str) -> Result<bool, GenerateError> {
        for relation in element.relations() {
            if let Relation::When { from, equals } = relation {
                let target = self.model.resolve(path, from).ok_or_else(|| {
                    GenerateError::UnresolvedRelation {
                        owner: path.to_string(),
                        reference: from.clone(),
                    }
                })?;
                let holds = self
                    .model
                    .find(&target)
                    .is_some_and(|e| e.value().loosely_equals(equals));
                if !holds {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn compute(&mut self, computed: &Computed) -> Result<u64, GenerateError> {
        match computed {
            Computed::SizeOf { owner, unit } => {
                if self.measuring.contains(owner) {
                    return Ok(0);
                }
                let element = self.lookup(owner)?;
                self.measuring.insert(owner.clone());
                let mut scratch = BitWriter::new();
                let result = self.emit(element, owner, &mut scratch);
                self.measuring.remove(owner);
                result?;
                Ok(unit.from_bits(scratch.len()))
            }
            Computed::CountOf { owner } => Ok(self.lookup(owner)?.children().len() as u64),
            Computed::OffsetOf { owner } => Ok(self.offsets.get(owner).copied().unwrap_or(0)),
        }
    }

    fn lookup(&self, path: &str) -> Result<&'a DataElement, GenerateError> {
        self.model
            .find(path)
            .ok_or_else(|| GenerateError::UnresolvedRelation {
                owner: path.to_string(),
                reference: path.to_string(),
            })
    }
}

fn write_raw(value: &Variant, path: &str, out: &mut BitWriter) -> Result<(), GenerateError> {
    match value {
        Variant::Bits { data, len } => out.write_bit_buffer(data, *len),
        other => {
            let bytes = other.to_bytes().map_err(|source| GenerateError::Value {
                path: path.to_string(),
                source,
            })?;
            out.write_bytes(&bytes);
        }
    }
    Ok(())
}

/// Encodes a leaf value. Fixed length strings and blobs are padded or
/// truncated to their length unless the value is a mutation, which is
/// written as is.
fn encode_leaf(
    element: &DataElement,
    value: &Variant,
    path: &str,
    fit_to_length: bool,
    out: &mut BitWriter,
) -> Result<(), GenerateError> {
    match element.shape() {
        Shape::Number { bits, endian, .. } => match value.as_u64() {
            Ok(number) => {
                write_number(number, *bits, *endian, out);
                Ok(())
            }
            Err(_) if !fit_to_length => write_raw(value, path, out),
            Err(source) => Err(GenerateError::Value {
                path: path.to_string(),
                source,
            }),
        },
        Shape::Flag { bits } => match value.as_u64() {
            Ok(number) => {
                out.write_bits(number & mask(*bits), *bits);
                Ok(())
            }
            Err(_) if !fit_to_length => write_raw(value, path, out),
            Err(source) => Err(GenerateError::Value {
                path: path.to_string(),
                source,
            }),
        },
        _ => {
            let value = match value {
                Variant::Int(_) | Variant::UInt(_) | Variant::Bool(_) => {
                    Variant::Str(value.to_string())
                }
                other => other.clone(),
            };
            match (fit_to_length, element.length_bits()) {
                (true, Some(length)) => {
                    let mut bytes = value.to_bytes().map_err(|source| GenerateError::Value {
                        path: path.to_string(),
                        source,
                    })?;
                    bytes.resize(length.div_ceil(8) as usize, 0);
                    out.write_bit_buffer(&bytes, length);
                    Ok(())
                }
                _ => write_raw(&value, path, out),
            }
        }
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

fn write_number(value: u64, bits: u32, endian: Endian, out: &mut BitWriter) {
    let value = value & mask(bits);
    match endian {
        Endian::Big => out.write_bits(value, bits),
        Endian::Little => {
            for i in 0..bits / 8 {
                out.write_bits((value >> (8 * i)) & 0xFF, 8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_respect_width_and_endianness() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("le", 16).with_default(0x0102u64),
                DataElement::number("be", 32).big_endian().with_default(0x0A0B0C0Du64),
                DataElement::number("neg", 8).signed().with_default(-1i64),
            ],
        ))
        .unwrap();
        assert_eq!(
            model.generate().unwrap(),
            vec![0x02, 0x01, 0x0A, 0x0B, 0x0C, 0x0D, 0xFF]
        );
    }

    #[test]
    fn size_field_gets_length_of_owner() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("len", 8).with_default(99u64),
                DataElement::blob("payload")
                    .with_default(b"abcde".to_vec())
                    .with_relation(Relation::size("len")),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), b"\x05abcde".to_vec());
    }

    #[test]
    fn size_of_enclosing_block_counts_itself() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::block(
                    "record",
                    vec![
                        DataElement::number("len", 16).big_endian(),
                        DataElement::string("text").with_default("hey"),
                    ],
                )
                .with_relation(Relation::size("record.len")),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), b"\x00\x05hey".to_vec());
    }

    #[test]
    fn count_field_gets_occurrences() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("n", 8),
                DataElement::array(
                    "items",
                    DataElement::number("item", 8).with_default(7u64),
                    0,
                    None,
                )
                .with_occurs(3)
                .with_relation(Relation::count("n")),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), vec![3, 7, 7, 7]);
    }

    #[test]
    fn offset_field_settles_on_position() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("where", 8),
                DataElement::blob("pad").with_default(vec![0xEE; 3]),
                DataElement::blob("target")
                    .with_default(vec![0xAA])
                    .with_relation(Relation::offset("where")),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), vec![4, 0xEE, 0xEE, 0xEE, 0xAA]);
    }

    #[test]
    fn false_condition_omits_element() {
        let mut model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("kind", 8).with_default(1u64),
                DataElement::blob("extra")
                    .with_default(vec![0xFF])
                    .with_relation(Relation::when("kind", 2u64)),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), vec![1]);
        model.find_mut("root.kind").unwrap().set_default(Variant::UInt(2));
        assert_eq!(model.generate().unwrap(), vec![2, 0xFF]);
    }

    #[test]
    fn mutated_values_take_precedence() {
        let mut model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("len", 8),
                DataElement::string("s")
                    .with_default("ab")
                    .with_relation(Relation::size("len")),
            ],
        ))
        .unwrap();
        model.find_mut("root.len").unwrap().set_mutated(Variant::UInt(0x1FF));
        model
            .find_mut("root.s")
            .unwrap()
            .set_mutated(Variant::Str("xyz".into()));
        assert_eq!(model.generate().unwrap(), b"\xFFxyz".to_vec());

        model.clear_mutations();
        model
            .root_mut()
            .set_mutated(Variant::Bytes(vec![1, 2, 3]));
        assert_eq!(model.generate().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn fixed_length_default_is_padded() {
        let model = DataModel::new(DataElement::string("s").with_default("ab").with_length_bytes(4))
            .unwrap();
        assert_eq!(model.generate().unwrap(), b"ab\0\0".to_vec());
    }

    #[test]
    fn flags_pack_bits() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::flag("hi", 3).with_default(0b101u64),
                DataElement::flag("lo", 5).with_default(0b00011u64),
            ],
        ))
        .unwrap();
        assert_eq!(model.generate().unwrap(), vec![0b1010_0011]);
    }

    #[test]
    fn fixup_value_replaces_default_but_not_mutation() {
        use crate::fixup::SequenceIncrement;

        let mut model = DataModel::new(DataElement::block(
            "root",
            vec![
                DataElement::number("seq", 8).with_default(7u64).with_fixup(SequenceIncrement),
                DataElement::string("word").with_default("x"),
            ],
        ))
        .unwrap();
        let mut fixups = FixupStore::new();
        assert_eq!(model.generate_with(&fixups).unwrap(), vec![7, b'x']);
        model.output_starting(&mut fixups).unwrap();
        assert_eq!(model.generate_with(&fixups).unwrap(), vec![8, b'x']);
        model.output_starting(&mut fixups).unwrap();
        assert_eq!(model.generate_with(&fixups).unwrap(), vec![9, b'x']);

        model.find_mut("root.seq").unwrap().set_mutated(Variant::UInt(0xAA));
        assert_eq!(model.generate_with(&fixups).unwrap(), vec![0xAA, b'x']);
    }

    #[test]
    fn fixup_failure_is_reported() {
        use crate::fixup::SequenceIncrement;

        let model = DataModel::new(DataElement::block(
            "root",
            vec![DataElement::blob("b").with_fixup(SequenceIncrement)],
        ))
        .unwrap();
        let err = model.output_starting(&mut FixupStore::new()).unwrap_err();
        assert_eq!(err.path, "root.b");
    }

    #[test]
    fn unresolved_relation_is_reported() {
        let model = DataModel::new(DataElement::block(
            "root",
            vec![DataElement::blob("b").with_relation(Relation::size("nope"))],
        ))
        .unwrap();
        assert!(matches!(
            model.generate(),
            Err(GenerateError::UnresolvedRelation { .. })
        ));
    }
}
