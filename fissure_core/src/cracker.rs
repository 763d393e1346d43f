//! Reconstructs a [`DataModel`] from raw bytes.
//!
//! Cracking is a recursive descent over the element tree. Every crack step
//! returns a `Result`: a [`CrackError::Failure`] is local and recoverable, and
//! is consumed by the nearest enclosing Choice (which rewinds and tries its
//! next branch) or Array (which stops once enough occurrences were read). A
//! [`CrackError::Definition`] means the format itself is wrong and aborts the
//! whole crack.
//!
//! Values of cracked elements are appended to a log keyed by full path.
//! Relations read their values from that log, so a rewind only has to truncate
//! it to forget everything an abandoned branch produced.

use crate::bitstream::BitReader;
use crate::element::{DataElement, Endian, ElementKind, Shape, Span, StringEncoding, occurrence};
use crate::model::DataModel;
use crate::relation::{Relation, RelationKind, SizeUnit, candidate_paths, child_path};
use crate::variant::Variant;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrackError {
    /// The data does not match the element at `path`.
    #[error("cannot crack '{path}' at byte {} (bit {offset_bits}): {reason}", .offset_bits / 8)]
    Failure {
        path: String,
        offset_bits: u64,
        reason: String,
    },
    /// The format description cannot be cracked with any data.
    #[error("format definition error at '{path}': {reason}")]
    Definition { path: String, reason: String },
}

impl CrackError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CrackError::Failure { .. })
    }

    pub fn path(&self) -> &str {
        match self {
            CrackError::Failure { path, .. } | CrackError::Definition { path, .. } => path,
        }
    }

    pub fn byte_offset(&self) -> Option<u64> {
        match self {
            CrackError::Failure { offset_bits, .. } => Some(offset_bits / 8),
            CrackError::Definition { .. } => None,
        }
    }
}

/// Hooks around every element the cracker visits. They observe only and
/// cannot influence the crack.
pub trait CrackObserver {
    fn enter_element(&mut self, _path: &str, _kind: ElementKind, _position_bits: u64) {}

    /// `span` is `None` when the element failed to crack.
    fn exit_element(&mut self, _path: &str, _span: Option<Span>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrackReport {
    pub consumed_bits: u64,
    pub total_bits: u64,
}

impl CrackReport {
    pub fn unread_bytes(&self) -> u64 {
        self.total_bits.saturating_sub(self.consumed_bits) / 8
    }
}

#[derive(Default)]
pub struct Cracker {
    observers: Vec<Box<dyn CrackObserver>>,
}

struct Session<'a> {
    reader: BitReader<'a>,
    log: Vec<(String, Variant)>,
    names: HashSet<String>,
}

impl Session<'_> {
    fn failure(&self, path: &str, reason: impl Into<String>) -> CrackError {
        CrackError::Failure {
            path: path.to_string(),
            offset_bits: self.reader.position(),
            reason: reason.into(),
        }
    }

    fn lookup(&self, owner: &str, reference: &str, kind: RelationKind) -> Result<Variant, CrackError> {
        for candidate in candidate_paths(owner, reference) {
            if let Some((_, value)) = self.log.iter().rev().find(|(path, _)| *path == candidate) {
                return Ok(value.clone());
            }
        }
        let last = reference.rsplit('.').next().unwrap_or(reference);
        let reason = if self.names.contains(last) {
            format!("{kind:?} relation references '{reference}' before it is cracked")
        } else {
            format!("{kind:?} relation references unknown element '{reference}'")
        };
        Err(CrackError::Definition {
            path: owner.to_string(),
            reason,
        })
    }

    fn lookup_u64(&self, owner: &str, reference: &str, kind: RelationKind) -> Result<u64, CrackError> {
        self.lookup(owner, reference, kind)?
            .as_u64()
            .map_err(|e| self.failure(owner, format!("{kind:?} relation value: {e}")))
    }

    fn logged(&self, path: &str) -> Option<&Variant> {
        self.log.iter().rev().find(|(p, _)| p == path).map(|(_, v)| v)
    }
}

impl Cracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Box<dyn CrackObserver>) {
        self.observers.push(observer);
    }

    /// Cracks `data` into `model`, overwriting default values, Choice
    /// selections and Array occurrences. On error the model is left partially
    /// cracked and should be discarded.
    pub fn crack(&mut self, model: &mut DataModel, data: &[u8]) -> Result<CrackReport, CrackError> {
        let mut names = HashSet::new();
        model.root().collect_names(&mut names);
        let mut session = Session {
            reader: BitReader::new(data),
            log: Vec::new(),
            names,
        };
        let root_path = model.name().to_string();
        self.crack_node(&mut session, model.root_mut(), &root_path, 0)?;
        let report = CrackReport {
            consumed_bits: session.reader.position(),
            total_bits: session.reader.total_bits(),
        };
        debug!(
            model = %root_path,
            consumed = report.consumed_bits / 8,
            unread = report.unread_bytes(),
            "cracked model"
        );
        Ok(report)
    }

    fn crack_node(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        trailing_bits: u64,
    ) -> Result<(), CrackError> {
        for observer in &mut self.observers {
            observer.enter_element(path, element.kind(), session.reader.position());
        }
        let result = self.crack_node_inner(session, element, path, trailing_bits);
        let span = result.as_ref().ok().copied();
        for observer in &mut self.observers {
            observer.exit_element(path, span);
        }
        match result {
            Ok(span) => {
                trace!(path, offset = span.offset_bits, bits = span.length_bits, "cracked");
                element.set_span(span);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn crack_node_inner(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        trailing_bits: u64,
    ) -> Result<Span, CrackError> {
        for relation in element.relations() {
            if let Relation::When { from, equals } = relation {
                let value = session.lookup(path, from, RelationKind::When)?;
                if !value.loosely_equals(equals) {
                    return Err(session.failure(
                        path,
                        format!("condition on '{from}' not met ({value} != {equals})"),
                    ));
                }
            }
        }
        if let Some(Relation::Offset { from }) = element.relation(RelationKind::Offset) {
            let offset = session.lookup_u64(path, from, RelationKind::Offset)?;
            if !session.reader.seek(offset.saturating_mul(8)) {
                return Err(session.failure(path, format!("offset {offset} is past the end of data")));
            }
        }

        let start = session.reader.position();
        match element.kind() {
            ElementKind::Block => self.crack_block(session, element, path, trailing_bits)?,
            ElementKind::Choice => self.crack_choice(session, element, path, trailing_bits)?,
            ElementKind::Array => self.crack_array(session, element, path, trailing_bits)?,
            _ => crack_leaf(session, element, path, trailing_bits)?,
        }
        Ok(Span {
            offset_bits: start,
            length_bits: session.reader.position().saturating_sub(start),
        })
    }

    fn crack_block(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        trailing_bits: u64,
    ) -> Result<(), CrackError> {
        let mut deferred = DeferredWindow {
            start: session.reader.position(),
            target: None,
            saved_limit: None,
        };
        let mut window = None;
        if let Some(Relation::Size { from, unit }) = element.relation(RelationKind::Size) {
            match own_descendant(element, path, from) {
                Some(target) => deferred.target = Some((target, *unit)),
                None => {
                    let size = session.lookup_u64(path, from, RelationKind::Size)?;
                    window = Some(unit.to_bits(size));
                }
            }
        } else if let Some(bits) = element.length_bits() {
            window = Some(bits);
        }

        let previous_limit = match window {
            Some(bits) => Some(session.reader.narrow(bits).ok_or_else(|| {
                session.failure(path, format!("not enough data for {bits} bit block"))
            })?),
            None => None,
        };
        let inner_trailing = if previous_limit.is_some() { 0 } else { trailing_bits };

        let result = self.crack_children(session, element, path, inner_trailing, &mut deferred);

        if let Some(limit) = deferred.saved_limit {
            if result.is_ok() {
                session.reader.seek(session.reader.limit());
            }
            session.reader.restore_limit(limit);
        }
        if let Some(limit) = previous_limit {
            if result.is_ok() {
                session.reader.seek(session.reader.limit());
            }
            session.reader.restore_limit(limit);
        }
        result?;
        if let Some((target, _)) = deferred.target {
            return Err(CrackError::Definition {
                path: path.to_string(),
                reason: format!("size field '{target}' was never cracked"),
            });
        }
        Ok(())
    }

    fn crack_children(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        mut trailing_bits: u64,
        deferred: &mut DeferredWindow,
    ) -> Result<(), CrackError> {
        let statics: Vec<u64> = element
            .children()
            .iter()
            .map(|c| c.static_bits().unwrap_or(0))
            .collect();
        for (index, child) in element.children_mut().iter_mut().enumerate() {
            let after: u64 = statics[index + 1..].iter().sum::<u64>() + trailing_bits;
            let item_path = child_path(path, child.name());
            self.crack_node(session, child, &item_path, after)?;

            let settled = match deferred.target.as_ref() {
                Some((target, unit)) => session
                    .logged(target)
                    .map(|value| (value.as_u64(), *unit)),
                None => None,
            };
            if let Some((value, unit)) = settled {
                let size = value.map_err(|e| session.failure(path, format!("size value: {e}")))?;
                let end = deferred.start.saturating_add(unit.to_bits(size));
                let position = session.reader.position();
                if end < position {
                    return Err(session.failure(
                        path,
                        format!("size {size} is smaller than the data already read"),
                    ));
                }
                let limit = session.reader.narrow(end - position).ok_or_else(|| {
                    session.failure(path, format!("not enough data for size {size}"))
                })?;
                deferred.saved_limit = Some(limit);
                deferred.target = None;
                trailing_bits = 0;
            }
        }
        Ok(())
    }

    fn crack_choice(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        trailing_bits: u64,
    ) -> Result<(), CrackError> {
        let start = session.reader.position();
        let log_len = session.log.len();
        let mut reasons = Vec::new();
        let mut chosen = None;
        for (index, branch) in element.children_mut().iter_mut().enumerate() {
            let branch_path = child_path(path, branch.name());
            match self.crack_node(session, branch, &branch_path, trailing_bits) {
                Ok(()) => {
                    chosen = Some(index);
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    trace!(path = %branch_path, error = %e, "choice branch rejected");
                    session.reader.seek(start);
                    session.log.truncate(log_len);
                    reasons.push(branch.name().to_string());
                }
                Err(e) => return Err(e),
            }
        }
        match chosen {
            Some(index) => {
                element.select(Some(index));
                Ok(())
            }
            None => {
                element.select(None);
                Err(CrackError::Failure {
                    path: path.to_string(),
                    offset_bits: start,
                    reason: format!("no branch matched (tried {})", reasons.join(", ")),
                })
            }
        }
    }

    fn crack_array(
        &mut self,
        session: &mut Session<'_>,
        element: &mut DataElement,
        path: &str,
        trailing_bits: u64,
    ) -> Result<(), CrackError> {
        let (template, min_occurs, max_occurs) = match element.shape() {
            Shape::Array {
                template,
                min_occurs,
                max_occurs,
            } => (template.as_ref().clone(), *min_occurs, *max_occurs),
            _ => {
                return Err(CrackError::Definition {
                    path: path.to_string(),
                    reason: "element is not an array".to_string(),
                });
            }
        };
        element.children_mut().clear();

        if let Some(Relation::Count { from }) = element.relation(RelationKind::Count) {
            let count = session.lookup_u64(path, from, RelationKind::Count)?;
            if max_occurs.is_some_and(|max| count > max as u64) {
                return Err(session.failure(
                    path,
                    format!("count {count} exceeds max-occurs {}", max_occurs.unwrap_or(0)),
                ));
            }
            let available = session.reader.remaining().saturating_sub(trailing_bits);
            if let Some(bits) = template.static_bits().filter(|bits| *bits > 0) {
                if count.saturating_mul(bits) > available {
                    return Err(session.failure(
                        path,
                        format!("count {count} needs {} bits, {available} left", count.saturating_mul(bits)),
                    ));
                }
            }
            for index in 0..count as usize {
                let position = session.reader.position();
                let mut item = occurrence(&template, index);
                let item_path = child_path(path, item.name());
                self.crack_node(session, &mut item, &item_path, trailing_bits)?;
                // Empty occurrences are only taken while the count stays within
                // the bits left, so a bogus count cannot grow the tree unbounded.
                if session.reader.position() == position && count > available {
                    return Err(session.failure(
                        path,
                        format!("count {count} of empty occurrences exceeds the {available} bits left"),
                    ));
                }
                element.children_mut().push(item);
            }
            return Ok(());
        }

        for index in 0.. {
            if max_occurs.is_some_and(|max| index >= max)
                || session.reader.remaining() <= trailing_bits
            {
                break;
            }
            let position = session.reader.position();
            let log_len = session.log.len();
            let mut item = occurrence(&template, index);
            let item_path = child_path(path, item.name());
            match self.crack_node(session, &mut item, &item_path, trailing_bits) {
                Ok(()) => {
                    let advanced = session.reader.position() != position;
                    element.children_mut().push(item);
                    if !advanced {
                        break;
                    }
                }
                Err(e) if e.is_recoverable() && index >= min_occurs => {
                    trace!(path, occurrences = index, error = %e, "array ended");
                    session.reader.seek(position);
                    session.log.truncate(log_len);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let found = element.children().len();
        if found < min_occurs {
            return Err(session.failure(
                path,
                format!("found {found} occurrences, need at least {min_occurs}"),
            ));
        }
        Ok(())
    }
}

/// Window of a block sized by one of its own children, narrowed once that
/// child is cracked.
struct DeferredWindow {
    start: u64,
    target: Option<(String, SizeUnit)>,
    /// Limit to restore when the block is done.
    saved_limit: Option<u64>,
}

/// The path of a descendant of `element` a size reference denotes, if any.
fn own_descendant(element: &DataElement, path: &str, reference: &str) -> Option<String> {
    let prefix = format!("{path}.");
    candidate_paths(path, reference).into_iter().find(|candidate| {
        candidate
            .strip_prefix(&prefix)
            .is_some_and(|relative| element.descendant(relative).is_some())
    })
}

fn leaf_bits(
    session: &Session<'_>,
    element: &DataElement,
    path: &str,
    trailing_bits: u64,
) -> Result<u64, CrackError> {
    if let Some(Relation::Size { from, unit }) = element.relation(RelationKind::Size) {
        let size = session.lookup_u64(path, from, RelationKind::Size)?;
        return Ok(unit.to_bits(size));
    }
    if let Some(bits) = element.length_bits() {
        return Ok(bits);
    }
    match element.shape() {
        Shape::Number { bits, .. } | Shape::Flag { bits } => Ok(u64::from(*bits)),
        _ => {
            let remaining = session.reader.remaining();
            if remaining < trailing_bits {
                return Err(session.failure(path, "not enough data"));
            }
            Ok(remaining - trailing_bits)
        }
    }
}

fn crack_leaf(
    session: &mut Session<'_>,
    element: &mut DataElement,
    path: &str,
    trailing_bits: u64,
) -> Result<(), CrackError> {
    let bits = leaf_bits(session, element, path, trailing_bits)?;
    if bits > session.reader.remaining() {
        return Err(session.failure(
            path,
            format!(
                "not enough data: need {bits} bits, {} left",
                session.reader.remaining()
            ),
        ));
    }

    let value = match element.shape() {
        Shape::Number {
            bits: width,
            signed,
            endian,
        } => {
            let raw = read_number(&mut session.reader, *width, *endian)
                .ok_or_else(|| session.failure(path, "not enough data"))?;
            if *signed {
                let shift = 64 - *width;
                Variant::Int(((raw << shift) as i64) >> shift)
            } else {
                Variant::UInt(raw)
            }
        }
        Shape::Flag { bits: width } => {
            let raw = session
                .reader
                .read_bits(*width)
                .ok_or_else(|| session.failure(path, "not enough data"))?;
            Variant::UInt(raw)
        }
        Shape::String { encoding } => {
            if bits % 8 != 0 {
                return Err(session.failure(path, format!("string size of {bits} bits")));
            }
            let start = session.reader.position();
            let bytes = session
                .reader
                .read_bit_buffer(bits)
                .ok_or_else(|| session.failure(path, "not enough data"))?;
            let text = match (*encoding, String::from_utf8(bytes)) {
                (StringEncoding::Ascii, Ok(text)) if !text.is_ascii() => None,
                (_, Ok(text)) => Some(text),
                (_, Err(_)) => None,
            };
            match text {
                Some(text) => Variant::Str(text),
                None => {
                    return Err(CrackError::Failure {
                        path: path.to_string(),
                        offset_bits: start,
                        reason: format!("data is not valid {encoding:?} text"),
                    });
                }
            }
        }
        _ => {
            let data = session
                .reader
                .read_bit_buffer(bits)
                .ok_or_else(|| session.failure(path, "not enough data"))?;
            if bits % 8 == 0 {
                Variant::Bytes(data)
            } else {
                Variant::Bits { data, len: bits }
            }
        }
    };

    if element.is_token() && !value.loosely_equals(element.default_value()) {
        return Err(CrackError::Failure {
            path: path.to_string(),
            offset_bits: session.reader.position() - bits,
            reason: format!("token mismatch: expected {}, found {value}", element.default_value()),
        });
    }
    session.log.push((path.to_string(), value.clone()));
    element.set_default(value);
    Ok(())
}

fn read_number(reader: &mut BitReader<'_>, bits: u32, endian: Endian) -> Option<u64> {
    match endian {
        Endian::Big => reader.read_bits(bits),
        Endian::Little => {
            let mut value = 0u64;
            for i in 0..bits / 8 {
                value |= reader.read_bits(8)? << (8 * i);
            }
            Some(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn crack(root: DataElement, data: &[u8]) -> (DataModel, Result<CrackReport, CrackError>) {
        let mut model = DataModel::new(root).unwrap();
        let result = Cracker::new().crack(&mut model, data);
        (model, result)
    }

    #[test]
    fn command_with_length_prefixed_payload() {
        let root = DataElement::block(
            "msg",
            vec![
                DataElement::string("cmd").with_length_bytes(3),
                DataElement::number("len", 16),
                DataElement::blob("payload").with_relation(Relation::size("len")),
            ],
        );
        let (model, result) = crack(root, b"GET\x05\x00abcdefgh");
        let report = result.unwrap();
        assert_eq!(model.find("msg.cmd").unwrap().default_value(), &Variant::from("GET"));
        assert_eq!(model.find("msg.len").unwrap().default_value(), &Variant::UInt(5));
        assert_eq!(
            model.find("msg.payload").unwrap().default_value(),
            &Variant::Bytes(b"abcde".to_vec())
        );
        assert_eq!(report.unread_bytes(), 3, "three trailing bytes stay unread");
        let span = model.find("msg.payload").unwrap().span().unwrap();
        assert_eq!((span.byte_offset(), span.byte_len()), (5, 5));
    }

    #[test]
    fn choice_rewinds_and_takes_second_branch() {
        let root = DataElement::choice(
            "packet",
            vec![
                DataElement::block(
                    "a",
                    vec![
                        DataElement::number("tag", 8).with_default(1u64).token(),
                        DataElement::string("text"),
                    ],
                ),
                DataElement::block(
                    "b",
                    vec![
                        DataElement::number("tag", 8).with_default(2u64).token(),
                        DataElement::blob("data"),
                    ],
                ),
            ],
        );
        let (model, result) = crack(root, &[0x02, 0xFF, 0xFE]);
        result.unwrap();
        let choice = model.root();
        assert_eq!(choice.selected(), Some(1), "branch b should be selected");
        assert_eq!(
            model.find("packet.b.data").unwrap().default_value(),
            &Variant::Bytes(vec![0xFF, 0xFE])
        );
        assert_eq!(model.find("packet.b.tag").unwrap().span().unwrap().offset_bits, 0);
    }

    #[test]
    fn first_matching_branch_wins() {
        let root = DataElement::choice(
            "c",
            vec![DataElement::blob("first"), DataElement::blob("second")],
        );
        let (model, result) = crack(root, &[1, 2]);
        result.unwrap();
        assert_eq!(model.root().selected(), Some(0));
    }

    #[test]
    fn choice_without_match_fails_at_its_start() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("x", 8),
                DataElement::choice(
                    "c",
                    vec![DataElement::number("t", 8).with_default(9u64).token()],
                ),
            ],
        );
        let (_, result) = crack(root, &[0, 1]);
        let err = result.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.path(), "r.c");
        assert_eq!(err.byte_offset(), Some(1));
    }

    #[test]
    fn array_with_count_relation() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 8),
                DataElement::array("items", DataElement::number("item", 16).big_endian(), 0, None)
                    .with_relation(Relation::count("n")),
                DataElement::blob("rest"),
            ],
        );
        let (model, result) = crack(root, &[2, 0, 1, 0, 2, 9]);
        result.unwrap();
        let items = model.find("r.items").unwrap();
        assert_eq!(items.children().len(), 2);
        assert_eq!(
            model.find("r.items.item_1").unwrap().default_value(),
            &Variant::UInt(2)
        );
        assert_eq!(model.find("r.rest").unwrap().default_value(), &Variant::Bytes(vec![9]));
    }

    #[test]
    fn count_above_max_occurs_fails() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 8),
                DataElement::array("items", DataElement::number("item", 8), 0, Some(2))
                    .with_relation(Relation::count("n")),
            ],
        );
        let (_, result) = crack(root, &[3, 1, 2, 3]);
        assert!(result.unwrap_err().is_recoverable());
    }

    #[test]
    fn array_stops_at_exhaustion_and_max() {
        let template = DataElement::number("b", 8);
        let (model, result) = crack(DataElement::array("a", template.clone(), 0, None), &[1, 2, 3]);
        result.unwrap();
        assert_eq!(model.root().children().len(), 3);

        let (model, result) = crack(DataElement::array("a", template, 1, Some(2)), &[1, 2, 3]);
        let report = result.unwrap();
        assert_eq!(model.root().children().len(), 2);
        assert_eq!(report.unread_bytes(), 1);
    }

    #[test]
    fn empty_input_gives_an_empty_array() {
        let (model, result) = crack(DataElement::array("a", DataElement::number("b", 8), 0, None), &[]);
        let report = result.unwrap();
        assert!(model.root().children().is_empty());
        assert_eq!(report.consumed_bits, 0);

        let root = DataElement::block(
            "r",
            vec![
                DataElement::array("a", DataElement::number("b", 8), 0, None),
                DataElement::number("crc", 16),
            ],
        );
        let (model, result) = crack(root, &[0x34, 0x12]);
        result.unwrap();
        assert!(model.find("r.a").unwrap().children().is_empty());
        assert_eq!(model.find("r.crc").unwrap().default_value(), &Variant::UInt(0x1234));
    }

    #[test]
    fn count_larger_than_the_data_fails_early() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 32),
                DataElement::array("items", DataElement::number("item", 8), 0, None)
                    .with_relation(Relation::count("n")),
            ],
        );
        let (model, result) = crack(root, &[0xff, 0xff, 0xff, 0xff, 1, 2]);
        assert!(result.unwrap_err().is_recoverable());
        assert!(model.find("r.items").unwrap().children().is_empty());

        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 32),
                DataElement::array("items", DataElement::block("e", vec![]), 0, None)
                    .with_relation(Relation::count("n")),
            ],
        );
        let (model, result) = crack(root, &[0x00, 0x00, 0x40, 0x00]);
        assert!(result.unwrap_err().is_recoverable());
        assert!(model.find("r.items").unwrap().children().is_empty());

        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 8),
                DataElement::array("items", DataElement::block("e", vec![]), 0, None)
                    .with_relation(Relation::count("n")),
                DataElement::blob("rest"),
            ],
        );
        let (model, result) = crack(root, &[2, 7, 7]);
        result.unwrap();
        assert_eq!(model.find("r.items").unwrap().children().len(), 2);
    }

    #[test]
    fn array_failure_after_min_keeps_prior_occurrences() {
        let template = DataElement::number("t", 8).with_default(0xAAu64).token();
        let root = DataElement::block(
            "r",
            vec![
                DataElement::array("tags", template, 1, None),
                DataElement::blob("tail"),
            ],
        );
        let (model, result) = crack(root, &[0xAA, 0xAA, 0x01, 0x02]);
        result.unwrap();
        assert_eq!(model.find("r.tags").unwrap().children().len(), 2);
        assert_eq!(
            model.find("r.tail").unwrap().default_value(),
            &Variant::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn array_failure_before_min_propagates() {
        let template = DataElement::number("t", 8).with_default(0xAAu64).token();
        let (_, result) = crack(DataElement::array("tags", template, 3, None), &[0xAA, 0x01, 0xAA]);
        let err = result.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.path(), "tags.t_1");
    }

    #[test]
    fn remaining_size_leaves_room_for_trailing_fields() {
        let root = DataElement::block(
            "r",
            vec![DataElement::blob("body"), DataElement::number("crc", 16)],
        );
        let (model, result) = crack(root, &[1, 2, 3, 4, 5]);
        result.unwrap();
        assert_eq!(
            model.find("r.body").unwrap().default_value(),
            &Variant::Bytes(vec![1, 2, 3])
        );
        assert_eq!(model.find("r.crc").unwrap().default_value(), &Variant::UInt(0x0504));
    }

    #[test]
    fn sized_block_is_a_window() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("len", 8),
                DataElement::block("inner", vec![DataElement::blob("data")])
                    .with_relation(Relation::size("len")),
                DataElement::blob("after"),
            ],
        );
        let (model, result) = crack(root, &[2, 7, 8, 9]);
        result.unwrap();
        assert_eq!(
            model.find("r.inner.data").unwrap().default_value(),
            &Variant::Bytes(vec![7, 8])
        );
        assert_eq!(model.find("r.after").unwrap().default_value(), &Variant::Bytes(vec![9]));
    }

    #[test]
    fn block_sized_by_its_own_child() {
        let record = DataElement::block(
            "rec",
            vec![DataElement::number("len", 8), DataElement::blob("data")],
        )
        .with_relation(Relation::size("rec.len"));
        let root = DataElement::block("r", vec![record, DataElement::blob("rest")]);
        let (model, result) = crack(root, &[3, 0xA, 0xB, 0xC]);
        result.unwrap();
        assert_eq!(
            model.find("r.rec.data").unwrap().default_value(),
            &Variant::Bytes(vec![0xA, 0xB])
        );
        assert_eq!(model.find("r.rest").unwrap().default_value(), &Variant::Bytes(vec![0xC]));
    }

    #[test]
    fn offset_relation_seeks() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("at", 8),
                DataElement::number("value", 8).with_relation(Relation::offset("at")),
            ],
        );
        let (model, result) = crack(root, &[3, 0, 0, 0x42]);
        result.unwrap();
        assert_eq!(model.find("r.value").unwrap().default_value(), &Variant::UInt(0x42));
        assert_eq!(model.find("r.value").unwrap().span().unwrap().byte_offset(), 3);
    }

    #[test]
    fn unsatisfied_condition_fails_the_node() {
        let optional = DataElement::choice(
            "opt",
            vec![
                DataElement::block(
                    "present",
                    vec![DataElement::number("extra", 8)],
                )
                .with_relation(Relation::when("kind", 1u64)),
                DataElement::block("absent", vec![]),
            ],
        );
        let root = DataElement::block("r", vec![DataElement::number("kind", 8), optional]);
        let (model, result) = crack(root.clone(), &[1, 5]);
        result.unwrap();
        assert_eq!(model.find("r.opt").unwrap().selected(), Some(0));

        let (model, result) = crack(root, &[0, 5]);
        result.unwrap();
        assert_eq!(model.find("r.opt").unwrap().selected(), Some(1));
    }

    #[test]
    fn forward_and_unknown_references_are_definition_errors() {
        let forward = DataElement::block(
            "r",
            vec![
                DataElement::blob("data").with_relation(Relation::size("len")),
                DataElement::number("len", 8),
            ],
        );
        let (_, result) = crack(forward, &[1, 2, 3]);
        let err = result.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("before it is cracked"));

        let unknown = DataElement::choice(
            "c",
            vec![DataElement::blob("data").with_relation(Relation::size("nope"))],
        );
        let (_, result) = crack(unknown, &[1]);
        assert!(matches!(result, Err(CrackError::Definition { .. })));
    }

    #[test]
    fn token_and_text_mismatches_fail() {
        let (_, result) = crack(DataElement::string("s").with_default("HI").token(), b"NO");
        assert!(result.unwrap_err().to_string().contains("token mismatch"));

        let (_, result) = crack(DataElement::string("s").ascii(), &[0xC3, 0xA9]);
        assert!(result.unwrap_err().is_recoverable());
    }

    #[test]
    fn signed_and_bit_fields() {
        let root = DataElement::block(
            "r",
            vec![
                DataElement::number("n", 16).signed(),
                DataElement::flag("hi", 4),
                DataElement::flag("lo", 4),
            ],
        );
        let (model, result) = crack(root, &[0xFE, 0xFF, 0xA5]);
        result.unwrap();
        assert_eq!(model.find("r.n").unwrap().default_value(), &Variant::Int(-2));
        assert_eq!(model.find("r.hi").unwrap().default_value(), &Variant::UInt(0xA));
        assert_eq!(model.find("r.lo").unwrap().default_value(), &Variant::UInt(0x5));
    }

    #[test]
    fn cracked_model_generates_the_consumed_bytes() {
        let root = DataElement::block(
            "msg",
            vec![
                DataElement::number("count", 8),
                DataElement::array(
                    "entries",
                    DataElement::block(
                        "entry",
                        vec![
                            DataElement::number("len", 16).big_endian(),
                            DataElement::string("name").with_relation(Relation::size("len")),
                        ],
                    ),
                    0,
                    None,
                )
                .with_relation(Relation::count("count")),
                DataElement::choice(
                    "trailer",
                    vec![
                        DataElement::number("end", 8).with_default(0u64).token(),
                        DataElement::blob("junk"),
                    ],
                ),
            ],
        );
        let input = b"\x02\x00\x03abc\x00\x01z\x00";
        let (model, result) = crack(root, input);
        result.unwrap();
        assert_eq!(model.generate().unwrap(), input.to_vec());
    }

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl CrackObserver for Recorder {
        fn enter_element(&mut self, path: &str, _kind: ElementKind, _position_bits: u64) {
            self.0.borrow_mut().push(format!("enter {path}"));
        }

        fn exit_element(&mut self, path: &str, span: Option<Span>) {
            let status = if span.is_some() { "ok" } else { "failed" };
            self.0.borrow_mut().push(format!("exit {path} {status}"));
        }
    }

    #[test]
    fn observers_see_every_node() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut cracker = Cracker::new();
        cracker.add_observer(Box::new(Recorder(events.clone())));
        let mut model = DataModel::new(DataElement::choice(
            "c",
            vec![
                DataElement::number("a", 8).with_default(1u64).token(),
                DataElement::number("b", 8),
            ],
        ))
        .unwrap();
        cracker.crack(&mut model, &[7]).unwrap();
        assert_eq!(
            *events.borrow(),
            vec![
                "enter c",
                "enter c.a",
                "exit c.a failed",
                "enter c.b",
                "exit c.b ok",
                "exit c ok",
            ]
        );
    }
}
