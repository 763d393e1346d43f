//! The structural node tree describing a format.
//!
//! A [`DataElement`] owns its children outright; nothing in the tree points back
//! up. An element's parent is identified by its dot separated path, which is
//! also how [`Relation`]s refer to other elements.

use crate::fixup::{Fixup, FixupHandle};
use crate::relation::{Relation, RelationKind, child_path};
use crate::variant::Variant;
use std::fmt;

/// Value-kind tag of an element, used by mutators to decide what they support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Number,
    String,
    Blob,
    Flag,
    Block,
    Choice,
    Array,
}

impl ElementKind {
    pub fn is_container(self) -> bool {
        matches!(self, ElementKind::Block | ElementKind::Choice | ElementKind::Array)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Number => "Number",
            ElementKind::String => "String",
            ElementKind::Blob => "Blob",
            ElementKind::Flag => "Flag",
            ElementKind::Block => "Block",
            ElementKind::Choice => "Choice",
            ElementKind::Array => "Array",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    Ascii,
    #[default]
    Utf8,
}

/// Kind-specific layout of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Number {
        bits: u32,
        signed: bool,
        endian: Endian,
    },
    String {
        encoding: StringEncoding,
    },
    Blob,
    Flag {
        bits: u32,
    },
    Block,
    Choice {
        selected: Option<usize>,
    },
    Array {
        template: Box<DataElement>,
        min_occurs: usize,
        max_occurs: Option<usize>,
    },
}

/// Where an element was found in the cracked input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset_bits: u64,
    pub length_bits: u64,
}

impl Span {
    pub fn byte_offset(&self) -> u64 {
        self.offset_bits / 8
    }

    pub fn byte_len(&self) -> u64 {
        self.length_bits.div_ceil(8)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataElement {
    name: String,
    shape: Shape,
    children: Vec<DataElement>,
    default_value: Variant,
    mutated_value: Option<Variant>,
    length_bits: Option<u64>,
    token: bool,
    relations: Vec<Relation>,
    fixup: Option<FixupHandle>,
    span: Option<Span>,
}

impl DataElement {
    fn with_shape(name: impl Into<String>, shape: Shape, default_value: Variant) -> Self {
        Self {
            name: name.into(),
            shape,
            children: Vec::new(),
            default_value,
            mutated_value: None,
            length_bits: None,
            token: false,
            relations: Vec::new(),
            fixup: None,
            span: None,
        }
    }

    /// An unsigned little endian number of `bits` bits.
    pub fn number(name: impl Into<String>, bits: u32) -> Self {
        Self::with_shape(
            name,
            Shape::Number {
                bits,
                signed: false,
                endian: Endian::Little,
            },
            Variant::UInt(0),
        )
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::with_shape(
            name,
            Shape::String {
                encoding: StringEncoding::Utf8,
            },
            Variant::Str(String::new()),
        )
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::with_shape(name, Shape::Blob, Variant::Bytes(Vec::new()))
    }

    pub fn flag(name: impl Into<String>, bits: u32) -> Self {
        Self::with_shape(name, Shape::Flag { bits }, Variant::UInt(0))
    }

    pub fn block(name: impl Into<String>, children: Vec<DataElement>) -> Self {
        let mut block = Self::with_shape(name, Shape::Block, Variant::Bytes(Vec::new()));
        block.children = children;
        block
    }

    pub fn choice(name: impl Into<String>, branches: Vec<DataElement>) -> Self {
        let mut choice = Self::with_shape(
            name,
            Shape::Choice { selected: None },
            Variant::Bytes(Vec::new()),
        );
        choice.children = branches;
        choice
    }

    /// An array of `template`. It starts out expanded to `min_occurs`
    /// occurrences (at least one when `max_occurs` allows it).
    pub fn array(
        name: impl Into<String>,
        template: DataElement,
        min_occurs: usize,
        max_occurs: Option<usize>,
    ) -> Self {
        let occurs = min_occurs.max(1).min(max_occurs.unwrap_or(usize::MAX));
        let mut array = Self::with_shape(
            name,
            Shape::Array {
                template: Box::new(template),
                min_occurs,
                max_occurs,
            },
            Variant::Bytes(Vec::new()),
        );
        array.expand(occurs);
        array
    }

    pub fn signed(mut self) -> Self {
        if let Shape::Number { signed, .. } = &mut self.shape {
            *signed = true;
            if let Variant::UInt(v) = self.default_value {
                self.default_value = Variant::Int(v as i64);
            }
        }
        self
    }

    pub fn big_endian(mut self) -> Self {
        if let Shape::Number { endian, .. } = &mut self.shape {
            *endian = Endian::Big;
        }
        self
    }

    pub fn ascii(mut self) -> Self {
        if let Shape::String { encoding } = &mut self.shape {
            *encoding = StringEncoding::Ascii;
        }
        self
    }

    pub fn with_default(mut self, value: impl Into<Variant>) -> Self {
        self.default_value = value.into();
        self
    }

    pub fn with_length_bytes(mut self, bytes: u64) -> Self {
        self.length_bits = Some(bytes * 8);
        self
    }

    pub fn with_length_bits(mut self, bits: u64) -> Self {
        self.length_bits = Some(bits);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Generates the element with `fixup`'s value instead of its default.
    pub fn with_fixup(mut self, fixup: impl Fixup + 'static) -> Self {
        self.fixup = Some(FixupHandle::new(fixup));
        self
    }

    /// Marks the element as a token: cracking only succeeds when the data
    /// matches the default value.
    pub fn token(mut self) -> Self {
        self.token = true;
        self
    }

    /// Replaces the occurrences of an array with `count` copies of its template.
    pub fn with_occurs(mut self, count: usize) -> Self {
        self.expand(count);
        self
    }

    fn expand(&mut self, count: usize) {
        if let Shape::Array { template, .. } = &self.shape {
            let template = template.as_ref().clone();
            self.children = (0..count).map(|i| occurrence(&template, i)).collect();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> ElementKind {
        match self.shape {
            Shape::Number { .. } => ElementKind::Number,
            Shape::String { .. } => ElementKind::String,
            Shape::Blob => ElementKind::Blob,
            Shape::Flag { .. } => ElementKind::Flag,
            Shape::Block => ElementKind::Block,
            Shape::Choice { .. } => ElementKind::Choice,
            Shape::Array { .. } => ElementKind::Array,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn is_container(&self) -> bool {
        self.kind().is_container()
    }

    pub fn children(&self) -> &[DataElement] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<DataElement> {
        &mut self.children
    }

    pub fn child(&self, name: &str) -> Option<&DataElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut DataElement> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Looks up an element below this one by a path relative to it.
    pub fn descendant(&self, relative: &str) -> Option<&DataElement> {
        relative
            .split('.')
            .try_fold(self, |current, segment| current.child(segment))
    }

    pub fn descendant_mut(&mut self, relative: &str) -> Option<&mut DataElement> {
        relative
            .split('.')
            .try_fold(self, |current, segment| current.child_mut(segment))
    }

    pub fn default_value(&self) -> &Variant {
        &self.default_value
    }

    pub fn set_default(&mut self, value: Variant) {
        self.default_value = value;
    }

    pub fn mutated_value(&self) -> Option<&Variant> {
        self.mutated_value.as_ref()
    }

    pub fn set_mutated(&mut self, value: Variant) {
        self.mutated_value = Some(value);
    }

    /// Clears the mutated value of this element and everything below it.
    pub fn clear_mutations(&mut self) {
        self.mutated_value = None;
        for child in &mut self.children {
            child.clear_mutations();
        }
    }

    /// The value used for generation: the mutated value when present.
    pub fn value(&self) -> &Variant {
        self.mutated_value.as_ref().unwrap_or(&self.default_value)
    }

    pub fn length_bits(&self) -> Option<u64> {
        self.length_bits
    }

    pub fn is_token(&self) -> bool {
        self.token
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn fixup(&self) -> Option<&FixupHandle> {
        self.fixup.as_ref()
    }

    pub fn relation(&self, kind: RelationKind) -> Option<&Relation> {
        self.relations.iter().find(|r| r.kind() == kind)
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }

    pub(crate) fn set_span(&mut self, span: Span) {
        self.span = Some(span);
    }

    /// Index of the selected branch of a Choice.
    pub fn selected(&self) -> Option<usize> {
        match self.shape {
            Shape::Choice { selected } => selected,
            _ => None,
        }
    }

    pub fn select(&mut self, index: Option<usize>) {
        if let Shape::Choice { selected } = &mut self.shape {
            *selected = index;
        }
    }

    /// The branch a Choice generates from: the selected one, else the first.
    pub fn active_branch(&self) -> Option<&DataElement> {
        self.children.get(self.selected().unwrap_or(0))
    }

    pub fn array_template(&self) -> Option<&DataElement> {
        match &self.shape {
            Shape::Array { template, .. } => Some(template),
            _ => None,
        }
    }

    /// Size in bits known without looking at any data, if there is one.
    pub fn static_bits(&self) -> Option<u64> {
        if self.relations.iter().any(|r| r.kind() != RelationKind::Count) {
            return None;
        }
        if let Some(bits) = self.length_bits {
            return Some(bits);
        }
        match &self.shape {
            Shape::Number { bits, .. } | Shape::Flag { bits } => Some(u64::from(*bits)),
            Shape::Block => self
                .children
                .iter()
                .try_fold(0u64, |acc, child| Some(acc + child.static_bits()?)),
            _ => None,
        }
    }

    /// Visits every element reachable from this one in declared order. For a
    /// Choice only the active branch is reachable.
    pub fn walk<'a>(&'a self, path: &str, visit: &mut dyn FnMut(&str, &'a DataElement)) {
        visit(path, self);
        if let Shape::Choice { .. } = self.shape {
            if let Some(branch) = self.active_branch() {
                branch.walk(&child_path(path, &branch.name), visit);
            }
            return;
        }
        for child in &self.children {
            child.walk(&child_path(path, &child.name), visit);
        }
    }

    /// Every element name used anywhere in the tree, including unselected
    /// branches and array templates.
    pub fn collect_names(&self, names: &mut std::collections::HashSet<String>) {
        names.insert(self.name.clone());
        for child in &self.children {
            child.collect_names(names);
        }
        if let Shape::Array { template, .. } = &self.shape {
            template.collect_names(names);
        }
    }
}

/// A fresh occurrence of an array template.
pub(crate) fn occurrence(template: &DataElement, index: usize) -> DataElement {
    let mut element = template.clone();
    element.set_name(format!("{}_{}", template.name(), index));
    element
}
