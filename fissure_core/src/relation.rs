use crate::variant::Variant;

/// Unit a size relation is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeUnit {
    Bits,
    #[default]
    Bytes,
}

impl SizeUnit {
    pub fn to_bits(self, value: u64) -> u64 {
        match self {
            SizeUnit::Bits => value,
            SizeUnit::Bytes => value.saturating_mul(8),
        }
    }

    pub fn from_bits(self, bits: u64) -> u64 {
        match self {
            SizeUnit::Bits => bits,
            SizeUnit::Bytes => bits.div_ceil(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Size,
    Offset,
    Count,
    When,
}

/// A named cross-reference attached to the element it governs.
///
/// `from` names the element holding the value; it is looked up by path every
/// time it is needed, so cloned or re-cracked trees never hold stale links.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    /// The owner's size is the value of `from`.
    Size { from: String, unit: SizeUnit },
    /// The owner starts at the byte offset held by `from`.
    Offset { from: String },
    /// The owner (an array) has as many occurrences as the value of `from`.
    Count { from: String },
    /// The owner is only present when `from` equals `equals`.
    When { from: String, equals: Variant },
}

impl Relation {
    pub fn size(from: impl Into<String>) -> Self {
        Relation::Size {
            from: from.into(),
            unit: SizeUnit::Bytes,
        }
    }

    pub fn size_in_bits(from: impl Into<String>) -> Self {
        Relation::Size {
            from: from.into(),
            unit: SizeUnit::Bits,
        }
    }

    pub fn offset(from: impl Into<String>) -> Self {
        Relation::Offset { from: from.into() }
    }

    pub fn count(from: impl Into<String>) -> Self {
        Relation::Count { from: from.into() }
    }

    pub fn when(from: impl Into<String>, equals: impl Into<Variant>) -> Self {
        Relation::When {
            from: from.into(),
            equals: equals.into(),
        }
    }

    pub fn kind(&self) -> RelationKind {
        match self {
            Relation::Size { .. } => RelationKind::Size,
            Relation::Offset { .. } => RelationKind::Offset,
            Relation::Count { .. } => RelationKind::Count,
            Relation::When { .. } => RelationKind::When,
        }
    }

    pub fn from(&self) -> &str {
        match self {
            Relation::Size { from, .. }
            | Relation::Offset { from }
            | Relation::Count { from }
            | Relation::When { from, .. } => from,
        }
    }
}

/// Parent path of a dot separated element path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(parent, _)| parent)
}

pub fn child_path(parent: &str, name: &str) -> String {
    format!("{parent}.{name}")
}

/// Paths a reference from `owner` may denote, most specific first.
///
/// A reference is tried relative to every enclosing scope of the owner, from
/// its parent up to the root, and finally as an absolute path.
pub fn candidate_paths(owner: &str, reference: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut scope = parent_path(owner);
    while let Some(current) = scope {
        candidates.push(child_path(current, reference));
        scope = parent_path(current);
    }
    candidates.push(reference.to_string());
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_walk_up_the_tree() {
        let candidates = candidate_paths("root.items.items_0.data", "len");
        assert_eq!(
            candidates,
            vec![
                "root.items.items_0.len".to_string(),
                "root.items.len".to_string(),
                "root.len".to_string(),
                "len".to_string(),
            ]
        );
    }

    #[test]
    fn candidates_for_root_owner() {
        assert_eq!(candidate_paths("root", "root.len"), vec!["root.len".to_string()]);
    }

    #[test]
    fn size_units() {
        assert_eq!(SizeUnit::Bytes.to_bits(5), 40);
        assert_eq!(SizeUnit::Bytes.from_bits(9), 2);
        assert_eq!(SizeUnit::Bits.from_bits(9), 9);
    }

    #[test]
    fn relation_accessors() {
        let rel = Relation::when("type", 2u64);
        assert_eq!(rel.kind(), RelationKind::When);
        assert_eq!(rel.from(), "type");
        assert_eq!(Relation::size("len").kind(), RelationKind::Size);
    }
}
