//! Change paths and the minimal covering change-set sent to subscribers.
use std::collections::BTreeSet;
use std::fmt;

/// Location in the state tree, from a whole node down to one channel.
///
/// Variants are declared shallowest first so the derived ordering sorts by depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangePath {
    Node(u8),
    Service(u8, u8),
    DataType(u8, u8, String),
    Channel(u8, u8, String, u32),
}

impl ChangePath {
    pub fn depth(&self) -> usize {
        match self {
            ChangePath::Node(..) => 1,
            ChangePath::Service(..) => 2,
            ChangePath::DataType(..) => 3,
            ChangePath::Channel(..) => 4,
        }
    }

    pub fn node(&self) -> u8 {
        match self {
            ChangePath::Node(n)
            | ChangePath::Service(n, _)
            | ChangePath::DataType(n, _, _)
            | ChangePath::Channel(n, _, _, _) => *n,
        }
    }

    pub fn service(&self) -> Option<u8> {
        match self {
            ChangePath::Node(_) => None,
            ChangePath::Service(_, s)
            | ChangePath::DataType(_, s, _)
            | ChangePath::Channel(_, s, _, _) => Some(*s),
        }
    }

    pub fn data_type(&self) -> Option<&str> {
        match self {
            ChangePath::DataType(_, _, t) | ChangePath::Channel(_, _, t, _) => Some(t),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<u32> {
        match self {
            ChangePath::Channel(_, _, _, i) => Some(*i),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<ChangePath> {
        match self {
            ChangePath::Node(_) => None,
            ChangePath::Service(n, _) => Some(ChangePath::Node(*n)),
            ChangePath::DataType(n, s, _) => Some(ChangePath::Service(*n, *s)),
            ChangePath::Channel(n, s, t, _) => Some(ChangePath::DataType(*n, *s, t.clone())),
        }
    }

    /// Strict prefixes, nearest first.
    pub fn ancestors(&self) -> Vec<ChangePath> {
        let mut out = Vec::new();
        let mut cur = self.parent();
        while let Some(p) = cur {
            cur = p.parent();
            out.push(p);
        }
        out
    }

    pub fn is_strict_prefix_of(&self, other: &ChangePath) -> bool {
        other.ancestors().contains(self)
    }
}

impl fmt::Display for ChangePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangePath::Node(n) => write!(f, "({})", n),
            ChangePath::Service(n, s) => write!(f, "({}, {})", n, s),
            ChangePath::DataType(n, s, t) => write!(f, "({}, {}, {})", n, s, t),
            ChangePath::Channel(n, s, t, i) => write!(f, "({}, {}, {}, {})", n, s, t, i),
        }
    }
}

/// Set of changed paths where no member is a strict prefix of another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<ChangePath>);

impl ChangeSet {
    /// Reduce raw changed paths to the covering subset: a path is kept only when none
    /// of its ancestors is also in the input.
    pub fn minimal<I: IntoIterator<Item = ChangePath>>(paths: I) -> Self {
        let mut candidates: Vec<ChangePath> = paths.into_iter().collect();
        candidates.sort_by_key(ChangePath::depth);

        let mut accepted = BTreeSet::new();
        for path in candidates {
            if path.ancestors().iter().any(|a| accepted.contains(a)) {
                continue;
            }
            accepted.insert(path);
        }
        ChangeSet(accepted)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangePath> {
        self.0.iter()
    }

    pub fn contains(&self, path: &ChangePath) -> bool {
        self.0.contains(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node addresses touched by the set, ascending.
    pub fn nodes(&self) -> BTreeSet<u8> {
        self.0.iter().map(ChangePath::node).collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangePath;
    type IntoIter = std::collections::btree_set::Iter<'a, ChangePath>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
