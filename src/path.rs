use std::fmt::{Display, Formatter};

/// One step in a structural address: an object key, an array index, or the
/// wildcard selecting every element of an array.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Immutable structural address of a node in a form tree.
///
/// Built with [`Path::root`] and the `key`/`index`/`each` builders. A path
/// containing a wildcard segment addresses every element of an array node;
/// registration APIs accept wildcard paths, direct reads and writes do not.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.segments.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(Segment::Index(index));
        self
    }

    /// Appends the wildcard segment addressing every element of an array.
    pub fn each(mut self) -> Self {
        self.segments.push(Segment::Wildcard);
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_concrete(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|segment| matches!(segment, Segment::Wildcard))
    }

    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether a write at one path can change the value observed at the
    /// other: true when either path is a (wildcard-aware) prefix of the
    /// other. A parent's assembled value contains its descendants, and a
    /// parent write rewrites its descendants, so the relation is symmetric.
    pub fn touches(&self, other: &Path) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| segments_compatible(a, b))
    }

    /// Whether this (possibly wildcard) pattern addresses exactly the given
    /// concrete path.
    pub fn matches(&self, concrete: &Path) -> bool {
        self.segments.len() == concrete.segments.len() && self.touches(concrete)
    }

    /// Collects the array indices a concrete path supplies for this
    /// pattern's wildcard positions, in order, over the shared prefix.
    pub fn bind(&self, concrete: &Path) -> Vec<usize> {
        self.segments
            .iter()
            .zip(concrete.segments.iter())
            .filter_map(|(pattern, actual)| match (pattern, actual) {
                (Segment::Wildcard, Segment::Index(index)) => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Replaces leading wildcard segments with the given indices, in order.
    /// Wildcards beyond the supplied bindings are kept.
    pub fn substitute(&self, bindings: &[usize]) -> Path {
        let mut bindings = bindings.iter();
        Path {
            segments: self
                .segments
                .iter()
                .map(|segment| match segment {
                    Segment::Wildcard => match bindings.next() {
                        Some(index) => Segment::Index(*index),
                        None => Segment::Wildcard,
                    },
                    other => other.clone(),
                })
                .collect(),
        }
    }
}

fn segments_compatible(a: &Segment, b: &Segment) -> bool {
    match (a, b) {
        (Segment::Key(left), Segment::Key(right)) => left == right,
        (Segment::Index(left), Segment::Index(right)) => left == right,
        (Segment::Wildcard, Segment::Index(_) | Segment::Wildcard) => true,
        (Segment::Index(_), Segment::Wildcard) => true,
        _ => false,
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("$");
        }
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
                Segment::Wildcard => f.write_str("[*]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_ordered_segments() {
        let path = Path::root().key("debts").index(2).key("amount");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("debts".into()),
                Segment::Index(2),
                Segment::Key("amount".into()),
            ]
        );
        assert_eq!(path.to_string(), "debts[2].amount");
        assert_eq!(Path::root().to_string(), "$");
    }

    #[test]
    fn touches_is_prefix_based_in_both_directions() {
        let leaf = Path::root().key("applicant").key("email");
        let group = Path::root().key("applicant");
        let other = Path::root().key("qty");

        assert!(leaf.touches(&group));
        assert!(group.touches(&leaf));
        assert!(!leaf.touches(&other));
        assert!(Path::root().touches(&leaf));
    }

    #[test]
    fn wildcard_matches_any_index() {
        let pattern = Path::root().key("debts").each().key("amount");
        let concrete = Path::root().key("debts").index(1).key("amount");

        assert!(pattern.matches(&concrete));
        assert!(pattern.touches(&Path::root().key("debts")));
        assert!(!pattern.matches(&Path::root().key("debts").index(1)));
        assert_eq!(pattern.bind(&concrete), vec![1]);
        assert_eq!(pattern.substitute(&[1]), concrete);
    }

    #[test]
    fn substitute_keeps_unbound_wildcards() {
        let pattern = Path::root().key("debts").each().key("amount");
        assert_eq!(pattern.substitute(&[]), pattern);
    }
}
