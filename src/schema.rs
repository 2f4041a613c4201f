use thiserror::Error;

use crate::path::Path;
use crate::value::{Value, ValueKind};

/// Declarative shape of a form tree: leaves carry an initial value, groups
/// nest named children, arrays carry one element template and start empty.
#[derive(Clone, Debug, PartialEq)]
pub enum Schema {
    Field { initial: Value },
    Group { children: Vec<(String, Schema)> },
    Array { template: Box<Schema> },
}

impl Schema {
    pub fn field(initial: impl Into<Value>) -> Self {
        Schema::Field {
            initial: initial.into(),
        }
    }

    pub fn group<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Schema)>,
    {
        Schema::Group {
            children: children
                .into_iter()
                .map(|(key, schema)| (key.into(), schema))
                .collect(),
        }
    }

    pub fn array(template: Schema) -> Self {
        Schema::Array {
            template: Box::new(template),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Schema::Field { .. } => Ok(()),
            Schema::Group { children } => {
                let mut seen = std::collections::BTreeSet::new();
                for (key, child) in children {
                    if key.is_empty() || key.contains(['.', '[', ']', '*']) {
                        return Err(SchemaError::InvalidKey { key: key.clone() });
                    }
                    if !seen.insert(key.as_str()) {
                        return Err(SchemaError::DuplicateKey { key: key.clone() });
                    }
                    child.validate()?;
                }
                Ok(())
            }
            Schema::Array { template } => template.validate(),
        }
    }

    /// Whether the given (possibly wildcard) path addresses a position that
    /// exists in this shape, regardless of how many array elements are
    /// currently instantiated.
    pub(crate) fn contains(&self, path: &Path) -> bool {
        use crate::path::Segment;

        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (Schema::Group { children }, Segment::Key(key)) => {
                    match children.iter().find(|(name, _)| name == key) {
                        Some((_, child)) => child,
                        None => return false,
                    }
                }
                (Schema::Array { template }, Segment::Index(_) | Segment::Wildcard) => template,
                _ => return false,
            };
        }
        true
    }
}

/// Malformed schema or initial-value shape, surfaced synchronously at tree
/// construction and never through the node error model.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SchemaError {
    #[error("duplicate key `{key}` in group")]
    DuplicateKey { key: String },
    #[error("invalid key `{key}`: group keys must be non-empty and free of `.`, `[`, `]`, `*`")]
    InvalidKey { key: String },
    #[error("initial value at {path} does not fit the schema: expected {expected}, got {found}")]
    InitialShape {
        path: Path,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("initial value names unknown field `{key}` under {path}")]
    UnknownField { path: Path, key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_group_keys_are_rejected() {
        let schema = Schema::group([
            ("email", Schema::field("")),
            ("email", Schema::field("")),
        ]);
        assert_eq!(
            schema.validate(),
            Err(SchemaError::DuplicateKey {
                key: "email".into()
            })
        );
    }

    #[test]
    fn keys_with_path_syntax_are_rejected() {
        let schema = Schema::group([("a.b", Schema::field(""))]);
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::InvalidKey { .. })
        ));
    }

    #[test]
    fn contains_follows_wildcards_through_array_templates() {
        let schema = Schema::group([(
            "debts",
            Schema::array(Schema::group([("amount", Schema::field(0))])),
        )]);
        assert!(schema.contains(&Path::root().key("debts").each().key("amount")));
        assert!(schema.contains(&Path::root().key("debts").index(7).key("amount")));
        assert!(!schema.contains(&Path::root().key("debts").each().key("holder")));
        assert!(!schema.contains(&Path::root().key("missing")));
    }
}
