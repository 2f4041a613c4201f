use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;

use crate::form::SubmitState;
use crate::path::Path;
use crate::value::ValueKind;

/// The normal outcome of a failing validator. Stored on the node that was
/// validated, never raised as an `Err`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Engine-internal failures: configuration and usage mistakes that must be
/// loud, as opposed to validation failures that live on nodes.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FormError {
    #[error("form state lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("no node exists at {path}")]
    UnknownPath { path: Path },
    #[error("{path} contains a wildcard segment and cannot address a single node")]
    WildcardPath { path: Path },
    #[error("node at {path} is not an array")]
    NotAnArray { path: Path },
    #[error("index {index} is out of bounds for array at {path} (length {len})")]
    IndexOutOfBounds {
        path: Path,
        index: usize,
        len: usize,
    },
    #[error("cannot write a {found} value to {path}: the node is declared {expected}")]
    TypeMismatch {
        path: Path,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("computed-field dependency cycle: {}", join_paths(.cycle))]
    DependencyCycle { cycle: Vec<Path> },
    #[error("validator for {path} panicked: {message}")]
    ValidatorImplementation { path: Path, message: String },
    #[error("invalid submit state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    #[error("form submit is already in progress")]
    AlreadySubmitting,
}

pub type FormResult<T> = Result<T, FormError>;

fn join_paths(paths: &[Path]) -> String {
    paths
        .iter()
        .map(Path::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Aggregated per-node errors reported when a submit attempt fails
/// validation. Only visible, enabled nodes contribute entries.
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
#[error("form validation failed: {} node(s) carry errors", .errors.len())]
pub struct ValidationFailed {
    pub errors: BTreeMap<Path, Vec<ValidationError>>,
}

/// Outcome of [`crate::Form::submit`]: the handler is only reached when the
/// whole tree validates, and its error is propagated unchanged.
#[derive(Debug, Error)]
pub enum SubmitError<E> {
    #[error(transparent)]
    Rejected(#[from] ValidationFailed),
    #[error("submit handler failed")]
    Handler(E),
    #[error(transparent)]
    Form(#[from] FormError),
}
