use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{FormError, FormResult, ValidationError};
use crate::path::{Path, Segment};
use crate::schema::{Schema, SchemaError};
use crate::value::{Value, ValueKind};

use super::controller::{FormId, SubmitState};
use super::settle::SettleReport;

pub(super) struct NodeState {
    pub(super) kind: NodeKind,
    pub(super) touched: bool,
    pub(super) dirty: bool,
    pub(super) disabled: bool,
    pub(super) visible: bool,
    pub(super) validating: bool,
    pub(super) errors: Vec<ValidationError>,
    pub(super) ticket: u64,
}

pub(super) enum NodeKind {
    Field {
        value: Value,
        initial: Value,
        declared: ValueKind,
    },
    Group {
        children: BTreeMap<String, NodeState>,
    },
    Array {
        items: Vec<NodeState>,
        template: Schema,
    },
}

impl NodeState {
    pub(super) fn from_schema(schema: &Schema) -> Self {
        let kind = match schema {
            Schema::Field { initial } => NodeKind::Field {
                value: initial.clone(),
                initial: initial.clone(),
                declared: initial.kind(),
            },
            Schema::Group { children } => NodeKind::Group {
                children: children
                    .iter()
                    .map(|(key, child)| (key.clone(), NodeState::from_schema(child)))
                    .collect(),
            },
            Schema::Array { template } => NodeKind::Array {
                items: Vec::new(),
                template: (**template).clone(),
            },
        };
        NodeState {
            kind,
            touched: false,
            dirty: false,
            disabled: false,
            visible: true,
            validating: false,
            errors: Vec::new(),
            ticket: 0,
        }
    }

    pub(super) fn value(&self) -> Value {
        match &self.kind {
            NodeKind::Field { value, .. } => value.clone(),
            NodeKind::Group { children } => Value::Record(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.value()))
                    .collect(),
            ),
            NodeKind::Array { items, .. } => {
                Value::List(items.iter().map(NodeState::value).collect())
            }
        }
    }

    /// Value handed to submit handlers: disabled subtrees are dropped.
    pub(super) fn submit_value(&self) -> Option<Value> {
        if self.disabled {
            return None;
        }
        Some(match &self.kind {
            NodeKind::Field { value, .. } => value.clone(),
            NodeKind::Group { children } => Value::Record(
                children
                    .iter()
                    .filter_map(|(key, child)| {
                        child.submit_value().map(|value| (key.clone(), value))
                    })
                    .collect(),
            ),
            NodeKind::Array { items, .. } => {
                Value::List(items.iter().filter_map(NodeState::submit_value).collect())
            }
        })
    }

    pub(super) fn is_dirty(&self) -> bool {
        if self.dirty {
            return true;
        }
        match &self.kind {
            NodeKind::Field { .. } => false,
            NodeKind::Group { children } => children.values().any(NodeState::is_dirty),
            NodeKind::Array { items, .. } => items.iter().any(NodeState::is_dirty),
        }
    }

    /// Hidden and disabled subtrees are excluded from aggregate validity;
    /// their stored errors are retained but do not count.
    pub(super) fn is_valid(&self) -> bool {
        if self.disabled || !self.visible {
            return true;
        }
        if !self.errors.is_empty() {
            return false;
        }
        match &self.kind {
            NodeKind::Field { .. } => true,
            NodeKind::Group { children } => children.values().all(NodeState::is_valid),
            NodeKind::Array { items, .. } => items.iter().all(NodeState::is_valid),
        }
    }

    pub(super) fn collect_errors(
        &self,
        at: Path,
        out: &mut BTreeMap<Path, Vec<ValidationError>>,
    ) {
        if self.disabled || !self.visible {
            return;
        }
        if !self.errors.is_empty() {
            out.insert(at.clone(), self.errors.clone());
        }
        match &self.kind {
            NodeKind::Field { .. } => {}
            NodeKind::Group { children } => {
                for (key, child) in children {
                    child.collect_errors(at.clone().key(key.clone()), out);
                }
            }
            NodeKind::Array { items, .. } => {
                for (index, item) in items.iter().enumerate() {
                    item.collect_errors(at.clone().index(index), out);
                }
            }
        }
    }

    pub(super) fn mark_all_touched(&mut self, at: Path, out: &mut BTreeSet<Path>) {
        if !self.touched {
            self.touched = true;
            out.insert(at.clone());
        }
        match &mut self.kind {
            NodeKind::Field { .. } => {}
            NodeKind::Group { children } => {
                for (key, child) in children {
                    child.mark_all_touched(at.clone().key(key.clone()), out);
                }
            }
            NodeKind::Array { items, .. } => {
                for (index, item) in items.iter_mut().enumerate() {
                    item.mark_all_touched(at.clone().index(index), out);
                }
            }
        }
    }

    pub(super) fn clear_all_errors(&mut self, at: Path, out: &mut BTreeSet<Path>) {
        if !self.errors.is_empty() || self.validating {
            self.errors.clear();
            self.validating = false;
            out.insert(at.clone());
        }
        match &mut self.kind {
            NodeKind::Field { .. } => {}
            NodeKind::Group { children } => {
                for (key, child) in children {
                    child.clear_all_errors(at.clone().key(key.clone()), out);
                }
            }
            NodeKind::Array { items, .. } => {
                for (index, item) in items.iter_mut().enumerate() {
                    item.clear_all_errors(at.clone().index(index), out);
                }
            }
        }
    }

    pub(super) fn all_paths(&self, at: Path, out: &mut BTreeSet<Path>) {
        out.insert(at.clone());
        match &self.kind {
            NodeKind::Field { .. } => {}
            NodeKind::Group { children } => {
                for (key, child) in children {
                    child.all_paths(at.clone().key(key.clone()), out);
                }
            }
            NodeKind::Array { items, .. } => {
                for (index, item) in items.iter().enumerate() {
                    item.all_paths(at.clone().index(index), out);
                }
            }
        }
    }

    fn child(&self, segment: &Segment, full: &Path) -> FormResult<&NodeState> {
        match (&self.kind, segment) {
            (NodeKind::Group { children }, Segment::Key(key)) => {
                children.get(key).ok_or_else(|| FormError::UnknownPath {
                    path: full.clone(),
                })
            }
            (NodeKind::Array { items, .. }, Segment::Index(index)) => {
                items.get(*index).ok_or_else(|| FormError::UnknownPath {
                    path: full.clone(),
                })
            }
            (_, Segment::Wildcard) => Err(FormError::WildcardPath { path: full.clone() }),
            _ => Err(FormError::UnknownPath { path: full.clone() }),
        }
    }

    fn child_mut(&mut self, segment: &Segment, full: &Path) -> FormResult<&mut NodeState> {
        match (&mut self.kind, segment) {
            (NodeKind::Group { children }, Segment::Key(key)) => {
                children.get_mut(key).ok_or_else(|| FormError::UnknownPath {
                    path: full.clone(),
                })
            }
            (NodeKind::Array { items, .. }, Segment::Index(index)) => {
                items.get_mut(*index).ok_or_else(|| FormError::UnknownPath {
                    path: full.clone(),
                })
            }
            (_, Segment::Wildcard) => Err(FormError::WildcardPath { path: full.clone() }),
            _ => Err(FormError::UnknownPath { path: full.clone() }),
        }
    }
}

/// Writes a value into a subtree. Group writes are partial (only the named
/// children change); array writes replace the whole element list, rebuilt
/// from the template. External writes update dirty tracking and bump the
/// per-node ticket so in-flight async validations are superseded; computed
/// writes leave both alone.
pub(super) fn write_value(
    node: &mut NodeState,
    value: Value,
    at: &Path,
    external: bool,
) -> FormResult<bool> {
    let mut new_dirty = None;
    let changed = match &mut node.kind {
        NodeKind::Field {
            value: current,
            initial,
            declared,
        } => {
            if !value.fits(*declared) {
                return Err(FormError::TypeMismatch {
                    path: at.clone(),
                    expected: *declared,
                    found: value.kind(),
                });
            }
            if *current == value {
                false
            } else {
                *current = value;
                if external {
                    new_dirty = Some(*current != *initial);
                }
                true
            }
        }
        NodeKind::Group { children } => {
            let Value::Record(entries) = value else {
                return Err(FormError::TypeMismatch {
                    path: at.clone(),
                    expected: ValueKind::Record,
                    found: value.kind(),
                });
            };
            let mut any = false;
            for (key, child_value) in entries {
                let child_path = at.clone().key(key.clone());
                let Some(child) = children.get_mut(&key) else {
                    return Err(FormError::UnknownPath { path: child_path });
                };
                any |= write_value(child, child_value, &child_path, external)?;
            }
            any
        }
        NodeKind::Array { items, template } => {
            let Value::List(values) = value else {
                return Err(FormError::TypeMismatch {
                    path: at.clone(),
                    expected: ValueKind::List,
                    found: value.kind(),
                });
            };
            let current = Value::List(items.iter().map(NodeState::value).collect());
            if current == Value::List(values.clone()) {
                false
            } else {
                let template = template.clone();
                let mut next = Vec::with_capacity(values.len());
                for (index, item_value) in values.into_iter().enumerate() {
                    let mut item = NodeState::from_schema(&template);
                    write_value(&mut item, item_value, &at.clone().index(index), external)?;
                    next.push(item);
                }
                *items = next;
                if external {
                    new_dirty = Some(true);
                }
                true
            }
        }
    };
    if changed {
        if external {
            node.ticket = node.ticket.wrapping_add(1);
        }
        if let Some(dirty) = new_dirty {
            node.dirty = dirty;
        }
    }
    Ok(changed)
}

/// Merges a caller-supplied initial value onto a freshly instantiated tree,
/// recording it as the baseline for dirty tracking.
pub(super) fn apply_initial(
    node: &mut NodeState,
    value: Value,
    at: &Path,
) -> Result<(), SchemaError> {
    match &mut node.kind {
        NodeKind::Field {
            value: current,
            initial,
            declared,
        } => {
            if !value.fits(*declared) {
                return Err(SchemaError::InitialShape {
                    path: at.clone(),
                    expected: *declared,
                    found: value.kind(),
                });
            }
            *current = value.clone();
            *initial = value;
            Ok(())
        }
        NodeKind::Group { children } => {
            let Value::Record(entries) = value else {
                return Err(SchemaError::InitialShape {
                    path: at.clone(),
                    expected: ValueKind::Record,
                    found: value.kind(),
                });
            };
            for (key, child_value) in entries {
                let Some(child) = children.get_mut(&key) else {
                    return Err(SchemaError::UnknownField {
                        path: at.clone(),
                        key,
                    });
                };
                let child_path = at.clone().key(key);
                apply_initial(child, child_value, &child_path)?;
            }
            Ok(())
        }
        NodeKind::Array { items, template } => {
            let Value::List(values) = value else {
                return Err(SchemaError::InitialShape {
                    path: at.clone(),
                    expected: ValueKind::List,
                    found: value.kind(),
                });
            };
            let template = template.clone();
            let mut next = Vec::with_capacity(values.len());
            for (index, item_value) in values.into_iter().enumerate() {
                let mut item = NodeState::from_schema(&template);
                apply_initial(&mut item, item_value, &at.clone().index(index))?;
                next.push(item);
            }
            *items = next;
            Ok(())
        }
    }
}

/// A queued external mutation. Mutations arriving while a settle pass is in
/// flight are parked on the tree and drained afterwards, strictly in order.
pub(super) enum Mutation {
    Set { path: Path, value: Value },
    Touch { path: Path },
    TouchAll,
    Push { path: Path, initial: Option<Value> },
    InsertAt {
        path: Path,
        index: usize,
        initial: Option<Value>,
    },
    RemoveAt { path: Path, index: usize },
    ClearItems { path: Path },
    SetErrors {
        path: Path,
        errors: Vec<ValidationError>,
    },
    ClearErrors { path: Path },
    ClearAllErrors,
    ResetField { path: Path },
    Reset,
}

pub(super) struct TreeState {
    pub(super) id: FormId,
    pub(super) schema: Schema,
    pub(super) initial: Option<Value>,
    pub(super) root: NodeState,
    pub(super) submit_state: SubmitState,
    pub(super) submit_count: u32,
    pub(super) settling: bool,
    pub(super) pending: VecDeque<Mutation>,
}

impl TreeState {
    pub(super) fn node(&self, path: &Path) -> FormResult<&NodeState> {
        let mut current = &self.root;
        for segment in path.segments() {
            current = current.child(segment, path)?;
        }
        Ok(current)
    }

    pub(super) fn node_mut(&mut self, path: &Path) -> FormResult<&mut NodeState> {
        let mut current = &mut self.root;
        for segment in path.segments() {
            current = current.child_mut(segment, path)?;
        }
        Ok(current)
    }

    /// Concrete paths currently instantiated for a (possibly wildcard)
    /// pattern. An empty array yields no expansions for its elements.
    pub(super) fn expand(&self, pattern: &Path) -> Vec<Path> {
        fn walk(node: &NodeState, segments: &[Segment], at: Path, out: &mut Vec<Path>) {
            let Some((segment, rest)) = segments.split_first() else {
                out.push(at);
                return;
            };
            match (&node.kind, segment) {
                (NodeKind::Group { children }, Segment::Key(key)) => {
                    if let Some(child) = children.get(key) {
                        walk(child, rest, at.key(key.clone()), out);
                    }
                }
                (NodeKind::Array { items, .. }, Segment::Index(index)) => {
                    if let Some(item) = items.get(*index) {
                        walk(item, rest, at.index(*index), out);
                    }
                }
                (NodeKind::Array { items, .. }, Segment::Wildcard) => {
                    for (index, item) in items.iter().enumerate() {
                        walk(item, rest, at.clone().index(index), out);
                    }
                }
                _ => {}
            }
        }

        let mut out = Vec::new();
        walk(&self.root, pattern.segments(), Path::root(), &mut out);
        out
    }

    /// True when the node or any of its ancestors is hidden or disabled,
    /// which excludes it from validator execution.
    pub(super) fn suppressed(&self, path: &Path) -> bool {
        let mut current = &self.root;
        if current.disabled || !current.visible {
            return true;
        }
        for segment in path.segments() {
            current = match current.child(segment, path) {
                Ok(child) => child,
                Err(_) => return true,
            };
            if current.disabled || !current.visible {
                return true;
            }
        }
        false
    }

    pub(super) fn perform(&mut self, mutation: Mutation) -> FormResult<Option<SettleReport>> {
        match mutation {
            Mutation::Set { path, value } => {
                if !path.is_concrete() {
                    return Err(FormError::WildcardPath { path });
                }
                let node = self.node_mut(&path)?;
                let changed = write_value(node, value, &path, true)?;
                Ok(changed.then(|| SettleReport::mutated(path)))
            }
            Mutation::Touch { path } => {
                let node = self.node_mut(&path)?;
                if node.touched {
                    return Ok(None);
                }
                node.touched = true;
                Ok(Some(SettleReport {
                    flagged: BTreeSet::from([path]),
                    ..SettleReport::default()
                }))
            }
            Mutation::TouchAll => {
                let mut flagged = BTreeSet::new();
                self.root.mark_all_touched(Path::root(), &mut flagged);
                if flagged.is_empty() {
                    return Ok(None);
                }
                Ok(Some(SettleReport {
                    flagged,
                    ..SettleReport::default()
                }))
            }
            Mutation::Push { path, initial } => {
                let node = self.node_mut(&path)?;
                {
                    let NodeKind::Array { items, template } = &mut node.kind else {
                        return Err(FormError::NotAnArray { path });
                    };
                    let template = template.clone();
                    let index = items.len();
                    let mut item = NodeState::from_schema(&template);
                    if let Some(value) = initial {
                        write_value(&mut item, value, &path.clone().index(index), true)?;
                    }
                    items.push(item);
                }
                node.dirty = true;
                Ok(Some(SettleReport::mutated(path)))
            }
            Mutation::InsertAt {
                path,
                index,
                initial,
            } => {
                let node = self.node_mut(&path)?;
                {
                    let NodeKind::Array { items, template } = &mut node.kind else {
                        return Err(FormError::NotAnArray { path });
                    };
                    if index > items.len() {
                        return Err(FormError::IndexOutOfBounds {
                            len: items.len(),
                            path,
                            index,
                        });
                    }
                    let template = template.clone();
                    let mut item = NodeState::from_schema(&template);
                    if let Some(value) = initial {
                        write_value(&mut item, value, &path.clone().index(index), true)?;
                    }
                    items.insert(index, item);
                }
                node.dirty = true;
                Ok(Some(SettleReport::mutated(path)))
            }
            Mutation::RemoveAt { path, index } => {
                let node = self.node_mut(&path)?;
                {
                    let NodeKind::Array { items, .. } = &mut node.kind else {
                        return Err(FormError::NotAnArray { path });
                    };
                    if index >= items.len() {
                        return Err(FormError::IndexOutOfBounds {
                            len: items.len(),
                            path,
                            index,
                        });
                    }
                    items.remove(index);
                }
                node.dirty = true;
                Ok(Some(SettleReport::mutated(path)))
            }
            Mutation::ClearItems { path } => {
                let node = self.node_mut(&path)?;
                {
                    let NodeKind::Array { items, .. } = &mut node.kind else {
                        return Err(FormError::NotAnArray { path });
                    };
                    if items.is_empty() {
                        return Ok(None);
                    }
                    items.clear();
                }
                node.dirty = true;
                Ok(Some(SettleReport::mutated(path)))
            }
            Mutation::SetErrors { path, errors } => {
                let node = self.node_mut(&path)?;
                if node.errors == errors {
                    return Ok(None);
                }
                node.errors = errors;
                Ok(Some(SettleReport {
                    errored: BTreeSet::from([path]),
                    ..SettleReport::default()
                }))
            }
            Mutation::ClearErrors { path } => {
                let node = self.node_mut(&path)?;
                if node.errors.is_empty() && !node.validating {
                    return Ok(None);
                }
                node.errors.clear();
                node.validating = false;
                Ok(Some(SettleReport {
                    errored: BTreeSet::from([path]),
                    ..SettleReport::default()
                }))
            }
            Mutation::ClearAllErrors => {
                let mut errored = BTreeSet::new();
                self.root.clear_all_errors(Path::root(), &mut errored);
                if errored.is_empty() {
                    return Ok(None);
                }
                Ok(Some(SettleReport {
                    errored,
                    ..SettleReport::default()
                }))
            }
            Mutation::ResetField { path } => {
                let node = self.node_mut(&path)?;
                let NodeKind::Field { value, initial, .. } = &mut node.kind else {
                    return Err(FormError::UnknownPath { path });
                };
                let changed = *value != *initial;
                *value = initial.clone();
                node.dirty = false;
                node.touched = false;
                node.validating = false;
                node.errors.clear();
                node.ticket = node.ticket.wrapping_add(1);
                Ok(Some(SettleReport {
                    mutated: if changed { vec![path.clone()] } else { Vec::new() },
                    flagged: BTreeSet::from([path.clone()]),
                    errored: BTreeSet::from([path]),
                    skip_validation: true,
                    ..SettleReport::default()
                }))
            }
            Mutation::Reset => {
                let mut root = NodeState::from_schema(&self.schema);
                if let Some(initial) = self.initial.clone() {
                    // The override was validated at construction time.
                    if apply_initial(&mut root, initial, &Path::root()).is_err() {
                        return Err(FormError::UnknownPath { path: Path::root() });
                    }
                }
                self.root = root;
                self.submit_state = SubmitState::Idle;
                let mut flagged = BTreeSet::new();
                self.root.all_paths(Path::root(), &mut flagged);
                Ok(Some(SettleReport {
                    mutated: vec![Path::root()],
                    flagged,
                    skip_validation: true,
                    ..SettleReport::default()
                }))
            }
        }
    }
}
