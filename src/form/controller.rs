use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{FormError, FormResult, SubmitError, ValidationError, ValidationFailed};
use crate::path::Path;
use crate::schema::{Schema, SchemaError};
use crate::value::Value;

use super::behavior::{ComputedReg, FlagReg, RevalidateReg, WatcherReg};
use super::subscription::{SubscriberMap, Subscription};
use super::tree::{self, Mutation, NodeKind, NodeState, TreeState};
use super::validation::{AsyncReg, SyncReg};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(pub u64);

impl FormId {
    pub fn next() -> Self {
        Self(FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

/// Point-in-time view of one node, as delivered to subscribers after a
/// settle pass and returned by [`Form::node`].
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSnapshot {
    pub path: Path,
    pub value: Value,
    pub touched: bool,
    pub dirty: bool,
    pub disabled: bool,
    pub visible: bool,
    pub validating: bool,
    pub errors: Vec<ValidationError>,
}

/// A form instance: exclusive owner of one node tree plus the computed,
/// behavior, and validator registrations made against it. Cloning yields
/// another handle to the same instance.
#[derive(Clone)]
pub struct Form {
    pub(super) state: Arc<RwLock<TreeState>>,
    pub(super) computed: Arc<RwLock<Vec<ComputedReg>>>,
    pub(super) flags: Arc<RwLock<Vec<FlagReg>>>,
    pub(super) watchers: Arc<RwLock<Vec<WatcherReg>>>,
    pub(super) sync_validators: Arc<RwLock<Vec<SyncReg>>>,
    pub(super) async_validators: Arc<RwLock<Vec<AsyncReg>>>,
    pub(super) revalidations: Arc<RwLock<Vec<RevalidateReg>>>,
    pub(super) subscribers: Arc<RwLock<SubscriberMap>>,
}

pub(super) enum Applied {
    Done,
    Deferred,
}

impl std::fmt::Debug for Form {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Form").finish_non_exhaustive()
    }
}

impl Form {
    pub fn new(schema: Schema) -> Result<Self, SchemaError> {
        schema.validate()?;
        let root = NodeState::from_schema(&schema);
        Ok(Self::from_parts(schema, None, root))
    }

    /// Builds the tree and merges a caller-supplied initial value onto it,
    /// shape-checked against the schema.
    pub fn with_initial(schema: Schema, initial: Value) -> Result<Self, SchemaError> {
        schema.validate()?;
        let mut root = NodeState::from_schema(&schema);
        tree::apply_initial(&mut root, initial.clone(), &Path::root())?;
        Ok(Self::from_parts(schema, Some(initial), root))
    }

    fn from_parts(schema: Schema, initial: Option<Value>, root: NodeState) -> Self {
        Self {
            state: Arc::new(RwLock::new(TreeState {
                id: FormId::next(),
                schema,
                initial,
                root,
                submit_state: SubmitState::Idle,
                submit_count: 0,
                settling: false,
                pending: VecDeque::new(),
            })),
            computed: Arc::new(RwLock::new(Vec::new())),
            flags: Arc::new(RwLock::new(Vec::new())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            sync_validators: Arc::new(RwLock::new(Vec::new())),
            async_validators: Arc::new(RwLock::new(Vec::new())),
            revalidations: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(RwLock::new(SubscriberMap::default())),
        }
    }

    pub fn id(&self) -> FormResult<FormId> {
        Ok(read_lock(&self.state, "reading form id")?.id)
    }

    pub fn set_value(&self, path: &Path, value: impl Into<Value>) -> FormResult<()> {
        self.apply(Mutation::Set {
            path: path.clone(),
            value: value.into(),
        })
    }

    pub fn mark_as_touched(&self, path: &Path) -> FormResult<()> {
        self.apply(Mutation::Touch { path: path.clone() })
    }

    pub fn mark_all_as_touched(&self) -> FormResult<()> {
        self.apply(Mutation::TouchAll)
    }

    pub fn push(&self, path: &Path, initial: Option<Value>) -> FormResult<()> {
        self.apply(Mutation::Push {
            path: path.clone(),
            initial,
        })
    }

    pub fn insert_at(&self, path: &Path, index: usize, initial: Option<Value>) -> FormResult<()> {
        self.apply(Mutation::InsertAt {
            path: path.clone(),
            index,
            initial,
        })
    }

    pub fn remove_at(&self, path: &Path, index: usize) -> FormResult<()> {
        self.apply(Mutation::RemoveAt {
            path: path.clone(),
            index,
        })
    }

    pub fn clear(&self, path: &Path) -> FormResult<()> {
        self.apply(Mutation::ClearItems { path: path.clone() })
    }

    /// Injects externally produced errors (typically mapped from a failed
    /// server submission) onto a node. They live in the same collection as
    /// validator results and clear the same way.
    pub fn set_errors(&self, path: &Path, errors: Vec<ValidationError>) -> FormResult<()> {
        self.apply(Mutation::SetErrors {
            path: path.clone(),
            errors,
        })
    }

    pub fn clear_errors(&self, path: &Path) -> FormResult<()> {
        self.apply(Mutation::ClearErrors { path: path.clone() })
    }

    pub fn clear_all_errors(&self) -> FormResult<()> {
        self.apply(Mutation::ClearAllErrors)
    }

    pub fn reset_field(&self, path: &Path) -> FormResult<()> {
        self.apply(Mutation::ResetField { path: path.clone() })
    }

    pub fn reset_to_initial(&self) -> FormResult<()> {
        self.apply(Mutation::Reset)
    }

    pub fn value(&self) -> FormResult<Value> {
        Ok(read_lock(&self.state, "reading the form value")?.root.value())
    }

    /// The value handed to submit handlers: disabled subtrees excluded.
    pub fn submit_value(&self) -> FormResult<Value> {
        Ok(read_lock(&self.state, "reading the submit value")?
            .root
            .submit_value()
            .unwrap_or(Value::Null))
    }

    pub fn value_at(&self, path: &Path) -> FormResult<Value> {
        let state = read_lock(&self.state, "reading a node value")?;
        Ok(state.node(path)?.value())
    }

    pub fn node(&self, path: &Path) -> FormResult<NodeSnapshot> {
        let state = read_lock(&self.state, "reading a node snapshot")?;
        let node = state.node(path)?;
        Ok(NodeSnapshot {
            path: path.clone(),
            value: node.value(),
            touched: node.touched,
            dirty: node.is_dirty(),
            disabled: node.disabled,
            visible: node.visible,
            validating: node.validating,
            errors: node.errors.clone(),
        })
    }

    pub fn len(&self, path: &Path) -> FormResult<usize> {
        let state = read_lock(&self.state, "reading an array length")?;
        match &state.node(path)?.kind {
            NodeKind::Array { items, .. } => Ok(items.len()),
            _ => Err(FormError::NotAnArray { path: path.clone() }),
        }
    }

    pub fn is_valid(&self) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading form validity")?.root.is_valid())
    }

    pub fn is_dirty(&self) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading form dirtiness")?
            .root
            .is_dirty())
    }

    /// Per-node errors of visible, enabled nodes, keyed by path.
    pub fn error_map(&self) -> FormResult<BTreeMap<Path, Vec<ValidationError>>> {
        let state = read_lock(&self.state, "collecting the error map")?;
        let mut out = BTreeMap::new();
        state.root.collect_errors(Path::root(), &mut out);
        Ok(out)
    }

    pub fn submit_state(&self) -> FormResult<SubmitState> {
        Ok(read_lock(&self.state, "reading submit state")?.submit_state)
    }

    pub fn submit_count(&self) -> FormResult<u32> {
        Ok(read_lock(&self.state, "reading submit count")?.submit_count)
    }

    pub fn subscribe(
        &self,
        path: &Path,
        callback: impl Fn(&NodeSnapshot) + Send + Sync + 'static,
    ) -> FormResult<Subscription> {
        if !path.is_concrete() {
            return Err(FormError::WildcardPath { path: path.clone() });
        }
        {
            let state = read_lock(&self.state, "checking a subscription path")?;
            state.node(path)?;
        }
        let mut subscribers = write_lock(&self.subscribers, "registering a subscriber")?;
        let id = subscribers.insert(path.clone(), Arc::new(callback));
        Ok(Subscription {
            path: path.clone(),
            id,
            registry: Arc::downgrade(&self.subscribers),
        })
    }

    /// Marks everything touched, validates the whole tree (sync and async),
    /// and only then hands the submit value to the handler. An invalid tree
    /// rejects with the aggregated error map without calling the handler;
    /// the handler's own result or error is propagated unchanged.
    pub async fn submit<R, E, F, Fut>(&self, handler: F) -> Result<R, SubmitError<E>>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        {
            let mut state = write_lock(&self.state, "preparing submit")?;
            if state.submit_state == SubmitState::Submitting {
                return Err(SubmitError::Form(FormError::AlreadySubmitting));
            }
            transition_submit_state(&mut state, SubmitState::Validating)?;
            state.submit_count = state.submit_count.saturating_add(1);
        }

        self.mark_all_as_touched()?;
        let is_valid = self.validate_all().await?;
        if !is_valid {
            let errors = self.error_map()?;
            let mut state = write_lock(&self.state, "recording submit rejection")?;
            transition_submit_state(&mut state, SubmitState::Failed)?;
            return Err(SubmitError::Rejected(ValidationFailed { errors }));
        }

        let payload = {
            let mut state = write_lock(&self.state, "moving submit to submitting")?;
            transition_submit_state(&mut state, SubmitState::Submitting)?;
            state.root.submit_value().unwrap_or(Value::Null)
        };
        let outcome = handler(payload).await;

        let mut state = write_lock(&self.state, "completing submit")?;
        match outcome {
            Ok(result) => {
                transition_submit_state(&mut state, SubmitState::Succeeded)?;
                Ok(result)
            }
            Err(error) => {
                transition_submit_state(&mut state, SubmitState::Failed)?;
                Err(SubmitError::Handler(error))
            }
        }
    }

    pub(super) fn apply(&self, mutation: Mutation) -> FormResult<()> {
        let own = self.apply_one(mutation);
        if !matches!(own, Ok(Applied::Deferred)) {
            self.drain_pending();
        }
        own.map(|_| ())
    }

    fn apply_one(&self, mutation: Mutation) -> FormResult<Applied> {
        let seed = {
            let mut state = write_lock(&self.state, "applying a mutation")?;
            if state.settling {
                state.pending.push_back(mutation);
                tracing::debug!("mutation queued behind an active settle pass");
                return Ok(Applied::Deferred);
            }
            match state.perform(mutation)? {
                Some(seed) => {
                    state.settling = true;
                    seed
                }
                None => return Ok(Applied::Done),
            }
        };
        let settled = self.run_settle(seed);
        {
            let mut state = write_lock(&self.state, "finishing a settle pass")?;
            state.settling = false;
        }
        settled.map(|_| Applied::Done)
    }

    /// Runs one registration-time settle pass unless a pass is already in
    /// flight, in which case the active pass owns the tree.
    pub(super) fn settle_from(&self, seed: super::settle::SettleReport) -> FormResult<()> {
        {
            let mut state = write_lock(&self.state, "starting a settle pass")?;
            if state.settling {
                return Ok(());
            }
            state.settling = true;
        }
        let settled = self.run_settle(seed);
        {
            let mut state = write_lock(&self.state, "finishing a settle pass")?;
            state.settling = false;
        }
        self.drain_pending();
        settled
    }

    fn drain_pending(&self) {
        loop {
            let next = match write_lock(&self.state, "draining queued mutations") {
                Ok(mut state) => state.pending.pop_front(),
                Err(_) => return,
            };
            let Some(mutation) = next else { return };
            match self.apply_one(mutation) {
                Ok(Applied::Done) => {}
                // Another pass became active; it drains the rest.
                Ok(Applied::Deferred) => return,
                Err(error) => tracing::warn!(error = %error, "queued mutation failed"),
            }
        }
    }
}

pub(super) fn transition_submit_state(state: &mut TreeState, next: SubmitState) -> FormResult<()> {
    let current = state.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::Submitting)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::Submitting, SubmitState::Succeeded)
            | (SubmitState::Submitting, SubmitState::Failed)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    state.submit_state = next;
    Ok(())
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
