use std::collections::BTreeSet;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;

use crate::error::{FormError, FormResult, ValidationError};
use crate::path::{Path, Segment};
use crate::schema::Schema;
use crate::value::Value;

use super::controller::{Form, read_lock, write_lock};
use super::settle::SettleReport;

/// Read-only view of the whole form handed to validators and whole-form
/// predicates. Includes disabled nodes: they stay readable internally even
/// though they are excluded from the submit value.
pub struct ValidationCtx {
    root: Value,
}

impl ValidationCtx {
    pub(crate) fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn form_value(&self) -> &Value {
        &self.root
    }

    pub fn value_at(&self, path: &Path) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.segments() {
            current = match (current, segment) {
                (Value::Record(entries), Segment::Key(key)) => entries.get(key)?,
                (Value::List(items), Segment::Index(index)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

pub(super) type SyncValidateFn =
    Arc<dyn Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync>;
pub(super) type CrossValidateFn =
    Arc<dyn Fn(&ValidationCtx) -> Option<ValidationError> + Send + Sync>;

pub type AsyncRejection = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxValidationFuture =
    Pin<Box<dyn Future<Output = Result<Option<ValidationError>, AsyncRejection>> + Send + 'static>>;
pub(super) type AsyncValidateFn = Arc<dyn Fn(Value) -> BoxValidationFuture + Send + Sync>;

#[derive(Clone)]
pub(super) enum SyncCheck {
    Field(SyncValidateFn),
    Cross(CrossValidateFn),
}

#[derive(Clone)]
pub(super) enum Deps {
    Paths(Vec<Path>),
    Global,
}

#[derive(Clone)]
pub(super) struct SyncReg {
    pub(super) target: Path,
    pub(super) deps: Deps,
    pub(super) check: SyncCheck,
}

#[derive(Clone)]
pub(super) struct AsyncReg {
    pub(super) target: Path,
    pub(super) debounce: Duration,
    pub(super) run: AsyncValidateFn,
}

impl Form {
    /// Registers a validator that re-runs whenever the path's value changes
    /// (and on explicit validation and submit). A wildcard path applies the
    /// validator to every current and future element of the array.
    pub fn register_sync(
        &self,
        path: &Path,
        check: impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(path, false)?;
        let mut regs = write_lock(&self.sync_validators, "registering a sync validator")?;
        regs.push(SyncReg {
            target: path.clone(),
            deps: Deps::Paths(vec![path.clone()]),
            check: SyncCheck::Field(Arc::new(check)),
        });
        Ok(())
    }

    /// Applies the check to every current and future element of the array.
    /// Sugar for a wildcard-path registration: the check receives the whole
    /// element value.
    pub fn register_each(
        &self,
        array_path: &Path,
        check: impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static,
    ) -> FormResult<()> {
        {
            let state = read_lock(&self.state, "checking an array registration path")?;
            if !matches!(schema_at(&state.schema, array_path), Some(Schema::Array { .. })) {
                return Err(FormError::NotAnArray {
                    path: array_path.clone(),
                });
            }
        }
        self.register_sync(&array_path.clone().each(), check)
    }

    /// Cross-tree validator with an explicit dependency list: it re-runs
    /// only when one of the declared sources changes, and its error lands
    /// on `target`.
    pub fn register_cross(
        &self,
        target: &Path,
        deps: &[Path],
        check: impl Fn(&ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(target, true)?;
        for dep in deps {
            self.check_registration_path(dep, false)?;
        }
        let mut regs = write_lock(&self.sync_validators, "registering a cross validator")?;
        regs.push(SyncReg {
            target: target.clone(),
            deps: Deps::Paths(deps.to_vec()),
            check: SyncCheck::Cross(Arc::new(check)),
        });
        Ok(())
    }

    /// Cross-tree validator without a dependency list: re-runs on every
    /// settle pass. Kept for parity with looser rule styles; prefer
    /// [`Form::register_cross`], which scales with the declared sources
    /// instead of the whole form.
    pub fn register_cross_global(
        &self,
        target: &Path,
        check: impl Fn(&ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(target, true)?;
        let mut regs = write_lock(&self.sync_validators, "registering a global validator")?;
        regs.push(SyncReg {
            target: target.clone(),
            deps: Deps::Global,
            check: SyncCheck::Cross(Arc::new(check)),
        });
        Ok(())
    }

    /// Registers a debounced asynchronous validator. Change-triggered runs
    /// (via [`Form::set_value_async`]) wait out `debounce_ms` of quiescence
    /// first; explicit validation runs immediately. While a call is in
    /// flight the node's `validating` flag is set, and a monotonic per-node
    /// ticket guarantees a superseded call's resolution is discarded. A
    /// future resolving to `Err` is fail-open: logged and treated as valid.
    pub fn register_async(
        &self,
        path: &Path,
        debounce_ms: u64,
        run: impl Fn(Value) -> BoxValidationFuture + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(path, false)?;
        let mut regs = write_lock(&self.async_validators, "registering an async validator")?;
        regs.push(AsyncReg {
            target: path.clone(),
            debounce: Duration::from_millis(debounce_ms),
            run: Arc::new(run),
        });
        Ok(())
    }

    /// [`Form::set_value`] followed by the debounced async validators whose
    /// path the write affects.
    pub async fn set_value_async(&self, path: &Path, value: impl Into<Value>) -> FormResult<()> {
        self.set_value(path, value)?;
        self.run_async_for(path, true).await
    }

    pub async fn validate_node(&self, path: &Path) -> FormResult<bool> {
        if !path.is_concrete() {
            return Err(FormError::WildcardPath { path: path.clone() });
        }
        self.validate_scope(path).await
    }

    pub async fn validate_all(&self) -> FormResult<bool> {
        self.validate_scope(&Path::root()).await
    }

    /// Runs every sync validator whose target lies in the scope, then every
    /// async validator (immediately, ticket-guarded), and reports the
    /// scope's aggregate validity.
    async fn validate_scope(&self, scope: &Path) -> FormResult<bool> {
        let regs = read_lock(&self.sync_validators, "reading sync validators")?.clone();
        let mut scheduled = BTreeSet::new();
        {
            let state = read_lock(&self.state, "expanding the validation scope")?;
            for reg in &regs {
                for target in state.expand(&reg.target) {
                    if within_scope(scope, &target) {
                        scheduled.insert(target);
                    }
                }
            }
        }
        let errored = self.run_sync_targets(&scheduled, &regs)?;
        for path in &errored {
            self.notify_path(path)?;
        }

        let async_regs = read_lock(&self.async_validators, "reading async validators")?.clone();
        for reg in async_regs {
            let targets = {
                let state = read_lock(&self.state, "expanding async validation targets")?;
                state.expand(&reg.target)
            };
            for target in targets {
                if within_scope(scope, &target) {
                    self.run_async_one(&reg, target, false).await?;
                }
            }
        }

        let state = read_lock(&self.state, "reading subtree validity")?;
        Ok(state.node(scope)?.is_valid())
    }

    /// Settle-pass stage: schedules the sync validators whose dependencies
    /// intersect the pass's writes, plus forced and visibility-triggered
    /// revalidations, and refreshes the scheduled nodes' error lists.
    pub(super) fn run_affected_validators(&self, report: &mut SettleReport) -> FormResult<()> {
        let regs = read_lock(&self.sync_validators, "reading sync validators")?.clone();
        let revalidations = read_lock(&self.revalidations, "reading revalidation rules")?.clone();

        for rule in &revalidations {
            let hit = rule
                .sources
                .iter()
                .any(|source| report.mutated.iter().any(|path| path.touches(source)));
            if hit {
                report.revalidate.insert(rule.target.clone());
            }
        }

        let mut scheduled: BTreeSet<Path> = BTreeSet::new();
        {
            let state = read_lock(&self.state, "expanding validation targets")?;
            for reg in &regs {
                match &reg.deps {
                    Deps::Global => {
                        if !report.mutated.is_empty() {
                            scheduled.extend(state.expand(&reg.target));
                        }
                    }
                    Deps::Paths(deps) => {
                        for dep in deps {
                            for mutated in &report.mutated {
                                if mutated.touches(dep) {
                                    let bound = reg.target.substitute(&dep.bind(mutated));
                                    scheduled.extend(state.expand(&bound));
                                }
                            }
                        }
                    }
                }
            }
            for scope in &report.revalidate {
                for reg in &regs {
                    for target in state.expand(&reg.target) {
                        if within_scope(scope, &target) {
                            scheduled.insert(target);
                        }
                    }
                }
            }
        }

        let errored = self.run_sync_targets(&scheduled, &regs)?;
        report.errored.extend(errored);
        Ok(())
    }

    /// Recomputes the full error list of each scheduled node by running all
    /// of its applicable validators in registration order. Suppressed nodes
    /// (hidden or disabled, directly or through an ancestor) are skipped
    /// and keep whatever errors they already carry.
    pub(super) fn run_sync_targets(
        &self,
        targets: &BTreeSet<Path>,
        regs: &[SyncReg],
    ) -> FormResult<BTreeSet<Path>> {
        let mut errored = BTreeSet::new();
        if targets.is_empty() {
            return Ok(errored);
        }
        let ctx = ValidationCtx::new(self.value()?);

        for target in targets {
            let value = {
                let state = read_lock(&self.state, "reading a validation target")?;
                if state.suppressed(target) {
                    continue;
                }
                match state.node(target) {
                    Ok(node) => node.value(),
                    Err(_) => continue,
                }
            };

            let mut errors = Vec::new();
            for reg in regs {
                if !reg.target.matches(target) {
                    continue;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| match &reg.check {
                    SyncCheck::Field(check) => check(&value, &ctx),
                    SyncCheck::Cross(check) => check(&ctx),
                }));
                match outcome {
                    Ok(Some(error)) => errors.push(error),
                    Ok(None) => {}
                    Err(payload) => {
                        return Err(FormError::ValidatorImplementation {
                            path: target.clone(),
                            message: panic_message(payload),
                        });
                    }
                }
            }

            let mut state = write_lock(&self.state, "storing validation results")?;
            let Ok(node) = state.node_mut(target) else {
                continue;
            };
            if node.errors != errors {
                node.errors = errors;
                errored.insert(target.clone());
            }
        }
        Ok(errored)
    }

    async fn run_async_for(&self, mutated: &Path, debounced: bool) -> FormResult<()> {
        let regs = read_lock(&self.async_validators, "reading async validators")?.clone();
        for reg in regs {
            if !mutated.touches(&reg.target) {
                continue;
            }
            let bound = reg.target.substitute(&reg.target.bind(mutated));
            let targets = {
                let state = read_lock(&self.state, "expanding async targets")?;
                state.expand(&bound)
            };
            for target in targets {
                self.run_async_one(&reg, target, debounced).await?;
            }
        }
        Ok(())
    }

    async fn run_async_one(&self, reg: &AsyncReg, target: Path, debounced: bool) -> FormResult<()> {
        let ticket = {
            let mut state = write_lock(&self.state, "starting async validation")?;
            if state.suppressed(&target) {
                return Ok(());
            }
            let Ok(node) = state.node_mut(&target) else {
                return Ok(());
            };
            node.ticket = node.ticket.wrapping_add(1);
            node.validating = true;
            node.ticket
        };
        self.notify_path(&target)?;

        if debounced && !reg.debounce.is_zero() {
            Delay::new(reg.debounce).await;
            if !self.is_latest_ticket(&target, ticket)? {
                return Ok(());
            }
        }

        let value = {
            let state = read_lock(&self.state, "reading an async validation value")?;
            match state.node(&target) {
                Ok(node) => node.value(),
                Err(_) => return Ok(()),
            }
        };
        let result = (reg.run)(value).await;

        {
            let mut state = write_lock(&self.state, "finishing async validation")?;
            let Ok(node) = state.node_mut(&target) else {
                return Ok(());
            };
            if node.ticket != ticket {
                return Ok(());
            }
            node.validating = false;
            node.errors = match result {
                Ok(Some(error)) => vec![error],
                Ok(None) => Vec::new(),
                Err(rejection) => {
                    tracing::warn!(
                        path = %target,
                        error = %rejection,
                        "async validator rejected; treating as valid"
                    );
                    Vec::new()
                }
            };
        }
        self.notify_path(&target)?;
        Ok(())
    }

    fn is_latest_ticket(&self, path: &Path, ticket: u64) -> FormResult<bool> {
        let state = read_lock(&self.state, "checking the latest validation ticket")?;
        Ok(state
            .node(path)
            .map(|node| node.ticket == ticket)
            .unwrap_or(false))
    }
}

fn within_scope(scope: &Path, target: &Path) -> bool {
    scope.touches(target) && target.segments().len() >= scope.segments().len()
}

fn schema_at<'a>(schema: &'a Schema, path: &Path) -> Option<&'a Schema> {
    let mut current = schema;
    for segment in path.segments() {
        current = match (current, segment) {
            (Schema::Group { children }, Segment::Key(key)) => children
                .iter()
                .find_map(|(name, child)| (name == key).then_some(child))?,
            (Schema::Array { template }, Segment::Index(_) | Segment::Wildcard) => template,
            _ => return None,
        };
    }
    Some(current)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
