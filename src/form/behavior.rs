use std::sync::Arc;

use crate::error::{FormError, FormResult};
use crate::path::Path;
use crate::value::Value;

use super::controller::{Form, read_lock, write_lock};
use super::settle::SettleReport;
use super::validation::ValidationCtx;

pub(super) type ComputeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
pub(super) type SourcePredicateFn = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;
pub(super) type FormPredicateFn = Arc<dyn Fn(&ValidationCtx) -> bool + Send + Sync>;
pub(super) type WatchFn = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
pub(super) struct ComputedReg {
    pub(super) target: Path,
    pub(super) sources: Vec<Path>,
    pub(super) compute: ComputeFn,
}

#[derive(Clone, Copy)]
pub(super) enum FlagEffect {
    Visibility,
    Enable,
    Disable,
}

#[derive(Clone)]
pub(super) enum FlagWhen {
    Sources {
        sources: Vec<Path>,
        predicate: SourcePredicateFn,
    },
    WholeForm(FormPredicateFn),
}

#[derive(Clone)]
pub(super) struct FlagReg {
    pub(super) target: Path,
    pub(super) effect: FlagEffect,
    pub(super) when: FlagWhen,
}

#[derive(Clone)]
pub(super) struct WatcherReg {
    pub(super) path: Path,
    pub(super) callback: WatchFn,
}

#[derive(Clone)]
pub(super) struct RevalidateReg {
    pub(super) target: Path,
    pub(super) sources: Vec<Path>,
}

impl Form {
    /// Registers a derived field: whenever a source settles to a new value,
    /// the function runs with the current source values and its result is
    /// written to `target` without marking it dirty or touched. A wildcard
    /// source collects the matching element values into a single list
    /// argument. The function also runs once now, so the target never holds
    /// a pre-computed placeholder.
    ///
    /// Registration fails with [`FormError::DependencyCycle`] if the new
    /// edge closes a cycle among computed fields.
    pub fn computed(
        &self,
        target: &Path,
        sources: &[Path],
        compute: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(target, true)?;
        for source in sources {
            self.check_registration_path(source, false)?;
        }
        let compute: ComputeFn = Arc::new(compute);
        let reg = ComputedReg {
            target: target.clone(),
            sources: sources.to_vec(),
            compute: compute.clone(),
        };
        {
            let mut regs = write_lock(&self.computed, "registering a computed field")?;
            regs.push(reg);
            if let Err(error) = check_acyclic(&regs) {
                regs.pop();
                return Err(error);
            }
        }
        tracing::debug!(path = %target, "computed field registered");

        let inputs = self.read_sources(sources)?;
        let output = compute(&inputs);
        if self.write_computed(target, output)? {
            self.settle_from(SettleReport::mutated(target.clone()))?;
        }
        Ok(())
    }

    /// Toggles `visible` on the target from the given source values. Hiding
    /// suppresses the target's validators and its errors' effect on
    /// aggregate validity; showing it again revalidates it.
    pub fn visible_when(
        &self,
        target: &Path,
        sources: &[Path],
        predicate: impl Fn(&[Value]) -> bool + Send + Sync + 'static,
    ) -> FormResult<()> {
        let reg = FlagReg {
            target: target.clone(),
            effect: FlagEffect::Visibility,
            when: FlagWhen::Sources {
                sources: sources.to_vec(),
                predicate: Arc::new(predicate),
            },
        };
        self.register_flag(reg, sources)
    }

    /// Enables the target while the whole-form predicate holds. Whole-form
    /// predicates re-run on every settle pass; prefer source-scoped
    /// behaviors on large forms.
    pub fn enable_when(
        &self,
        target: &Path,
        predicate: impl Fn(&ValidationCtx) -> bool + Send + Sync + 'static,
    ) -> FormResult<()> {
        let reg = FlagReg {
            target: target.clone(),
            effect: FlagEffect::Enable,
            when: FlagWhen::WholeForm(Arc::new(predicate)),
        };
        self.register_flag(reg, &[])
    }

    /// Disables the target while the whole-form predicate holds. A disabled
    /// node keeps its value readable but is excluded from validation and
    /// from the submit value.
    pub fn disable_when(
        &self,
        target: &Path,
        predicate: impl Fn(&ValidationCtx) -> bool + Send + Sync + 'static,
    ) -> FormResult<()> {
        let reg = FlagReg {
            target: target.clone(),
            effect: FlagEffect::Disable,
            when: FlagWhen::WholeForm(Arc::new(predicate)),
        };
        self.register_flag(reg, &[])
    }

    fn register_flag(&self, reg: FlagReg, sources: &[Path]) -> FormResult<()> {
        self.check_registration_path(&reg.target, false)?;
        for source in sources {
            self.check_registration_path(source, false)?;
        }
        {
            let mut regs = write_lock(&self.flags, "registering a flag behavior")?;
            regs.push(reg.clone());
        }
        // Establish the flag now so it reflects current values.
        let decision = match &reg.when {
            FlagWhen::Sources { sources, predicate } => {
                let inputs = self.read_sources(sources)?;
                predicate(&inputs)
            }
            FlagWhen::WholeForm(predicate) => {
                let ctx = ValidationCtx::new(self.value()?);
                predicate(&ctx)
            }
        };
        let mut report = SettleReport::default();
        self.apply_flag(&reg, decision, &mut report)?;
        if report.flagged.is_empty() && report.revalidate.is_empty() {
            return Ok(());
        }
        self.settle_from(report)
    }

    /// Fires the callback with the settled value after every change to the
    /// path. Watchers are for side effects; a watcher that mutates the tree
    /// queues a fresh pass rather than re-entering the running one, so keep
    /// them read-only.
    pub fn watch(
        &self,
        path: &Path,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> FormResult<()> {
        self.check_registration_path(path, true)?;
        let mut regs = write_lock(&self.watchers, "registering a watcher")?;
        regs.push(WatcherReg {
            path: path.clone(),
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// Forces the target's validators to re-run whenever any source
    /// changes, independent of whether the target's own value moved.
    pub fn revalidate_when(&self, target: &Path, sources: &[Path]) -> FormResult<()> {
        self.check_registration_path(target, false)?;
        for source in sources {
            self.check_registration_path(source, false)?;
        }
        let mut regs = write_lock(&self.revalidations, "registering a revalidation rule")?;
        regs.push(RevalidateReg {
            target: target.clone(),
            sources: sources.to_vec(),
        });
        Ok(())
    }

    pub(super) fn check_registration_path(
        &self,
        path: &Path,
        concrete_only: bool,
    ) -> FormResult<()> {
        if concrete_only && !path.is_concrete() {
            return Err(FormError::WildcardPath { path: path.clone() });
        }
        let state = read_lock(&self.state, "checking a registration path")?;
        if !state.schema.contains(path) {
            return Err(FormError::UnknownPath { path: path.clone() });
        }
        Ok(())
    }
}

/// Rejects a computed-field graph with a cycle. Runs over the full
/// registration list, so the offending registration is caught before it is
/// ever executed.
fn check_acyclic(regs: &[ComputedReg]) -> FormResult<()> {
    for reg in regs {
        let self_feeding = reg.sources.iter().any(|source| reg.target.touches(source));
        if self_feeding {
            return Err(FormError::DependencyCycle {
                cycle: vec![reg.target.clone()],
            });
        }
    }

    let mut visiting = vec![false; regs.len()];
    let mut done = vec![false; regs.len()];

    fn visit(
        regs: &[ComputedReg],
        index: usize,
        visiting: &mut [bool],
        done: &mut [bool],
        trail: &mut Vec<Path>,
    ) -> FormResult<()> {
        if done[index] {
            return Ok(());
        }
        if visiting[index] {
            trail.push(regs[index].target.clone());
            return Err(FormError::DependencyCycle {
                cycle: std::mem::take(trail),
            });
        }
        visiting[index] = true;
        trail.push(regs[index].target.clone());
        for (next, reg) in regs.iter().enumerate() {
            if next == index {
                continue;
            }
            let feeds = reg
                .sources
                .iter()
                .any(|source| regs[index].target.touches(source));
            if feeds {
                visit(regs, next, visiting, done, trail)?;
            }
        }
        trail.pop();
        visiting[index] = false;
        done[index] = true;
        Ok(())
    }

    for index in 0..regs.len() {
        let mut trail = Vec::new();
        visit(regs, index, &mut visiting, &mut done, &mut trail)?;
    }
    Ok(())
}
