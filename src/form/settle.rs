use std::collections::{BTreeMap, BTreeSet};

use crate::error::{FormError, FormResult};
use crate::path::Path;
use crate::value::Value;

use super::behavior::{ComputedReg, FlagEffect, FlagReg, FlagWhen};
use super::controller::{Form, read_lock, write_lock};
use super::tree::{self, NodeState};
use super::validation::ValidationCtx;

/// Accumulated effects of one settle pass. `mutated` holds the directly
/// written paths (external writes plus computed outputs); everything a pass
/// derives is matched against it with wildcard-aware prefix checks, so
/// ancestor and descendant observers both fire without an explicit closure.
#[derive(Default)]
pub(super) struct SettleReport {
    pub(super) mutated: Vec<Path>,
    pub(super) flagged: BTreeSet<Path>,
    pub(super) errored: BTreeSet<Path>,
    pub(super) revalidate: BTreeSet<Path>,
    /// Resets restore a pristine tree; they resettle computed values and
    /// flags but leave the restored nodes unvalidated.
    pub(super) skip_validation: bool,
}

impl SettleReport {
    pub(super) fn mutated(path: Path) -> Self {
        SettleReport {
            mutated: vec![path],
            ..SettleReport::default()
        }
    }

    fn touches_mutated(&self, path: &Path) -> bool {
        self.mutated.iter().any(|mutated| mutated.touches(path))
    }
}

impl Form {
    /// One settle pass: computed fields in dependency order, then flag
    /// behaviors, then watchers, then the affected sync validators, and
    /// only after everything settled, subscriber notification.
    pub(super) fn run_settle(&self, seed: SettleReport) -> FormResult<()> {
        let mut report = seed;
        if !report.mutated.is_empty() {
            self.run_computed(&mut report)?;
            self.run_flag_behaviors(&mut report)?;
            self.run_watchers(&report)?;
        }
        if (!report.mutated.is_empty() || !report.revalidate.is_empty()) && !report.skip_validation
        {
            self.run_affected_validators(&mut report)?;
        }
        tracing::debug!(
            mutated = report.mutated.len(),
            flagged = report.flagged.len(),
            errored = report.errored.len(),
            "settle pass complete"
        );
        self.notify_settled(&report)
    }

    fn run_computed(&self, report: &mut SettleReport) -> FormResult<()> {
        let regs = read_lock(&self.computed, "reading computed registrations")?.clone();
        if regs.is_empty() {
            return Ok(());
        }

        // Affected closure: registrations reached through source paths,
        // expanded transitively through computed outputs.
        let mut affected: BTreeSet<usize> = BTreeSet::new();
        let mut frontier: Vec<Path> = report.mutated.clone();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (index, reg) in regs.iter().enumerate() {
                if affected.contains(&index) {
                    continue;
                }
                let hit = reg
                    .sources
                    .iter()
                    .any(|source| frontier.iter().any(|path| path.touches(source)));
                if hit {
                    affected.insert(index);
                    next.push(reg.target.clone());
                }
            }
            frontier = next;
        }
        if affected.is_empty() {
            return Ok(());
        }

        for index in topo_order(&regs, &affected)? {
            let reg = &regs[index];
            let inputs = self.read_sources(&reg.sources)?;
            let output = (reg.compute)(&inputs);
            if self.write_computed(&reg.target, output)? {
                report.mutated.push(reg.target.clone());
            }
        }
        Ok(())
    }

    pub(super) fn read_sources(&self, sources: &[Path]) -> FormResult<Vec<Value>> {
        let state = read_lock(&self.state, "reading computed inputs")?;
        sources
            .iter()
            .map(|source| {
                if source.is_concrete() {
                    Ok(state.node(source)?.value())
                } else {
                    Ok(Value::List(
                        state
                            .expand(source)
                            .iter()
                            .filter_map(|path| state.node(path).ok().map(NodeState::value))
                            .collect(),
                    ))
                }
            })
            .collect()
    }

    pub(super) fn write_computed(&self, target: &Path, value: Value) -> FormResult<bool> {
        let mut state = write_lock(&self.state, "writing a computed value")?;
        let node = state.node_mut(target)?;
        tree::write_value(node, value, target, false)
    }

    fn run_flag_behaviors(&self, report: &mut SettleReport) -> FormResult<()> {
        let regs = read_lock(&self.flags, "reading flag behaviors")?.clone();
        if regs.is_empty() {
            return Ok(());
        }
        let whole_form = regs
            .iter()
            .any(|reg| matches!(reg.when, FlagWhen::WholeForm(_)));
        let ctx = whole_form.then(|| self.value().map(ValidationCtx::new)).transpose()?;

        for reg in &regs {
            let hit = match &reg.when {
                FlagWhen::Sources { sources, .. } => {
                    sources.iter().any(|source| report.touches_mutated(source))
                }
                FlagWhen::WholeForm(_) => true,
            };
            if !hit {
                continue;
            }
            let decision = match &reg.when {
                FlagWhen::Sources { sources, predicate } => {
                    let inputs = self.read_sources(sources)?;
                    predicate(&inputs)
                }
                FlagWhen::WholeForm(predicate) => {
                    let Some(ctx) = &ctx else { continue };
                    predicate(ctx)
                }
            };
            self.apply_flag(reg, decision, report)?;
        }
        Ok(())
    }

    /// Writes the decided flag onto every concrete target. Becoming visible
    /// or enabled again queues the node for revalidation, per the skip
    /// policy: suppressed validators never ran, so their state is stale.
    pub(super) fn apply_flag(
        &self,
        reg: &FlagReg,
        decision: bool,
        report: &mut SettleReport,
    ) -> FormResult<()> {
        let targets = {
            let state = read_lock(&self.state, "expanding flag targets")?;
            state.expand(&reg.target)
        };
        for target in targets {
            let mut state = write_lock(&self.state, "toggling a node flag")?;
            let node = state.node_mut(&target)?;
            let (changed, unsuppressed) = match reg.effect {
                FlagEffect::Visibility => {
                    let next = decision;
                    let changed = node.visible != next;
                    let unsuppressed = changed && next;
                    node.visible = next;
                    (changed, unsuppressed)
                }
                FlagEffect::Enable => {
                    let next = !decision;
                    let changed = node.disabled != next;
                    let unsuppressed = changed && !next;
                    node.disabled = next;
                    (changed, unsuppressed)
                }
                FlagEffect::Disable => {
                    let next = decision;
                    let changed = node.disabled != next;
                    let unsuppressed = changed && !next;
                    node.disabled = next;
                    (changed, unsuppressed)
                }
            };
            drop(state);
            if changed {
                report.flagged.insert(target.clone());
            }
            if unsuppressed {
                report.revalidate.insert(target);
            }
        }
        Ok(())
    }

    fn run_watchers(&self, report: &SettleReport) -> FormResult<()> {
        let regs = read_lock(&self.watchers, "reading watchers")?.clone();
        for reg in regs {
            if !report.touches_mutated(&reg.path) {
                continue;
            }
            let value = {
                let state = read_lock(&self.state, "reading a watched value")?;
                match state.node(&reg.path) {
                    Ok(node) => node.value(),
                    Err(_) => continue,
                }
            };
            (reg.callback)(&value);
        }
        Ok(())
    }

    fn notify_settled(&self, report: &SettleReport) -> FormResult<()> {
        let targets: BTreeSet<Path> = {
            let subscribers = read_lock(&self.subscribers, "reading subscribers")?;
            subscribers
                .paths()
                .filter(|path| {
                    report.touches_mutated(path)
                        || report.flagged.contains(*path)
                        || report.errored.contains(*path)
                })
                .cloned()
                .collect()
        };
        for path in targets {
            self.notify_path(&path)?;
        }
        Ok(())
    }

    /// Delivers the current snapshot of one node to its subscribers.
    /// Nodes that no longer exist (removed array elements) are skipped.
    pub(super) fn notify_path(&self, path: &Path) -> FormResult<()> {
        let callbacks = {
            let subscribers = read_lock(&self.subscribers, "reading subscriber callbacks")?;
            subscribers.callbacks_for(path)
        };
        if callbacks.is_empty() {
            return Ok(());
        }
        let Ok(snapshot) = self.node(path) else {
            return Ok(());
        };
        for callback in callbacks {
            callback(&snapshot);
        }
        Ok(())
    }
}

/// Kahn ordering of the affected computed registrations, registration order
/// as the stable tie-break. Leftover registrations mean a dependency cycle.
fn topo_order(regs: &[ComputedReg], affected: &BTreeSet<usize>) -> FormResult<Vec<usize>> {
    let mut indegree: BTreeMap<usize, usize> = affected.iter().map(|index| (*index, 0)).collect();
    let mut edges: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &from in affected {
        for &to in affected {
            if from == to {
                continue;
            }
            let feeds = regs[to]
                .sources
                .iter()
                .any(|source| regs[from].target.touches(source));
            if feeds {
                edges.entry(from).or_default().push(to);
                if let Some(degree) = indegree.get_mut(&to) {
                    *degree += 1;
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| *index)
        .collect();
    let mut order = Vec::with_capacity(affected.len());
    while let Some(&index) = ready.iter().next() {
        ready.remove(&index);
        order.push(index);
        for &next in edges.get(&index).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() != affected.len() {
        let cycle = affected
            .iter()
            .filter(|index| !order.contains(index))
            .map(|index| regs[*index].target.clone())
            .collect();
        return Err(FormError::DependencyCycle { cycle });
    }
    Ok(order)
}
