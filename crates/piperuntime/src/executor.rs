use crate::graph::DependencyGraph;
use crate::meta::MetadataStore;
use crate::registry::PipelineRegistry;
use crate::store::StorageAdapter;
use crate::worker::{
    result_channel, PersistentPool, TransientPool, UnitOfWork, UnitResult, WorkerPool,
};
use chrono::Utc;
use pipecore::{
    aggregate, arg_shape, branch_identity, branch_unit_name, events::RunEvent,
    resolve_pattern_shape_seeded, slice_identity, take_slice, ArgShape, EventBus, Fingerprint,
    Format, Locality, Memory, PatternError, PatternSpec, PipelineError, Record, RunId, SliceKey,
    TargetError, TargetKind, TaskContext, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which flavor of local worker pool a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Fixed pool launched once per run, workers pull from a shared queue
    Persistent,
    /// One worker spawned per unit, torn down on completion
    Transient,
}

/// Terminal outcome of one unit within a run.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus {
    Succeeded,
    /// Fingerprint matched the last successful record; nothing ran
    Skipped,
    Failed(String),
    /// Never dispatched because the run stopped first
    Cancelled,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub statuses: HashMap<String, UnitStatus>,
    /// Units actually dispatched to a worker (skips excluded)
    pub executed: usize,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, UnitStatus::Succeeded))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, UnitStatus::Skipped))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, UnitStatus::Failed(_)))
    }

    pub fn status(&self, name: &str) -> Option<&UnitStatus> {
        self.statuses.get(name)
    }

    fn with_status(&self, pred: impl Fn(&UnitStatus) -> bool) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .statuses
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(n, _)| n.as_str())
            .collect();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl UnitState {
    fn is_terminal(self) -> bool {
        !matches!(self, UnitState::Pending | UnitState::Running)
    }

    fn is_success(self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Skipped)
    }
}

enum UnitKind {
    Stem,
    /// A pattern target awaiting its branches
    Shell { expanded: bool, branches: Vec<String> },
    /// One dynamically created sub-task of a pattern
    Branch { inputs: HashMap<String, Value> },
}

struct Unit {
    /// Owning target name; equals the unit's own name for non-branches
    parent: String,
    deps: Vec<String>,
    state: UnitState,
    kind: UnitKind,
    fingerprint: Option<Fingerprint>,
    error: Option<String>,
    /// Downstream weight for ready-queue priority
    priority: usize,
    /// Registration index of the owning target
    order: usize,
    /// Creation index within the pattern, 0 for non-branches
    creation: usize,
}

struct RunState {
    units: HashMap<String, Unit>,
    /// Scan order: targets in topological order, branches appended at
    /// creation in creation-index order
    scan: Vec<String>,
    values: HashMap<String, Value>,
    running: usize,
    executed: usize,
    stopped: bool,
}

impl RunState {
    fn unit(&self, name: &str) -> &Unit {
        &self.units[name]
    }

    fn deps_satisfied(&self, name: &str) -> bool {
        self.units[name]
            .deps
            .iter()
            .all(|d| self.units[d].state.is_success())
    }

    fn deps_terminal(&self, name: &str) -> bool {
        self.units[name]
            .deps
            .iter()
            .all(|d| self.units[d].state.is_terminal())
    }
}

/// Dependency-respecting scheduler dispatching stale units to a
/// bounded pool of workers.
pub struct PipelineExecutor {
    pub max_parallel: usize,
    pub worker_mode: WorkerMode,
    pub unit_timeout: Option<Duration>,
    pub cancel_grace: Option<Duration>,
    pub run_seed: u64,
}

impl PipelineExecutor {
    pub async fn execute(
        &self,
        registry: &PipelineRegistry,
        graph: &DependencyGraph,
        meta: &MetadataStore,
        store: Arc<dyn StorageAdapter>,
        bus: &EventBus,
    ) -> Result<RunReport, PipelineError> {
        let run_id = RunId::new_v4();
        let start = Instant::now();
        let cancellation = CancellationToken::new();

        bus.emit(RunEvent::RunStarted {
            run_id,
            targets: registry.len(),
            timestamp: Utc::now(),
        });
        tracing::info!("Run {run_id} started: {} targets", registry.len());

        let mut state = RunState {
            units: HashMap::new(),
            scan: Vec::new(),
            values: HashMap::new(),
            running: 0,
            executed: 0,
            stopped: false,
        };

        for name in graph.order() {
            let def = registry.get(name).expect("topological order covers registry");
            let kind = match def.target.kind() {
                TargetKind::Stem => UnitKind::Stem,
                TargetKind::Pattern => UnitKind::Shell {
                    expanded: false,
                    branches: Vec::new(),
                },
            };
            state.units.insert(
                name.clone(),
                Unit {
                    parent: name.clone(),
                    deps: def.target.all_deps(),
                    state: UnitState::Pending,
                    kind,
                    fingerprint: None,
                    error: None,
                    priority: graph.downstream_weight(name),
                    order: def.index,
                    creation: 0,
                },
            );
            state.scan.push(name.clone());
        }

        let (results_tx, mut results_rx) = result_channel(self.max_parallel.max(1) * 2);
        let pool: Arc<dyn WorkerPool> = match self.worker_mode {
            WorkerMode::Persistent => {
                Arc::new(PersistentPool::new(self.max_parallel.max(1), results_tx.clone()))
            }
            WorkerMode::Transient => Arc::new(TransientPool::new(results_tx.clone())),
        };

        let ctx = ExecCtx {
            registry,
            graph,
            meta,
            store,
            bus,
            pool,
            results_tx,
            cancellation,
            run_id,
        };

        let outcome = self.drive(&mut state, &ctx, &mut results_rx).await;
        ctx.pool.shutdown();

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut statuses = HashMap::new();
        for name in &state.scan {
            let unit = &state.units[name];
            let status = match unit.state {
                UnitState::Succeeded => UnitStatus::Succeeded,
                UnitState::Skipped => UnitStatus::Skipped,
                UnitState::Failed => {
                    UnitStatus::Failed(unit.error.clone().unwrap_or_default())
                }
                UnitState::Pending | UnitState::Running => UnitStatus::Cancelled,
            };
            statuses.insert(name.clone(), status);
        }

        let succeeded = statuses
            .values()
            .filter(|s| matches!(s, UnitStatus::Succeeded))
            .count();
        let failed = statuses
            .values()
            .filter(|s| matches!(s, UnitStatus::Failed(_)))
            .count();
        let skipped = statuses
            .values()
            .filter(|s| matches!(s, UnitStatus::Skipped))
            .count();

        ctx.bus.emit(RunEvent::RunCompleted {
            run_id,
            succeeded,
            failed,
            skipped,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Run {run_id} completed in {duration_ms}ms: {succeeded} succeeded, \
             {failed} failed, {skipped} skipped"
        );

        outcome?;

        Ok(RunReport {
            run_id,
            statuses,
            executed: state.executed,
            duration_ms,
        })
    }

    /// Main scheduling loop: admit everything admissible, then wait
    /// for one completion, until no work remains.
    async fn drive(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        results_rx: &mut mpsc::Receiver<UnitResult>,
    ) -> Result<(), PipelineError> {
        loop {
            while self.admit(state, ctx).await? {}

            if state.running == 0 {
                break;
            }
            let Some(result) = results_rx.recv().await else {
                break;
            };
            self.handle_result(state, ctx, result).await?;
        }
        Ok(())
    }

    /// One admission pass over ready units, highest downstream weight
    /// first. Returns whether any unit changed state.
    async fn admit(&self, state: &mut RunState, ctx: &ExecCtx<'_>) -> Result<bool, PipelineError> {
        let mut ready: Vec<String> = state
            .scan
            .iter()
            .filter(|n| {
                let unit = &state.units[n.as_str()];
                unit.state == UnitState::Pending && state.deps_terminal(n)
            })
            .cloned()
            .collect();
        ready.sort_by_key(|n| {
            let unit = &state.units[n.as_str()];
            (std::cmp::Reverse(unit.priority), unit.order, unit.creation)
        });

        let mut progress = false;
        for name in ready {
            if state.units[&name].state != UnitState::Pending {
                continue;
            }

            // A dependency failed: this unit can never run.
            if !state.deps_satisfied(&name) {
                self.fail_unit(
                    state,
                    ctx,
                    &name,
                    &TargetError::UpstreamFailed(failed_dep_of(state, &name)),
                )?;
                progress = true;
                continue;
            }

            let is_shell_pending_expand = matches!(
                state.units[&name].kind,
                UnitKind::Shell { expanded: false, .. }
            );
            let is_shell = matches!(state.units[&name].kind, UnitKind::Shell { .. });

            if is_shell_pending_expand {
                self.expand_pattern(state, ctx, &name).await?;
                // The new branches are not in this pass's ready
                // snapshot; rescan so they compete for worker slots
                // by priority instead of ceding them to whatever
                // came later in the stale snapshot.
                return Ok(true);
            }
            if is_shell {
                self.finalize_shell(state, ctx, &name).await?;
                progress = true;
                continue;
            }

            if state.stopped {
                continue;
            }

            // Stems and branches: fingerprint, then skip or dispatch.
            let fingerprint = match self.unit_fingerprint(state, ctx, &name) {
                Ok(fp) => fp,
                Err(e) => {
                    self.fail_unit(state, ctx, &name, &e)?;
                    progress = true;
                    continue;
                }
            };
            state.units.get_mut(&name).unwrap().fingerprint = Some(fingerprint.clone());

            if !ctx.meta.is_stale(&name, &fingerprint) {
                self.skip_unit(state, ctx, &name);
                progress = true;
                continue;
            }

            if state.running >= self.max_parallel.max(1) {
                continue;
            }
            self.dispatch(state, ctx, &name).await?;
            progress = true;
        }
        Ok(progress)
    }

    /// Current fingerprint of a stem or branch. Branch fingerprints
    /// were fixed at expansion; stems hash command text, dependency
    /// fingerprints, and tracked file digests.
    fn unit_fingerprint(
        &self,
        state: &RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
    ) -> Result<Fingerprint, TargetError> {
        let unit = state.unit(name);
        if let Some(fp) = &unit.fingerprint {
            return Ok(fp.clone());
        }

        let def = ctx.registry.get(&unit.parent).expect("unit has a target");
        let dep_fps: Vec<&Fingerprint> = unit
            .deps
            .iter()
            .map(|d| {
                state.units[d]
                    .fingerprint
                    .as_ref()
                    .expect("terminal dependency has a fingerprint")
            })
            .collect();

        // File targets re-digest the paths recorded by the last run;
        // a missing path is a StaleFile failure.
        let file_digests = if def.target.format == Format::File {
            match ctx.meta.get(name).and_then(|r| r.file_digests) {
                Some(digests) => {
                    let paths: Vec<String> = digests.into_iter().map(|(p, _)| p).collect();
                    MetadataStore::current_file_digests(&paths)?
                        .into_iter()
                        .map(|(_, d)| d)
                        .collect()
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(Fingerprint::of_target(
            &def.target.command,
            &dep_fps,
            &file_digests,
        ))
    }

    fn skip_unit(&self, state: &mut RunState, ctx: &ExecCtx<'_>, name: &str) {
        let unit = state.units.get_mut(name).unwrap();
        unit.state = UnitState::Skipped;
        tracing::debug!("Skipping {name}: fingerprint unchanged");
        ctx.bus.emit(RunEvent::UnitSkipped {
            run_id: ctx.run_id,
            unit: name.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn dispatch(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
    ) -> Result<(), PipelineError> {
        let def = ctx
            .registry
            .get(&state.unit(name).parent)
            .expect("unit has a target");
        let target = &def.target;

        // Resolve inputs: branch slices were fixed at expansion; stems
        // read their dependencies' values, loading persisted values of
        // skipped upstreams on whichever side retrieval locality says.
        let mut inputs = HashMap::new();
        let mut fetch = Vec::new();
        match &state.units[name].kind {
            UnitKind::Branch { inputs: sliced, .. } => {
                inputs = sliced.clone();
            }
            _ => {
                for dep in state.units[name].deps.clone() {
                    if let Some(value) = state.values.get(&dep) {
                        inputs.insert(dep.clone(), value.clone());
                        continue;
                    }
                    let location = self.location_of(ctx, &dep)?;
                    let dep_format = ctx
                        .registry
                        .get(&state.units[&dep].parent)
                        .map(|d| d.target.format)
                        .unwrap_or(Format::Json);
                    if target.retrieval == Locality::Worker {
                        fetch.push((dep.clone(), location, dep_format));
                    } else {
                        let value = ctx.store.load(&location, dep_format).await?;
                        state.values.insert(dep.clone(), value.clone());
                        inputs.insert(dep.clone(), value);
                    }
                }
            }
        }

        let timeout = target
            .resources
            .get("timeout_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .or(self.unit_timeout);

        let persist = target.storage == Locality::Worker;
        let unit_of_work = UnitOfWork {
            name: name.to_string(),
            task: Arc::clone(&def.task),
            ctx: TaskContext {
                unit: name.to_string(),
                inputs,
                resources: target.resources.clone(),
                events: ctx.bus.create_emitter(ctx.run_id, name),
                cancellation: ctx.cancellation.child_token(),
            },
            format: target.format,
            store: if persist || !fetch.is_empty() {
                Some(Arc::clone(&ctx.store))
            } else {
                None
            },
            persist,
            fetch,
            timeout,
            cancel_grace: self.cancel_grace,
        };

        ctx.bus.emit(RunEvent::UnitStarted {
            run_id: ctx.run_id,
            unit: name.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!("Dispatching {name}");

        state.units.get_mut(name).unwrap().state = UnitState::Running;
        state.running += 1;
        state.executed += 1;

        if target.deployment == Locality::Main {
            // Main-only units run on the coordinator, never in a pool.
            let results = ctx.results_tx.clone();
            tokio::spawn(async move {
                let result = crate::worker::run_unit(unit_of_work).await;
                let _ = results.send(result).await;
            });
        } else {
            ctx.pool.submit(unit_of_work).await?;
        }
        Ok(())
    }

    /// Resolve a pattern's declarative specification into concrete
    /// branch units, the moment all contributing stems have resolved.
    async fn expand_pattern(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
    ) -> Result<(), PipelineError> {
        let def = ctx.registry.get(name).expect("pattern is registered");
        let spec = def.target.pattern.clone().expect("pattern has a spec");

        // Pattern-level fingerprint over command, the spec expression
        // (its shape decides the aggregate), and dependency
        // fingerprints. Sampled patterns also fold in the run seed
        // that drives selection.
        let dep_fps: Vec<&Fingerprint> = state.units[name]
            .deps
            .iter()
            .map(|d| {
                state.units[d]
                    .fingerprint
                    .as_ref()
                    .expect("terminal dependency has a fingerprint")
            })
            .collect();
        let spec_repr = spec.to_string();
        let seed_bytes = self.run_seed.to_le_bytes();
        let mut fp_parts: Vec<&[u8]> =
            vec![def.target.command.as_bytes(), spec_repr.as_bytes()];
        for fp in &dep_fps {
            fp_parts.push(fp.as_str().as_bytes());
        }
        if spec.uses_sample() {
            fp_parts.push(&seed_bytes);
        }
        let pattern_fp = Fingerprint::of_parts(fp_parts);

        // Slice availability per leaf; pattern upstreams contribute
        // one slice per branch.
        let mut shapes: HashMap<String, ArgShape> = HashMap::new();
        let mut branch_values: HashMap<String, Vec<Value>> = HashMap::new();
        for leaf in spec.leaves() {
            let leaf_def = ctx.registry.get(&leaf).expect("leaf is registered");
            let upstream_branches = match &state.units[&leaf].kind {
                UnitKind::Shell { branches, .. } => Some(branches.clone()),
                _ => None,
            };
            if let Some(upstream) = upstream_branches {
                let mut values = Vec::with_capacity(upstream.len());
                for branch in &upstream {
                    values.push(self.value_of(state, ctx, branch).await?);
                }
                shapes.insert(leaf.clone(), ArgShape::Len(values.len()));
                branch_values.insert(leaf.clone(), values);
            } else {
                let value = self.value_of(state, ctx, &leaf).await?;
                let shape = arg_shape(
                    &leaf,
                    &value,
                    leaf_def.target.iteration,
                    leaf_def.target.group_by.as_deref(),
                )
                .map_err(|e| self.structural_failure(state, ctx, name, e))?;
                shapes.insert(leaf.clone(), shape);
            }
        }

        let resolved = resolve_pattern_shape_seeded(&spec, &shapes, name, self.run_seed)
            .map_err(|e| self.structural_failure(state, ctx, name, e))?;

        let mut branch_names = Vec::with_capacity(resolved.len());
        for (creation, shape) in resolved.iter().enumerate() {
            let mut inputs: HashMap<String, Value> = HashMap::new();
            let mut slice_ids = Vec::with_capacity(shape.slices.len());
            for slice in &shape.slices {
                let leaf_def = ctx.registry.get(&slice.target).expect("leaf is registered");
                let value = match branch_values.get(&slice.target) {
                    Some(values) => match slice.key {
                        SliceKey::Index(i) => values[i].clone(),
                        SliceKey::Group(_) => {
                            unreachable!("pattern upstreams slice by branch index")
                        }
                    },
                    None => {
                        let whole = state.values[&slice.target].clone();
                        take_slice(
                            &slice.target,
                            &whole,
                            &slice.key,
                            leaf_def.target.group_by.as_deref(),
                        )
                        .map_err(|e| self.structural_failure(state, ctx, name, e))?
                    }
                };
                slice_ids.push(slice_identity(&slice.target, &slice.key, &value));
                inputs.insert(slice.target.clone(), value);
            }

            let identity = branch_identity(name, &slice_ids);
            let branch = branch_unit_name(name, &identity);
            let mut fp_parts: Vec<&[u8]> = vec![def.target.command.as_bytes()];
            for id in &slice_ids {
                fp_parts.push(id.as_bytes());
            }
            let fingerprint = Fingerprint::of_parts(fp_parts);

            state.units.insert(
                branch.clone(),
                Unit {
                    parent: name.to_string(),
                    deps: Vec::new(),
                    state: UnitState::Pending,
                    kind: UnitKind::Branch { inputs },
                    fingerprint: Some(fingerprint),
                    error: None,
                    priority: state.units[name].priority + 1,
                    order: def.index,
                    creation,
                },
            );
            state.scan.push(branch.clone());
            branch_names.push(branch);
        }

        tracing::info!("Pattern {name} expanded into {} branches", branch_names.len());
        ctx.bus.emit(RunEvent::PatternExpanded {
            run_id: ctx.run_id,
            pattern: name.to_string(),
            branches: branch_names.len(),
            timestamp: Utc::now(),
        });

        let unit = state.units.get_mut(name).unwrap();
        unit.fingerprint = Some(pattern_fp);
        // The shell now waits on its branches instead of its stems.
        unit.deps = branch_names.clone();
        unit.kind = UnitKind::Shell {
            expanded: true,
            branches: branch_names,
        };
        Ok(())
    }

    /// All branches of a pattern are terminal: aggregate, skip, or
    /// fail the pattern as a whole.
    async fn finalize_shell(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
    ) -> Result<(), PipelineError> {
        let UnitKind::Shell { branches, .. } = &state.units[name].kind else {
            unreachable!("finalize_shell on a shell unit");
        };
        let branches = branches.clone();
        let def = ctx.registry.get(name).expect("pattern is registered");
        let fingerprint = state.units[name]
            .fingerprint
            .clone()
            .expect("expanded shell has a fingerprint");

        let any_executed = branches
            .iter()
            .any(|b| state.units[b].state == UnitState::Succeeded);

        // Reuse the previous aggregate when nothing ran and the stored
        // record still matches this branch list.
        if !any_executed {
            if let Some(record) = ctx.meta.get(name) {
                if record.outcome.is_success()
                    && record.fingerprint == fingerprint
                    && record.branches.as_deref() == Some(&branches[..])
                {
                    self.skip_unit(state, ctx, name);
                    return Ok(());
                }
            }
        }

        let mut branch_values = Vec::with_capacity(branches.len());
        for branch in &branches {
            branch_values.push(self.value_of(state, ctx, branch).await?);
        }
        let value = aggregate(def.target.iteration, branch_values);
        let location = ctx.store.store(name, &value, def.target.format).await?;

        let uses_sample = def
            .target
            .pattern
            .as_ref()
            .map(PatternSpec::uses_sample)
            .unwrap_or(false);
        let mut record = Record::new(name, fingerprint)
            .with_location(location)
            .with_branches(branches.clone());
        if uses_sample {
            record.seed = Some(self.run_seed);
        }
        ctx.meta.put(record);
        ctx.meta.prune_branches(name, &branches);

        state.values.insert(name.to_string(), value);
        let unit = state.units.get_mut(name).unwrap();
        unit.state = UnitState::Succeeded;
        ctx.bus.emit(RunEvent::UnitCompleted {
            run_id: ctx.run_id,
            unit: name.to_string(),
            duration_ms: 0,
            timestamp: Utc::now(),
        });
        self.release_transients(state, ctx);
        Ok(())
    }

    /// Value of a terminal unit, loading the persisted copy when it is
    /// not cached (skipped upstream or dropped transient).
    async fn value_of(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
    ) -> Result<Value, PipelineError> {
        if let Some(value) = state.values.get(name) {
            return Ok(value.clone());
        }
        let location = self.location_of(ctx, name)?;
        let format = ctx
            .registry
            .get(&state.units[name].parent)
            .map(|d| d.target.format)
            .unwrap_or(Format::Json);
        let value = ctx.store.load(&location, format).await?;
        state.values.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn location_of(&self, ctx: &ExecCtx<'_>, name: &str) -> Result<String, PipelineError> {
        ctx.meta
            .get(name)
            .and_then(|r| r.location)
            .ok_or_else(|| {
                PipelineError::Execution(format!("no persisted value recorded for '{name}'"))
            })
    }

    async fn handle_result(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        result: UnitResult,
    ) -> Result<(), PipelineError> {
        state.running -= 1;
        let name = result.name.clone();

        match result.outcome {
            Ok(value) => {
                self.complete_unit(state, ctx, &name, value, result.location, result.duration_ms)
                    .await?
            }
            Err(e) => {
                tracing::error!("Unit {name} failed: {e}");
                self.fail_unit(state, ctx, &name, &e)?;
            }
        }
        self.release_transients(state, ctx);
        Ok(())
    }

    async fn complete_unit(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
        value: Value,
        worker_location: Option<String>,
        duration_ms: u64,
    ) -> Result<(), PipelineError> {
        let def = ctx
            .registry
            .get(&state.unit(name).parent)
            .expect("unit has a target");
        let mut fingerprint = state.units[name]
            .fingerprint
            .clone()
            .expect("dispatched unit has a fingerprint");

        // File targets produce an ordered list of paths; fingerprint
        // the current content of each before recording.
        let mut file_digests = None;
        if def.target.format == Format::File {
            let paths = match paths_of(&value) {
                Some(paths) => paths,
                None => {
                    let e = TargetError::ExecutionFailed(
                        "file target must produce an array of paths".to_string(),
                    );
                    return self.fail_unit(state, ctx, name, &e);
                }
            };
            let digests = match MetadataStore::current_file_digests(&paths) {
                Ok(digests) => digests,
                Err(e) => return self.fail_unit(state, ctx, name, &e),
            };
            let dep_fps: Vec<&Fingerprint> = state.units[name]
                .deps
                .iter()
                .map(|d| state.units[d].fingerprint.as_ref().unwrap())
                .collect();
            let digest_values: Vec<String> = digests.iter().map(|(_, d)| d.clone()).collect();
            fingerprint = Fingerprint::of_target(&def.target.command, &dep_fps, &digest_values);
            file_digests = Some(digests);
        }

        let location = match worker_location {
            Some(location) => location,
            None => ctx.store.store(name, &value, def.target.format).await?,
        };

        let mut record = Record::new(name, fingerprint.clone())
            .with_location(location)
            .with_duration(duration_ms);
        record.file_digests = file_digests;
        ctx.meta.put(record);

        let unit = state.units.get_mut(name).unwrap();
        unit.fingerprint = Some(fingerprint);
        unit.state = UnitState::Succeeded;
        state.values.insert(name.to_string(), value);

        tracing::info!("Unit {name} completed in {duration_ms}ms");
        ctx.bus.emit(RunEvent::UnitCompleted {
            run_id: ctx.run_id,
            unit: name.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Record a failure durably, mark the unit failed, and cascade
    /// according to the owning target's error policy.
    fn fail_unit(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        name: &str,
        error: &TargetError,
    ) -> Result<(), PipelineError> {
        let parent = state.unit(name).parent.clone();
        let def = ctx.registry.get(&parent).expect("unit has a target");

        let fp = state.units[name]
            .fingerprint
            .clone()
            .unwrap_or_else(|| Fingerprint::of_parts([name.as_bytes()]));
        ctx.meta
            .record_failure(name, fp, error_kind(error), &error.to_string());

        {
            let unit = state.units.get_mut(name).unwrap();
            unit.state = UnitState::Failed;
            unit.error = Some(error.to_string());
        }
        ctx.bus.emit(RunEvent::UnitFailed {
            run_id: ctx.run_id,
            unit: name.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        let descendants: HashSet<String> = if matches!(state.units[name].kind, UnitKind::Branch { .. }) {
            // A failed branch never blocks its siblings: only the
            // owning pattern (and its dependents) are affected, and
            // the shell itself fails when all branches are terminal.
            match def.target.error_policy {
                pipecore::ErrorPolicy::Continue => HashSet::new(),
                pipecore::ErrorPolicy::Stop => {
                    let mut set = ctx.graph.descendants(&parent);
                    set.insert(parent.clone());
                    set
                }
            }
        } else {
            ctx.graph.descendants(&parent)
        };

        match def.target.error_policy {
            pipecore::ErrorPolicy::Continue => {
                self.cascade_failure(state, ctx, name, &descendants);
            }
            pipecore::ErrorPolicy::Stop => {
                tracing::warn!("Stop policy: halting run after failure of {name}");
                self.cascade_failure(state, ctx, name, &descendants);
                state.stopped = true;
                ctx.cancellation.cancel();
            }
        }
        Ok(())
    }

    /// Transition every not-yet-started unit in `targets` (and their
    /// live branches) directly to failed, without running them.
    fn cascade_failure(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        origin: &str,
        targets: &HashSet<String>,
    ) {
        let message = format!("upstream failed: {origin}");
        let affected: Vec<String> = state
            .scan
            .iter()
            .filter(|n| {
                let unit = &state.units[n.as_str()];
                if unit.state.is_terminal() || unit.state == UnitState::Running {
                    return false;
                }
                targets.contains(&unit.parent)
            })
            .cloned()
            .collect();

        for name in affected {
            let error = TargetError::UpstreamFailed(origin.to_string());
            let fp = state.units[&name]
                .fingerprint
                .clone()
                .unwrap_or_else(|| Fingerprint::of_parts([name.as_bytes()]));
            ctx.meta
                .record_failure(&name, fp, error_kind(&error), &message);
            let unit = state.units.get_mut(&name).unwrap();
            unit.state = UnitState::Failed;
            unit.error = Some(message.clone());
            ctx.bus.emit(RunEvent::UnitFailed {
                run_id: ctx.run_id,
                unit: name.clone(),
                error: message.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Structural errors abort the run before any branch executes.
    fn structural_failure(
        &self,
        state: &mut RunState,
        ctx: &ExecCtx<'_>,
        pattern: &str,
        error: PatternError,
    ) -> PipelineError {
        tracing::error!("Structural error in {pattern}: {error}");
        let fp = Fingerprint::of_parts([pattern.as_bytes()]);
        ctx.meta
            .record_failure(pattern, fp, "PatternError", &error.to_string());
        if let Some(unit) = state.units.get_mut(pattern) {
            unit.state = UnitState::Failed;
            unit.error = Some(error.to_string());
        }
        ctx.cancellation.cancel();
        PipelineError::Pattern(error)
    }

    /// Drop cached values of transient targets once every unit that
    /// reads them is terminal. The persisted copy remains.
    fn release_transients(&self, state: &mut RunState, ctx: &ExecCtx<'_>) {
        let cached: Vec<String> = state.values.keys().cloned().collect();
        for name in cached {
            let Some(def) = ctx.registry.get(&state.units[&name].parent) else {
                continue;
            };
            if def.target.memory != Memory::Transient {
                continue;
            }
            let still_needed = state.scan.iter().any(|n| {
                let unit = &state.units[n.as_str()];
                !unit.state.is_terminal() && unit.deps.iter().any(|d| d == &name)
            });
            if !still_needed && state.units[&name].state.is_terminal() {
                tracing::debug!("Releasing transient value of {name}");
                state.values.remove(&name);
            }
        }
    }
}

struct ExecCtx<'a> {
    registry: &'a PipelineRegistry,
    graph: &'a DependencyGraph,
    meta: &'a MetadataStore,
    store: Arc<dyn StorageAdapter>,
    bus: &'a EventBus,
    pool: Arc<dyn WorkerPool>,
    results_tx: mpsc::Sender<UnitResult>,
    cancellation: CancellationToken,
    run_id: RunId,
}

fn failed_dep_of(state: &RunState, name: &str) -> String {
    state.units[name]
        .deps
        .iter()
        .find(|d| state.units[d.as_str()].state == UnitState::Failed)
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

fn paths_of(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn error_kind(error: &TargetError) -> &'static str {
    match error {
        TargetError::MissingInput(_) | TargetError::InvalidInputType { .. } => "InputError",
        TargetError::ExecutionFailed(_) => "TargetRuntimeError",
        TargetError::StaleFile(_) => "StaleFile",
        TargetError::UpstreamFailed(_) => "UpstreamFailed",
        TargetError::Timeout { .. } => "Timeout",
        TargetError::Cancelled => "Cancelled",
        TargetError::Storage(_) => "StorageError",
    }
}
