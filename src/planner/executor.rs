//! Plan executor.
//!
//! This module walks a plan's step DAG and drives providers. Independent
//! steps run concurrently on a `JoinSet`, bounded by a semaphore; a step
//! starts only after every step it depends on succeeded. Every success is
//! journaled for rollback and committed to the state store before its
//! dependents are released. A failed commit fails the step and stops the
//! run; in-flight operations are always awaited.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, Result, StepFailure, StrataError};
use crate::provider::{
    Operation, OperationDriver, ProviderOutput, ProviderRegistry, ProviderSchema, ReplacementStrategy,
    ResourceProvider,
};
use crate::resolver::{ResolveContext, Resolver};
use crate::state::{LeaseInfo, PhysicalResource, StateSnapshot, StateStore};
use crate::template::{DeletionPolicy, Properties};

use super::plan::{ExecutionStep, Plan, StateLookup, StepOperation};
use super::rollback::JournalEntry;

/// What to do with the rest of the plan after a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Issue no further operations.
    #[default]
    StopOnFirstFailure,
    /// Keep running steps that do not depend on the failed one.
    ContinueIndependent,
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopOnFirstFailure => write!(f, "stop-on-first-failure"),
            Self::ContinueIndependent => write!(f, "continue-independent"),
        }
    }
}

/// A step that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Step index.
    pub step: usize,
    /// Logical resource name.
    pub logical_name: String,
    /// Operation performed.
    pub operation: StepOperation,
    /// Physical id after the step, if the resource still exists.
    pub physical_id: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Completed steps, in completion order.
    pub completed: Vec<StepResult>,
    /// Failed steps.
    pub failures: Vec<StepFailure>,
    /// Resources whose steps never started.
    pub skipped: Vec<String>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Journal of successful steps, for rollback.
    pub journal: Vec<JournalEntry>,
    /// Applied records after the run.
    pub resources: BTreeMap<String, PhysicalResource>,
}

impl ExecutionReport {
    /// Returns true if every step completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && !self.cancelled && self.skipped.is_empty()
    }
}

/// Owned form of a provider call, movable into a task.
#[derive(Debug, Clone)]
enum Call {
    Create {
        properties: Properties,
    },
    Update {
        physical_id: String,
        previous: Properties,
        properties: Properties,
    },
    Delete {
        physical_id: String,
    },
}

impl Call {
    fn operation<'a>(&'a self, logical_name: &'a str) -> Operation<'a> {
        match self {
            Self::Create { properties } => Operation::Create {
                logical_name,
                properties,
            },
            Self::Update {
                physical_id,
                previous,
                properties,
            } => Operation::Update {
                physical_id,
                previous,
                properties,
            },
            Self::Delete { physical_id } => Operation::Delete { physical_id },
        }
    }

    fn properties(&self) -> Option<&Properties> {
        match self {
            Self::Create { properties } | Self::Update { properties, .. } => Some(properties),
            Self::Delete { .. } => None,
        }
    }
}

enum Prepared {
    /// Completes without a provider call.
    Immediate,
    /// An update whose properties re-resolved to what is already applied.
    Unchanged,
    /// Needs a provider call.
    Call {
        provider: Arc<dyn ResourceProvider>,
        schema: ProviderSchema,
        call: Call,
    },
}

enum StepOutcome {
    Done(ProviderOutput),
    Failed(ProviderError),
    Skipped,
}

/// Mutable bookkeeping of a run.
struct Progress {
    live: BTreeMap<String, PhysicalResource>,
    /// Pre-plan records of replaced resources.
    replaced: BTreeMap<String, PhysicalResource>,
    report: ExecutionReport,
}

/// Executor for plans.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    registry: Arc<ProviderRegistry>,
    schemas: Arc<BTreeMap<String, ProviderSchema>>,
    driver: OperationDriver,
    max_workers: usize,
    failure_mode: FailureMode,
    cancel: CancellationToken,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, schemas: Arc<BTreeMap<String, ProviderSchema>>) -> Self {
        Self {
            registry,
            schemas,
            driver: OperationDriver::default(),
            max_workers: 4,
            failure_mode: FailureMode::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the maximum number of concurrent provider operations.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub const fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Sets the operation driver.
    #[must_use]
    pub const fn with_driver(mut self, driver: OperationDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan against the prior snapshot it was computed from.
    ///
    /// Failures of steps, state commits and step tasks are all reported, not
    /// returned; the caller decides whether to roll back.
    pub async fn execute(
        &self,
        plan: &Plan,
        prior: &StateSnapshot,
        store: &dyn StateStore,
        lease: &LeaseInfo,
    ) -> ExecutionReport {
        let steps = &plan.steps;
        info!(
            "Executing plan with {} steps ({} workers, {})",
            steps.len(),
            self.max_workers,
            self.failure_mode
        );

        let mut waiting: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for step in steps {
            for &dep in &step.depends_on {
                dependents[dep].push(step.id);
            }
        }
        let mut ready: BinaryHeap<Reverse<usize>> =
            waiting.iter().enumerate().filter(|(_, n)| **n == 0).map(|(i, _)| Reverse(i)).collect();
        let mut started = vec![false; steps.len()];

        let mut progress = Progress {
            live: prior.resources.clone(),
            replaced: plan
                .actions
                .iter()
                .filter(|a| a.strategy.is_some())
                .filter_map(|a| prior.get(&a.logical_name).map(|r| (a.logical_name.clone(), r.clone())))
                .collect(),
            report: ExecutionReport::default(),
        };

        let halt = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_workers.max(1)));
        let mut join_set: JoinSet<(usize, Call, StepOutcome)> = JoinSet::new();

        loop {
            while !halt.is_cancelled() {
                let Some(Reverse(id)) = ready.pop() else {
                    break;
                };
                let step = &steps[id];
                started[id] = true;

                match self.prepare(plan, step, &progress) {
                    Ok(Prepared::Immediate) => {
                        match self
                            .record(plan, step, None, ProviderOutput::default(), &mut progress, store, lease)
                            .await
                        {
                            Ok(()) => release(id, &dependents, &mut waiting, &mut ready),
                            Err(e) => self.fail_commit(step, &e, &mut progress, &halt),
                        }
                    }
                    Ok(Prepared::Unchanged) => {
                        debug!("{} re-resolved to its applied properties, nothing to update", step.logical_name);
                        release(id, &dependents, &mut waiting, &mut ready);
                    }
                    Ok(Prepared::Call { provider, schema, call }) => {
                        info!("Starting {} of {}", step.operation, step.logical_name);
                        let semaphore = Arc::clone(&semaphore);
                        let halt = halt.clone();
                        let driver = self.driver;
                        let name = step.logical_name.clone();
                        let resource_type = step.resource_type.clone();

                        join_set.spawn(async move {
                            let Ok(_permit) = semaphore.acquire_owned().await else {
                                return (id, call, StepOutcome::Skipped);
                            };
                            if halt.is_cancelled() {
                                return (id, call, StepOutcome::Skipped);
                            }
                            let outcome = match driver
                                .run(provider.as_ref(), &resource_type, &schema, &name, call.operation(&name))
                                .await
                            {
                                Ok(output) => StepOutcome::Done(output),
                                Err(e) => StepOutcome::Failed(e),
                            };
                            (id, call, outcome)
                        });
                    }
                    Err(message) => self.fail(step, message, &mut progress, &halt),
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (id, call, outcome) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    error!("Step task failed: {}", e);
                    progress.report.failures.push(StepFailure {
                        resource: String::from("executor"),
                        operation: String::from("join"),
                        message: e.to_string(),
                    });
                    halt.cancel();
                    continue;
                }
            };
            let step = &steps[id];

            match outcome {
                StepOutcome::Done(output) => {
                    info!("Finished {} of {}", step.operation, step.logical_name);
                    match self
                        .record(plan, step, Some(&call), output, &mut progress, store, lease)
                        .await
                    {
                        Ok(()) => release(id, &dependents, &mut waiting, &mut ready),
                        Err(e) => self.fail_commit(step, &e, &mut progress, &halt),
                    }
                }
                StepOutcome::Failed(e) => self.fail(step, e.to_string(), &mut progress, &halt),
                StepOutcome::Skipped => {
                    debug!("Skipped {} of {}", step.operation, step.logical_name);
                    started[id] = false;
                }
            }
        }

        let mut report = progress.report;
        report.cancelled = self.cancel.is_cancelled();
        for step in steps.iter().filter(|s| !started[s.id]) {
            if !report.skipped.contains(&step.logical_name) {
                report.skipped.push(step.logical_name.clone());
            }
        }
        if !report.skipped.is_empty() {
            warn!("Not started: {}", report.skipped.join(", "));
        }
        report.resources = progress.live;
        report
    }

    /// Works out the provider call for a step, re-resolving properties
    /// against the records applied so far.
    fn prepare(&self, plan: &Plan, step: &ExecutionStep, progress: &Progress) -> std::result::Result<Prepared, String> {
        let name = step.logical_name.as_str();

        let call = match step.operation {
            StepOperation::Delete { retain: true } => return Ok(Prepared::Immediate),
            StepOperation::Delete { retain: false } => {
                let record = progress.live.get(name).ok_or_else(|| format!("{name} is not in state"))?;
                Call::Delete {
                    physical_id: record.physical_id.clone(),
                }
            }
            StepOperation::DeleteReplaced => {
                let record = progress
                    .replaced
                    .get(name)
                    .ok_or_else(|| format!("no prior record of {name}"))?;
                Call::Delete {
                    physical_id: record.physical_id.clone(),
                }
            }
            StepOperation::Create | StepOperation::CreateReplacement => Call::Create {
                properties: Self::desired(plan, name, progress)?,
            },
            StepOperation::Update => {
                let record = progress.live.get(name).ok_or_else(|| format!("{name} is not in state"))?;
                let properties = Self::desired(plan, name, progress)?;
                if properties == record.properties {
                    return Ok(Prepared::Unchanged);
                }
                Call::Update {
                    physical_id: record.physical_id.clone(),
                    previous: record.properties.clone(),
                    properties,
                }
            }
        };

        let provider = self
            .registry
            .provider_for(name, &step.resource_type)
            .map_err(|e| e.to_string())?;
        let schema = self.schemas.get(&step.resource_type).cloned().unwrap_or_default();
        Ok(Prepared::Call { provider, schema, call })
    }

    fn desired(plan: &Plan, name: &str, progress: &Progress) -> std::result::Result<Properties, String> {
        let ctx = plan
            .context
            .as_ref()
            .ok_or_else(|| String::from("plan has no resolution context"))?;
        let decl = ctx.template.resource(name).ok_or_else(|| format!("{name} is not declared"))?;
        let lookup = StateLookup::new(&ctx.template, &ctx.graph, &progress.live);
        let resolve = ResolveContext {
            parameters: &ctx.parameters,
            conditions: &ctx.conditions,
            pseudo: &ctx.pseudo,
            resources: &lookup,
        };
        let properties = Resolver::new(resolve)
            .resolve_properties(&format!("Resources.{name}.Properties"), &decl.properties)
            .map_err(|e| e.to_string())?;

        if let Some((field, _)) = properties.iter().find(|(_, v)| !v.is_known()) {
            return Err(format!("{field} is still unknown at execution time"));
        }
        Ok(properties)
    }

    /// Journals a finished step, then commits it to the state store.
    ///
    /// The journal entry and the live view are updated before the store is
    /// written, so a failed commit still leaves rollback a complete record of
    /// what the provider did.
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        plan: &Plan,
        step: &ExecutionStep,
        call: Option<&Call>,
        output: ProviderOutput,
        progress: &mut Progress,
        store: &dyn StateStore,
        lease: &LeaseInfo,
    ) -> Result<()> {
        let name = step.logical_name.as_str();
        let properties = call.and_then(Call::properties).cloned().unwrap_or_default();

        let (entry, write) = match step.operation {
            StepOperation::Create | StepOperation::CreateReplacement => {
                let physical_id = output
                    .physical_id
                    .ok_or_else(|| StrataError::internal(format!("create of {name} returned no physical id")))?;
                let created = new_record(plan, step, physical_id, properties, output.attributes);

                let entry = if step.operation == StepOperation::Create {
                    JournalEntry::Created { record: created.clone() }
                } else {
                    let previous = progress
                        .replaced
                        .get(name)
                        .cloned()
                        .ok_or_else(|| StrataError::internal(format!("no prior record of {name}")))?;
                    JournalEntry::ReplacementCreated {
                        previous,
                        created: created.clone(),
                        previous_deleted: delete_before_create(plan, name),
                    }
                };
                (entry, Write::Commit(created))
            }
            StepOperation::Update => {
                let previous = progress
                    .live
                    .get(name)
                    .cloned()
                    .ok_or_else(|| StrataError::internal(format!("{name} is not in state")))?;
                let mut applied = new_record(
                    plan,
                    step,
                    output.physical_id.unwrap_or_else(|| previous.physical_id.clone()),
                    properties,
                    output.attributes,
                );
                if applied.attributes.is_empty() {
                    applied.attributes = previous.attributes.clone();
                }
                applied.created_at = previous.created_at;
                (
                    JournalEntry::Updated {
                        previous,
                        applied: applied.clone(),
                    },
                    Write::Commit(applied),
                )
            }
            StepOperation::DeleteReplaced => {
                let previous = progress
                    .replaced
                    .get(name)
                    .cloned()
                    .ok_or_else(|| StrataError::internal(format!("no prior record of {name}")))?;
                let before_create = delete_before_create(plan, name);
                let write = if before_create { Write::Remove } else { Write::None };
                (JournalEntry::ReplacedDeleted { previous, before_create }, write)
            }
            StepOperation::Delete { retain } => {
                let previous = progress
                    .live
                    .get(name)
                    .cloned()
                    .ok_or_else(|| StrataError::internal(format!("{name} is not in state")))?;
                if retain {
                    info!("Retaining {} ({})", name, previous.physical_id);
                }
                (
                    JournalEntry::Deleted {
                        previous,
                        retained: retain,
                    },
                    Write::Remove,
                )
            }
        };

        progress.report.journal.push(entry);
        match write {
            Write::Commit(record) => {
                progress.live.insert(name.to_string(), record.clone());
                store.commit(lease, record).await?;
            }
            Write::Remove => {
                progress.live.remove(name);
                store.remove(lease, name).await?;
            }
            Write::None => {}
        }

        progress.report.completed.push(StepResult {
            step: step.id,
            logical_name: name.to_string(),
            operation: step.operation,
            physical_id: progress.live.get(name).map(|r| r.physical_id.clone()),
        });
        Ok(())
    }

    fn fail(&self, step: &ExecutionStep, message: String, progress: &mut Progress, halt: &CancellationToken) {
        error!("{} of {} failed: {}", step.operation, step.logical_name, message);
        progress.report.failures.push(StepFailure {
            resource: step.logical_name.clone(),
            operation: step.operation.to_string(),
            message,
        });
        if self.failure_mode == FailureMode::StopOnFirstFailure {
            halt.cancel();
        }
    }

    /// State can no longer be trusted to match the provider, so no further
    /// step starts whatever the failure mode.
    fn fail_commit(&self, step: &ExecutionStep, e: &StrataError, progress: &mut Progress, halt: &CancellationToken) {
        self.fail(step, format!("recording state failed: {e}"), progress, halt);
        halt.cancel();
    }
}

/// State write that follows a journaled step.
enum Write {
    Commit(PhysicalResource),
    Remove,
    None,
}

fn release(id: usize, dependents: &[Vec<usize>], waiting: &mut [usize], ready: &mut BinaryHeap<Reverse<usize>>) {
    for &dependent in &dependents[id] {
        waiting[dependent] -= 1;
        if waiting[dependent] == 0 {
            ready.push(Reverse(dependent));
        }
    }
}

fn delete_before_create(plan: &Plan, name: &str) -> bool {
    plan.action(name)
        .and_then(|a| a.strategy)
        .is_some_and(|s| s == ReplacementStrategy::DeleteBeforeCreate)
}

fn new_record(
    plan: &Plan,
    step: &ExecutionStep,
    physical_id: String,
    properties: Properties,
    attributes: Properties,
) -> PhysicalResource {
    let name = step.logical_name.as_str();
    let ctx = plan.context.as_ref();
    let decl = ctx.and_then(|c| c.template.resource(name));
    let now = Utc::now();

    PhysicalResource {
        logical_name: name.to_string(),
        resource_type: step.resource_type.clone(),
        physical_id,
        properties,
        attributes,
        dependencies: ctx.map(|c| c.graph.dependencies_of(name)).unwrap_or_default(),
        index: ctx.and_then(|c| c.template.resource_index(name)).unwrap_or_default(),
        deletion_policy: decl.map_or(DeletionPolicy::Delete, |d| d.deletion_policy),
        created_at: now,
        updated_at: now,
    }
}
