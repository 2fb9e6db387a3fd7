//! Provisioning engine.
//!
//! The engine ties the pieces together: it loads the prior snapshot, asks
//! providers for their schemas, plans, takes the state lease, executes the
//! plan, rolls back on failure and records outputs and history.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, StateBackend};
use crate::error::{ExecutionError, Result, StepFailure, StrataError};
use crate::planner::{
    ExecutionReport, FailureMode, Plan, PlanExecutor, PlanKind, PlanSummary, Planner, Rollback, StepResult,
};
use crate::provider::{OperationDriver, ProviderRegistry, ProviderSchema, SandboxProvider};
use crate::resolver::PseudoParameters;
use crate::state::{
    HistoryEntry, HistoryOperation, LeaseInfo, LocalStateStore, MemoryStateStore, StateSnapshot, StateStore,
    generate_holder_id,
};
use crate::template::{Template, TemplateHasher, TemplateParser, Value};

/// A parsed template and the hash of its source.
#[derive(Debug, Clone)]
pub struct LoadedTemplate {
    /// Parsed template.
    pub template: Arc<Template>,
    /// Hash of the source text.
    pub hash: String,
}

impl LoadedTemplate {
    /// Loads and parses a template file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let (template, source) = TemplateParser::new().load_file(path)?;
        Ok(Self {
            template: Arc::new(template),
            hash: TemplateHasher::new().hash_source(&source),
        })
    }

    /// Parses a template from source text.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be parsed.
    pub fn from_source(source: &str) -> Result<Self> {
        Ok(Self {
            template: Arc::new(TemplateParser::new().parse_str(source)?),
            hash: TemplateHasher::new().hash_source(source),
        })
    }
}

/// Result of a successful apply or destroy.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Apply or destroy.
    pub kind: PlanKind,
    /// What the plan contained.
    pub summary: PlanSummary,
    /// Resources changed, in completion order.
    pub changed: Vec<String>,
    /// Outputs after the run.
    pub outputs: BTreeMap<String, Value>,
    /// State version after the run.
    pub state_version: u64,
}

/// The provisioning engine.
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    pseudo: PseudoParameters,
    planner: Planner,
    driver: OperationDriver,
    max_workers: usize,
    failure_mode: FailureMode,
    cancel: CancellationToken,
    holder: String,
    schemas: Mutex<BTreeMap<String, ProviderSchema>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("backend", &self.store.backend_type())
            .field("pseudo", &self.pseudo)
            .field("max_workers", &self.max_workers)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over a provider registry and a state store.
    #[must_use]
    pub fn new(registry: ProviderRegistry, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            pseudo: PseudoParameters::default(),
            planner: Planner::new(),
            driver: OperationDriver::default(),
            max_workers: 4,
            failure_mode: FailureMode::default(),
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
            schemas: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds an engine from configuration, backed by the sandbox provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox file cannot be opened.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let pseudo = config.stack.pseudo_parameters();
        let sandbox_config = config.providers.sandbox.clone();

        let (store, sandbox) = match config.state.backend {
            StateBackend::Local => {
                let ttl = i64::try_from(config.state.lease_ttl_secs).unwrap_or(i64::MAX);
                let store: Arc<dyn StateStore> =
                    Arc::new(LocalStateStore::with_base_dir(&config.state.path).with_lease_ttl(ttl));
                (store, SandboxProvider::open(sandbox_config, pseudo.clone()).await?)
            }
            StateBackend::Memory => {
                let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
                (store, SandboxProvider::in_memory(sandbox_config, pseudo.clone()))
            }
        };
        debug!("Using {} state backend", store.backend_type());

        let registry = ProviderRegistry::new().with_fallback(Arc::new(sandbox));
        Ok(Self::new(registry, store)
            .with_pseudo(pseudo)
            .with_max_workers(config.execution.max_workers)
            .with_failure_mode(config.execution.failure_mode)
            .with_backoff_cap(Duration::from_secs(config.execution.backoff_cap_secs)))
    }

    /// Sets the pseudo-parameters.
    #[must_use]
    pub fn with_pseudo(mut self, pseudo: PseudoParameters) -> Self {
        self.pseudo = pseudo;
        self
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

    /// Sets the upper bound on poll intervals.
    #[must_use]
    pub const fn with_backoff_cap(mut self, backoff_cap: Duration) -> Self {
        self.driver = OperationDriver::new(backoff_cap);
        self
    }

    /// Sets the lease holder name.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Token that cancels in-flight applies when triggered.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Validates a template without looking at state.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub async fn validate(&self, loaded: &LoadedTemplate, overrides: &BTreeMap<String, String>) -> Result<Plan> {
        self.plan_against(loaded, overrides, &StateSnapshot::new()).await
    }

    /// Plans against the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or validation fails.
    pub async fn plan(&self, loaded: &LoadedTemplate, overrides: &BTreeMap<String, String>) -> Result<Plan> {
        let prior = self.store.load().await?;
        self.plan_against(loaded, overrides, &prior).await
    }

    /// Plans against a given snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider schema cannot be fetched or validation
    /// fails.
    pub async fn plan_against(
        &self,
        loaded: &LoadedTemplate,
        overrides: &BTreeMap<String, String>,
        prior: &StateSnapshot,
    ) -> Result<Plan> {
        let types = loaded.template.resources.iter().map(|(name, r)| (name.as_str(), r.resource_type.as_str()));
        let schemas = self.schemas_for(types).await?;
        let plan = self.planner.plan(
            Arc::clone(&loaded.template),
            &loaded.hash,
            overrides,
            &self.pseudo,
            prior,
            &schemas,
        )?;
        Ok(plan)
    }

    /// Plans and applies a template.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any provider call, a
    /// `ConcurrentModification` if another run holds the state, or an
    /// execution error after rollback.
    pub async fn apply(&self, loaded: &LoadedTemplate, overrides: &BTreeMap<String, String>) -> Result<ApplyReport> {
        let plan = self.plan(loaded, overrides).await?;
        self.apply_plan(&plan).await
    }

    /// Plans deleting every resource in state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let prior = self.store.load().await?;
        Ok(self.planner.plan_destroy(&prior))
    }

    /// Deletes every resource in state.
    ///
    /// # Errors
    ///
    /// Same as [`apply_plan`](Self::apply_plan).
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let plan = self.plan_destroy().await?;
        self.apply_plan(&plan).await
    }

    /// Executes a plan under the state lease.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentModification` if state moved since the plan was
    /// computed, `RolledBack` if a step failed and rollback restored the
    /// prior state, or `RollbackIncomplete` otherwise.
    pub async fn apply_plan(&self, plan: &Plan) -> Result<ApplyReport> {
        let lease = self.store.begin(&self.holder, plan.state_version).await?;
        info!("Acquired state lease {} at version {}", lease.lease_id, lease.version);

        let result = self.run(plan, &lease).await;

        if let Err(e) = self.store.release(&lease).await {
            warn!("Failed to release state lease: {}", e);
        }
        result
    }

    /// Outputs recorded by the last successful apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.store.load().await?.outputs)
    }

    /// Runs a plan under a held lease.
    ///
    /// Errors before the first provider call keep their own kind. Once
    /// execution has started, every failure ends in a rollback and surfaces
    /// as `RolledBack` or `RollbackIncomplete`.
    async fn run(&self, plan: &Plan, lease: &LeaseInfo) -> Result<ApplyReport> {
        let prior = self.store.load().await?;
        let types = plan
            .steps
            .iter()
            .map(|s| (s.logical_name.as_str(), s.resource_type.as_str()))
            .chain(prior.resources.values().map(|r| (r.logical_name.as_str(), r.resource_type.as_str())));
        let schemas = Arc::new(self.schemas_for(types).await?);

        let executor = PlanExecutor::new(Arc::clone(&self.registry), Arc::clone(&schemas))
            .with_driver(self.driver)
            .with_max_workers(self.max_workers)
            .with_failure_mode(self.failure_mode)
            .with_cancellation(self.cancel.clone());
        let mut report = executor.execute(plan, &prior, self.store.as_ref(), lease).await;

        let operation = match plan.kind {
            PlanKind::Apply => HistoryOperation::Apply,
            PlanKind::Destroy => HistoryOperation::Destroy,
        };
        let changed: Vec<String> = report.completed.iter().map(|s: &StepResult| s.logical_name.clone()).collect();

        if report.succeeded() {
            match self.finish(plan, lease, operation, &report, changed.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e) => {
                    error!("Recording the {} failed: {}", operation, e);
                    report.failures.push(StepFailure {
                        resource: String::from("state"),
                        operation: String::from("finalize"),
                        message: e.to_string(),
                    });
                }
            }
        }

        error!(
            "{} failed ({} failures{}), rolling back",
            operation,
            report.failures.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        let rollback = Rollback::new(&self.registry, &schemas, self.driver)
            .run(&report.journal, self.store.as_ref(), lease)
            .await;

        let message = report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.resource, f.message))
            .chain(report.cancelled.then(|| String::from("cancelled")))
            .collect::<Vec<_>>()
            .join("; ");
        let entry = HistoryEntry::new(HistoryOperation::Rollback, plan.template_hash.as_str(), changed).failed(message);
        if let Err(e) = self.store.finalize(lease, None, None, entry).await {
            warn!("Failed to record rollback history: {}", e);
        }

        if rollback.is_complete() {
            Err(StrataError::Execution(ExecutionError::RolledBack {
                failures: report.failures,
                cancelled: report.cancelled,
            }))
        } else {
            Err(StrataError::Execution(ExecutionError::RollbackIncomplete {
                failures: report.failures,
                rollback_failures: rollback.failures,
                indeterminate: rollback.indeterminate,
            }))
        }
    }

    /// Resolves outputs and records them with a history entry.
    async fn finish(
        &self,
        plan: &Plan,
        lease: &LeaseInfo,
        operation: HistoryOperation,
        report: &ExecutionReport,
        changed: Vec<String>,
    ) -> Result<ApplyReport> {
        let outputs = match &plan.context {
            Some(ctx) => ctx.outputs(&report.resources)?,
            None => BTreeMap::new(),
        };
        let entry = HistoryEntry::new(operation, plan.template_hash.as_str(), changed.clone());
        let hash = (plan.kind == PlanKind::Apply).then_some(plan.template_hash.as_str());
        let state_version = self.store.finalize(lease, Some(outputs.clone()), hash, entry).await?;

        info!("{} complete: {} steps", operation, changed.len());
        Ok(ApplyReport {
            kind: plan.kind,
            summary: plan.summary(),
            changed,
            outputs,
            state_version,
        })
    }

    /// Fetches provider schemas, caching them for the life of the engine.
    async fn schemas_for<'n>(
        &self,
        resources: impl Iterator<Item = (&'n str, &'n str)>,
    ) -> Result<BTreeMap<String, ProviderSchema>> {
        let mut cache = self.schemas.lock().await;
        let mut out = BTreeMap::new();
        for (name, resource_type) in resources {
            if out.contains_key(resource_type) {
                continue;
            }
            if let Some(schema) = cache.get(resource_type) {
                out.insert(resource_type.to_string(), schema.clone());
                continue;
            }
            let provider = self.registry.provider_for(name, resource_type)?;
            let schema = provider.describe_schema(resource_type).await?;
            debug!("Fetched schema for {}", resource_type);
            cache.insert(resource_type.to_string(), schema.clone());
            out.insert(resource_type.to_string(), schema);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StateError, ValidationError};
    use crate::provider::testing::ScriptedProvider;
    use crate::provider::{MockResourceProvider, ReplacementStrategy};
    use crate::planner::ActionKind;
    use crate::state::PhysicalResource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STACK: &str = r"
Parameters:
  Port: { Type: Number, Default: 80 }
  EnableLogs: { Type: String, Default: 'false', AllowedValues: ['true', 'false'] }
Conditions:
  Logs: !Equals [!Ref EnableLogs, 'true']
Resources:
  TargetGroup:
    Type: Test::Target::Group
    Properties:
      Port: !Ref Port
  LogBucket:
    Type: Test::Storage::Bucket
    Condition: Logs
  LoadBalancer:
    Type: Test::Load::Balancer
    Properties:
      LogBucket: !If [Logs, !Ref LogBucket, !Ref AWS::NoValue]
  Listener:
    Type: Test::Load::Listener
    Properties:
      LoadBalancerArn: !GetAtt LoadBalancer.Arn
      TargetGroupArn: !GetAtt TargetGroup.Arn
Outputs:
  TargetGroupPort:
    Value: !GetAtt TargetGroup.Port
";

    fn setup() -> (Engine, Arc<ScriptedProvider>, Arc<MemoryStateStore>) {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let registry = ProviderRegistry::new().with_fallback(provider.clone());
        let engine = Engine::new(registry, store.clone()).with_max_workers(2);
        (engine, provider, store)
    }

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn stack() -> LoadedTemplate {
        LoadedTemplate::from_source(STACK).unwrap()
    }

    #[tokio::test]
    async fn test_default_port_creates_target_group_and_output() {
        let (engine, provider, store) = setup();

        let plan = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        let target_group = plan.action("TargetGroup").unwrap();
        assert_eq!(target_group.kind, ActionKind::Create);
        assert_eq!(target_group.after.as_ref().unwrap()["Port"], Value::integer(80));

        let report = engine.apply_plan(&plan).await.unwrap();
        assert_eq!(report.outputs["TargetGroupPort"], Value::integer(80));
        assert_eq!(provider.live_names(), ["Listener", "LoadBalancer", "TargetGroup"]);

        let state = store.load().await.unwrap();
        assert_eq!(state.resources.len(), 3);
        assert_eq!(state.outputs["TargetGroupPort"], Value::integer(80));
        assert!(state.history.last().unwrap().success);
        assert!(store.lease_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop_with_zero_provider_operations() {
        let (engine, provider, _store) = setup();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        provider.clear_calls();

        let plan = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.summary().unchanged, 3);

        engine.apply_plan(&plan).await.unwrap();
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_noop_apply_never_calls_crud_operations() {
        let (seed, _provider, store) = setup();
        seed.apply(&stack(), &BTreeMap::new()).await.unwrap();

        let mut mock = MockResourceProvider::new();
        mock.expect_describe_schema()
            .returning(|_| Ok(ProviderSchema::default()));
        mock.expect_create().times(0);
        mock.expect_update().times(0);
        mock.expect_delete().times(0);
        mock.expect_poll().times(0);

        let engine = Engine::new(ProviderRegistry::new().with_fallback(Arc::new(mock)), store);
        let report = engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        assert!(report.changed.is_empty());
    }

    #[tokio::test]
    async fn test_guard_toggle_creates_then_deletes_bucket() {
        let (engine, provider, store) = setup();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        provider.clear_calls();

        let on = overrides(&[("EnableLogs", "true")]);
        engine.apply(&stack(), &on).await.unwrap();
        assert!(provider.live_names().contains(&String::from("LogBucket")));
        assert_eq!(provider.calls().first().map(String::as_str), Some("create LogBucket"));

        provider.clear_calls();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        assert!(!provider.live_names().contains(&String::from("LogBucket")));
        assert_eq!(provider.calls(), ["update LoadBalancer", "delete LogBucket"]);
        assert!(store.load().await.unwrap().get("LogBucket").is_none());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_provider_call() {
        let (engine, provider, _store) = setup();
        let cyclic = LoadedTemplate::from_source(
            r"
Resources:
  A:
    Type: Test::A::A
    Properties:
      Peer: !GetAtt B.Arn
  B:
    Type: Test::A::A
    Properties:
      Peer: !GetAtt A.Arn
",
        )
        .unwrap();

        let err = engine.apply(&cyclic, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            StrataError::Validation(ValidationError::CyclicDependency { ref resources }) if resources == &["A", "B"]
        ));
        assert_eq!(err.exit_code(), crate::error::EXIT_VALIDATION);
        assert!(provider.calls().is_empty());
    }

    const CHAIN: &str = r"
Resources:
  A:
    Type: Test::Chain::Link
  B:
    Type: Test::Chain::Link
    Properties:
      Previous: !Ref A
  C:
    Type: Test::Chain::Link
    Properties:
      Previous: !Ref B
";

    #[tokio::test]
    async fn test_failure_rolls_back_in_reverse_order() {
        let (engine, provider, store) = setup();
        provider.fail("create", "C", 1);

        let err = engine
            .apply(&LoadedTemplate::from_source(CHAIN).unwrap(), &BTreeMap::new())
            .await
            .unwrap_err();
        let StrataError::Execution(ExecutionError::RolledBack { failures, cancelled }) = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(!cancelled);
        assert_eq!(failures[0].resource, "C");
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);

        assert_eq!(
            provider.calls(),
            ["create A", "create B", "create C", "delete B", "delete A"]
        );
        assert!(provider.resources().is_empty());

        let state = store.load().await.unwrap();
        assert!(state.resources.is_empty());
        assert!(!state.history.last().unwrap().success);
        assert!(store.lease_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_indeterminate_resources() {
        let (engine, provider, store) = setup();
        provider.fail("create", "C", 1);
        provider.fail("delete", "A", u32::MAX);

        let err = engine
            .apply(&LoadedTemplate::from_source(CHAIN).unwrap(), &BTreeMap::new())
            .await
            .unwrap_err();
        let StrataError::Execution(ExecutionError::RollbackIncomplete { indeterminate, .. }) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(indeterminate, &["A"]);
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLBACK_INCOMPLETE);

        let state = store.load().await.unwrap();
        assert_eq!(state.resources.keys().collect::<Vec<_>>(), ["A"]);
    }

    #[tokio::test]
    async fn test_failed_run_reverts_completed_update() {
        let (engine, provider, store) = setup();
        let template = stack();
        engine.apply(&template, &BTreeMap::new()).await.unwrap();
        let before = store.load().await.unwrap();
        provider.clear_calls();
        provider.fail("create", "LogBucket", 1);

        let err = engine
            .apply(&template, &overrides(&[("Port", "8080"), ("EnableLogs", "true")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Execution(ExecutionError::RolledBack { .. })));
        assert_eq!(
            provider.calls(),
            ["update TargetGroup", "create LogBucket", "update TargetGroup"]
        );

        let after = store.load().await.unwrap();
        assert_eq!(after.resources.len(), before.resources.len());
        let target_group = after.get("TargetGroup").unwrap();
        assert_eq!(target_group.properties["Port"], Value::integer(80));
        assert_eq!(after.outputs, before.outputs);
        let stored = provider.resources();
        assert_eq!(stored[&target_group.physical_id].properties["Port"], Value::integer(80));
    }

    #[tokio::test]
    async fn test_continue_independent_keeps_unrelated_branches() {
        let (engine, provider, store) = setup();
        let engine = engine.with_failure_mode(FailureMode::ContinueIndependent).with_max_workers(1);
        provider.fail("create", "A", 1);

        let template = LoadedTemplate::from_source(
            r"
Resources:
  A:
    Type: Test::Chain::Link
  B:
    Type: Test::Chain::Link
    Properties:
      Previous: !Ref A
  Independent:
    Type: Test::Chain::Link
",
        )
        .unwrap();

        let err = engine.apply(&template, &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);

        let calls = provider.calls();
        assert!(calls.contains(&String::from("create Independent")));
        assert!(calls.contains(&String::from("delete Independent")));
        assert!(!calls.iter().any(|c| c.ends_with(" B")));
        assert!(store.load().await.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_issues_nothing_and_rolls_back() {
        let (engine, provider, _store) = setup();
        engine.cancellation_token().cancel();

        let err = engine.apply(&stack(), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            StrataError::Execution(ExecutionError::RolledBack { cancelled: true, .. })
        ));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let (engine, _provider, _store) = setup();
        let stale = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();

        let err = engine.apply_plan(&stale).await.unwrap_err();
        assert!(matches!(err, StrataError::State(StateError::ConcurrentModification { .. })));
        assert_eq!(err.exit_code(), crate::error::EXIT_VALIDATION);
    }

    #[tokio::test]
    async fn test_replacement_creates_before_deleting() {
        let provider = Arc::new(
            ScriptedProvider::new().with_schema("Test::Target::Group", ProviderSchema::default().with_replacement(["Port"])),
        );
        let store = Arc::new(MemoryStateStore::new());
        let engine = Engine::new(ProviderRegistry::new().with_fallback(provider.clone()), store.clone());
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        let old_id = store.load().await.unwrap().get("TargetGroup").unwrap().physical_id.clone();
        provider.clear_calls();

        let report = engine.apply(&stack(), &overrides(&[("Port", "8080")])).await.unwrap();
        assert_eq!(report.summary.replaces, 1);
        assert_eq!(report.outputs["TargetGroupPort"], Value::integer(8080));

        let calls = provider.calls();
        let create = calls.iter().position(|c| c == "create TargetGroup").unwrap();
        let delete = calls.iter().position(|c| c == "delete TargetGroup").unwrap();
        assert!(create < delete);
        assert!(calls.iter().position(|c| c == "update Listener").unwrap() < delete);

        let new_id = store.load().await.unwrap().get("TargetGroup").unwrap().physical_id.clone();
        assert_ne!(old_id, new_id);
        assert!(!provider.resources().contains_key(&old_id));
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_dependents_first() {
        let (engine, provider, store) = setup();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        provider.clear_calls();

        let report = engine.destroy().await.unwrap();
        assert_eq!(report.kind, PlanKind::Destroy);
        assert_eq!(provider.calls()[0], "delete Listener");
        assert!(provider.resources().is_empty());

        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        assert!(state.outputs.is_empty());
    }

    /// Memory store whose `fail_on`-th commit fails.
    struct FlakyStore {
        inner: MemoryStateStore,
        commits: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyStore {
        fn new(fail_on: usize) -> Self {
            Self {
                inner: MemoryStateStore::new(),
                commits: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait::async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self) -> Result<StateSnapshot> {
            self.inner.load().await
        }

        async fn begin(&self, holder: &str, expected_version: u64) -> Result<LeaseInfo> {
            self.inner.begin(holder, expected_version).await
        }

        async fn commit(&self, lease: &LeaseInfo, resource: PhysicalResource) -> Result<u64> {
            if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StateError::storage("disk full").into());
            }
            self.inner.commit(lease, resource).await
        }

        async fn remove(&self, lease: &LeaseInfo, logical_name: &str) -> Result<u64> {
            self.inner.remove(lease, logical_name).await
        }

        async fn finalize(
            &self,
            lease: &LeaseInfo,
            outputs: Option<BTreeMap<String, Value>>,
            template_hash: Option<&str>,
            entry: HistoryEntry,
        ) -> Result<u64> {
            self.inner.finalize(lease, outputs, template_hash, entry).await
        }

        async fn release(&self, lease: &LeaseInfo) -> Result<()> {
            self.inner.release(lease).await
        }

        async fn lease_info(&self) -> Result<Option<LeaseInfo>> {
            self.inner.lease_info().await
        }

        async fn force_release(&self) -> Result<()> {
            self.inner.force_release().await
        }

        fn backend_type(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_created_resources() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(FlakyStore::new(2));
        let engine = Engine::new(ProviderRegistry::new().with_fallback(provider.clone()), store.clone());

        let err = engine
            .apply(&LoadedTemplate::from_source(CHAIN).unwrap(), &BTreeMap::new())
            .await
            .unwrap_err();
        let StrataError::Execution(ExecutionError::RolledBack { failures, .. }) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(failures[0].resource, "B");
        assert!(failures[0].message.contains("disk full"));
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);

        assert_eq!(provider.calls(), ["create A", "create B", "delete B", "delete A"]);
        assert!(provider.resources().is_empty());

        let state = store.load().await.unwrap();
        assert!(state.resources.is_empty());
        assert!(!state.history.last().unwrap().success);
        assert!(store.lease_info().await.unwrap().is_none());
    }

    const PORTS: &str = r"
Parameters:
  Port: { Type: Number, Default: 80 }
Resources:
  TargetGroup:
    Type: Test::Target::Group
    Properties:
      Port: !Ref Port
  Listener:
    Type: Test::Load::Listener
    Properties:
      Port: !GetAtt TargetGroup.Port
";

    #[tokio::test]
    async fn test_attribute_of_updated_resource_propagates_in_one_apply() {
        let (engine, provider, store) = setup();
        let template = LoadedTemplate::from_source(PORTS).unwrap();
        engine.apply(&template, &BTreeMap::new()).await.unwrap();

        let port = overrides(&[("Port", "8080")]);
        let plan = engine.plan(&template, &port).await.unwrap();
        assert_eq!(plan.action("TargetGroup").unwrap().kind, ActionKind::Update);
        assert_eq!(plan.action("Listener").unwrap().kind, ActionKind::Update);
        engine.apply_plan(&plan).await.unwrap();

        let listener = store.load().await.unwrap().get("Listener").cloned().unwrap();
        assert_eq!(listener.properties["Port"], Value::integer(8080));
        assert_eq!(provider.resources()[&listener.physical_id].properties["Port"], Value::integer(8080));

        let again = engine.plan(&template, &port).await.unwrap();
        assert!(!again.has_changes(), "{:?}", again.actions);
    }

    #[tokio::test]
    async fn test_unchanged_attribute_skips_dependent_update_call() {
        let (engine, provider, _store) = setup();
        let on = overrides(&[("EnableLogs", "true")]);
        engine.apply(&stack(), &on).await.unwrap();
        provider.clear_calls();

        let plan = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        assert_eq!(plan.action("Listener").unwrap().kind, ActionKind::Update);

        let report = engine.apply_plan(&plan).await.unwrap();
        assert!(!report.changed.contains(&String::from("Listener")));
        assert!(!provider.calls().iter().any(|c| c.ends_with(" Listener")));
    }

    fn assert_listener_wired(state: &StateSnapshot) {
        let listener = state.get("Listener").unwrap();
        for (property, target) in [("LoadBalancerArn", "LoadBalancer"), ("TargetGroupArn", "TargetGroup")] {
            assert_eq!(
                listener.properties[property],
                state.get(target).unwrap().attributes["Arn"],
                "{property}"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_destroy_rewires_recreated_dependencies() {
        let (engine, provider, store) = setup();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        provider.clear_calls();
        provider.fail("delete", "TargetGroup", 1);

        let err = engine.destroy().await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);
        assert_eq!(
            provider.calls()[..3],
            ["delete Listener", "delete LoadBalancer", "delete TargetGroup"]
        );

        let state = store.load().await.unwrap();
        assert_eq!(state.resources.len(), 3);
        assert_listener_wired(&state);
        assert_eq!(provider.live_names(), ["Listener", "LoadBalancer", "TargetGroup"]);

        let listener = state.get("Listener").unwrap();
        assert_eq!(provider.resources()[&listener.physical_id].properties, listener.properties);

        let plan = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        assert!(!plan.has_changes(), "{:?}", plan.actions);
    }

    fn delete_before_create() -> (Engine, Arc<ScriptedProvider>, Arc<MemoryStateStore>) {
        let schema = ProviderSchema::default()
            .with_replacement(["Port"])
            .with_strategy(ReplacementStrategy::DeleteBeforeCreate)
            .with_timing(Duration::from_millis(1), Duration::from_secs(5));
        let provider = Arc::new(ScriptedProvider::new().with_schema("Test::Target::Group", schema));
        let store = Arc::new(MemoryStateStore::new());
        let engine = Engine::new(ProviderRegistry::new().with_fallback(provider.clone()), store.clone());
        (engine, provider, store)
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement() {
        let (engine, provider, store) = delete_before_create();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        provider.clear_calls();

        let port = overrides(&[("Port", "8080")]);
        let report = engine.apply(&stack(), &port).await.unwrap();
        assert_eq!(report.summary.replaces, 1);
        assert_eq!(report.outputs["TargetGroupPort"], Value::integer(8080));
        assert_eq!(
            provider.calls(),
            ["delete TargetGroup", "create TargetGroup", "update Listener"]
        );

        let state = store.load().await.unwrap();
        assert_eq!(state.get("TargetGroup").unwrap().properties["Port"], Value::integer(8080));
        assert_listener_wired(&state);
        assert!(!engine.plan(&stack(), &port).await.unwrap().has_changes());
    }

    #[tokio::test]
    async fn test_failed_delete_before_create_restores_and_rewires() {
        let (engine, provider, store) = delete_before_create();
        engine.apply(&stack(), &BTreeMap::new()).await.unwrap();
        let old_id = store.load().await.unwrap().get("TargetGroup").unwrap().physical_id.clone();
        provider.clear_calls();
        provider.fail("create", "TargetGroup", 1);

        let err = engine.apply(&stack(), &overrides(&[("Port", "8080")])).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);
        assert_eq!(
            provider.calls(),
            [
                "delete TargetGroup",
                "create TargetGroup",
                "create TargetGroup",
                "update Listener"
            ]
        );

        let state = store.load().await.unwrap();
        let target_group = state.get("TargetGroup").unwrap();
        assert_ne!(target_group.physical_id, old_id);
        assert_eq!(target_group.properties["Port"], Value::integer(80));
        assert_listener_wired(&state);

        let plan = engine.plan(&stack(), &BTreeMap::new()).await.unwrap();
        assert!(!plan.has_changes(), "{:?}", plan.actions);
    }

    const RETAINED: &str = r"
Parameters:
  KeepBucket: { Type: String, Default: 'yes' }
  Size: { Type: Number, Default: 1 }
Conditions:
  Keep: !Equals [!Ref KeepBucket, 'yes']
Resources:
  Bucket:
    Type: Test::Storage::Bucket
    Condition: Keep
    DeletionPolicy: Retain
  Queue:
    Type: Test::Chain::Link
    Properties:
      Size: !Ref Size
";

    #[tokio::test]
    async fn test_retained_resource_is_forgotten_not_deleted() {
        let (engine, provider, store) = setup();
        let template = LoadedTemplate::from_source(RETAINED).unwrap();
        engine.apply(&template, &BTreeMap::new()).await.unwrap();
        provider.clear_calls();

        let report = engine.apply(&template, &overrides(&[("KeepBucket", "no")])).await.unwrap();
        assert_eq!(report.summary.deletes, 1);
        assert!(provider.calls().is_empty());
        assert!(provider.live_names().contains(&String::from("Bucket")));
        assert!(store.load().await.unwrap().get("Bucket").is_none());
    }

    #[tokio::test]
    async fn test_failed_run_restores_retained_record() {
        let (engine, provider, store) = setup();
        let template = LoadedTemplate::from_source(RETAINED).unwrap();
        engine.apply(&template, &BTreeMap::new()).await.unwrap();
        let bucket = store.load().await.unwrap().get("Bucket").cloned().unwrap();
        provider.clear_calls();
        provider.fail("update", "Queue", 1);

        let err = engine
            .apply(&template, &overrides(&[("KeepBucket", "no"), ("Size", "2")]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_ROLLED_BACK);
        assert_eq!(provider.calls(), ["update Queue"]);

        let restored = store.load().await.unwrap().get("Bucket").cloned().unwrap();
        assert_eq!(restored.physical_id, bucket.physical_id);
        assert!(provider.resources().contains_key(&bucket.physical_id));
    }
}
