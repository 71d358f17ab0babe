//! Convergence engine
//!
//! Every resource of a graph runs as its own task. A task waits on the
//! settlement cells of its dependencies, takes a slot from the concurrency
//! semaphore and a lease on its provider key, resolves its deferred
//! properties, then reads the actual state and creates, updates or leaves the
//! resource alone. Settling resolves the task's own cell, which is what
//! unblocks dependents.

use crate::action::{Action, ActionType, Plan};
use crate::binding::WorkloadBinder;
use crate::credentials::CredentialResolver;
use crate::deferred::DeferredCell;
use crate::error::{CloudError, Result};
use crate::events::{EventBus, StackEvent};
use crate::lease::LeaseTable;
use crate::provider::{
    CloudProvider, CredentialTarget, Outputs, ResolvedResource, ResourceKey, is_subset,
};
use crate::report::{ApplyReport, Change, Operation, Phase, ResourceOutcome};
use crate::retry::{RetryConfig, retry_with_backoff};
use serde_json::Value;
use stackflow_core::graph::ResourceGraph;
use stackflow_core::model::{
    CredentialRef, OutputRef, Resource, ResourceType, StackConfig, UnresolvedReference,
    ValueSource,
};
use stackflow_core::DEFAULT_CONCURRENCY;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outputs of resources settled outside the graph being converged
pub type Externals = BTreeMap<String, Arc<Outputs>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum provider operations in flight
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_stack(config: &StackConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryConfig::with_max_attempts(config.max_attempts),
        }
    }
}

#[derive(Debug, Clone)]
enum Settlement {
    Settled(Arc<Outputs>),
    Failed,
    Blocked,
}

type Cell = Arc<DeferredCell<Settlement>>;

/// Marks the cell failed if the task ends without settling it
struct SettleOnDrop(Cell);

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        self.0.resolve(Settlement::Failed);
    }
}

/// Result of converging one resource
struct Converged {
    change: Change,
    key: ResourceKey,
    properties: Value,
    outputs: Outputs,
}

/// An operation result together with the report of a nested workload pass
struct Attempt<T> {
    result: Result<T>,
    nested: Option<ApplyReport>,
}

impl<T> Attempt<T> {
    fn of(result: Result<T>) -> Self {
        Self {
            result,
            nested: None,
        }
    }

    fn failed(error: CloudError) -> Self {
        Self::of(Err(error))
    }
}

/// Values available to a resource while resolving its properties
struct Inputs<'a> {
    outputs: &'a Externals,
    credentials: &'a BTreeMap<CredentialRef, String>,
}

impl ValueSource for Inputs<'_> {
    fn output(&self, reference: &OutputRef) -> Option<Value> {
        self.outputs
            .get(&reference.resource)?
            .get(&reference.output)
            .cloned()
    }

    fn credential(&self, reference: &CredentialRef) -> Option<String> {
        self.credentials.get(reference).cloned()
    }
}

fn scope_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn resolve_key(
    resource: &Resource,
    source: &dyn ValueSource,
) -> std::result::Result<ResourceKey, UnresolvedReference> {
    let scope = match &resource.scope {
        Some(scope) => Some(scope_string(scope.resolve(source)?)),
        None => None,
    };
    Ok(ResourceKey::new(
        resource.resource_type.clone(),
        scope,
        &resource.name,
    ))
}

fn resolve_resource(
    resource: &Resource,
    source: &dyn ValueSource,
) -> std::result::Result<ResolvedResource, UnresolvedReference> {
    let key = resolve_key(resource, source)?;
    let mut properties = serde_json::Map::new();
    for (name, value) in &resource.properties {
        properties.insert(name.clone(), value.resolve(source)?);
    }
    Ok(ResolvedResource {
        id: resource.id.clone(),
        key,
        properties: Value::Object(properties),
    })
}

/// Desired properties that resolve now, and the names of those that do not
fn resolve_partial(
    resource: &Resource,
    source: &dyn ValueSource,
) -> (serde_json::Map<String, Value>, Vec<String>) {
    let mut resolved = serde_json::Map::new();
    let mut unknown = Vec::new();
    for (name, value) in &resource.properties {
        match value.resolve(source) {
            Ok(v) => {
                resolved.insert(name.clone(), v);
            }
            Err(_) => unknown.push(name.clone()),
        }
    }
    (resolved, unknown)
}

/// Converges resource graphs against a provider
#[derive(Clone)]
pub struct ConvergenceEngine {
    provider: Arc<dyn CloudProvider>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    leases: LeaseTable,
    credentials: Option<Arc<CredentialResolver>>,
    binder: Option<Arc<WorkloadBinder>>,
    events: EventBus,
    cancel: CancellationToken,
}

impl ConvergenceEngine {
    pub fn new(provider: Arc<dyn CloudProvider>, config: EngineConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            provider,
            config,
            semaphore,
            leases: LeaseTable::new(),
            credentials: None,
            binder: None,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_workloads(mut self, binder: WorkloadBinder) -> Self {
        self.binder = Some(Arc::new(binder));
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn credentials(&self) -> Option<&Arc<CredentialResolver>> {
        self.credentials.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Engine for a second pass against another provider.
    ///
    /// Shares credentials, events, cancellation, leases and the concurrency
    /// budget with `self`.
    pub(crate) fn nested(&self, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            binder: None,
            ..self.clone()
        }
    }

    /// Converge every resource of `graph`
    pub async fn apply(&self, graph: &ResourceGraph) -> Result<ApplyReport> {
        self.apply_with_externals(graph, &Externals::new()).await
    }

    /// Converge `graph`, reading external references from `externals`
    #[instrument(skip_all, fields(resources = graph.len(), provider = %self.provider.name()))]
    pub async fn apply_with_externals(
        &self,
        graph: &ResourceGraph,
        externals: &Externals,
    ) -> Result<ApplyReport> {
        let started = Instant::now();
        let plan = graph.plan()?;
        if let Some(missing) = graph.externals().iter().find(|e| !externals.contains_key(*e)) {
            return Err(CloudError::Configuration(format!(
                "external input '{}' was not supplied",
                missing
            )));
        }
        info!(order = ?plan.order(), "Applying");

        let mut cells: HashMap<String, Cell> = HashMap::new();
        for (id, outputs) in externals {
            cells.insert(
                id.clone(),
                Arc::new(DeferredCell::resolved(Settlement::Settled(outputs.clone()))),
            );
        }
        for id in plan.order() {
            cells.insert(id.clone(), Arc::new(DeferredCell::new()));
        }
        let cells = Arc::new(cells);

        let mut tasks = JoinSet::new();
        for resource in plan.order().iter().filter_map(|id| graph.get(id)) {
            let engine = self.clone();
            let resource = resource.clone();
            let cells = cells.clone();
            tasks.spawn(async move { engine.run_resource(resource, cells).await });
        }

        let mut finished: HashMap<String, ResourceOutcome> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    finished.insert(outcome.id.clone(), outcome);
                }
                Err(e) => error!(error = %e, "Resource task aborted"),
            }
        }

        let outcomes = plan
            .order()
            .iter()
            .filter_map(|id| graph.get(id))
            .map(|resource| {
                finished.remove(&resource.id).unwrap_or_else(|| {
                    let mut outcome =
                        ResourceOutcome::new(&resource.id, resource.resource_type.clone());
                    outcome.enter(Phase::Failed);
                    outcome.error = Some(CloudError::ApiError("task aborted".to_string()));
                    outcome
                })
            })
            .collect();

        let report = ApplyReport::new(Operation::Apply, outcomes, started.elapsed());
        info!(summary = %report.summary(), "Apply finished");
        Ok(report)
    }

    async fn run_resource(self, resource: Resource, cells: Arc<HashMap<String, Cell>>) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(&resource.id, resource.resource_type.clone());
        let Some(own) = cells.get(&resource.id).cloned() else {
            outcome.enter(Phase::Failed);
            return outcome;
        };
        let _settle_guard = SettleOnDrop(own.clone());

        let mut inputs = Externals::new();
        for dep in resource.dependencies() {
            let Some(cell) = cells.get(&dep) else {
                continue;
            };
            let settlement = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                settlement = cell.wait() => Some(settlement),
            };
            match settlement {
                Some(Settlement::Settled(outputs)) => {
                    inputs.insert(dep, outputs);
                }
                Some(_) => return self.block(outcome, Some(dep), &own),
                None => return self.block(outcome, None, &own),
            }
        }

        let is_workload_set = resource.resource_type == ResourceType::WorkloadSet;
        // the workload pass takes its own slots for the resources it applies
        let _permit = if is_workload_set {
            None
        } else {
            let acquired = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            };
            match acquired {
                Some(permit) => Some(permit),
                None => return self.block(outcome, None, &own),
            }
        };
        if self.cancel.is_cancelled() {
            return self.block(outcome, None, &own);
        }

        outcome.enter(Phase::Resolving);
        self.events.publish(StackEvent::Started {
            id: resource.id.clone(),
        });
        let started = Instant::now();
        let timeout = resource.effective_timeout();
        let timed_out = || CloudError::TimeoutExceeded {
            resource: resource.id.clone(),
            timeout,
        };

        let attempt = if is_workload_set {
            // binding observes cancellation and keeps the nested report
            match tokio::time::timeout(timeout, self.bind_workloads(&resource, &inputs)).await {
                Ok(attempt) => attempt,
                Err(_) => Attempt::failed(timed_out()),
            }
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Attempt::failed(CloudError::Cancelled),
                result = tokio::time::timeout(timeout, self.converge(&resource, &inputs)) => {
                    match result {
                        Ok(result) => Attempt::of(result),
                        Err(_) => Attempt::failed(timed_out()),
                    }
                }
            }
        };

        outcome.duration = started.elapsed();
        outcome.nested = attempt.nested.map(Box::new);
        match attempt.result {
            Ok(converged) => self.settle(outcome, &resource, converged, &own),
            Err(e) => self.fail(outcome, e, &own),
        }
    }

    fn settle(
        &self,
        mut outcome: ResourceOutcome,
        resource: &Resource,
        converged: Converged,
        own: &Cell,
    ) -> ResourceOutcome {
        let change = converged.change;
        outcome.enter(change.phase());
        outcome.enter(Phase::Settled);
        outcome.change = Some(change);

        let outputs = Arc::new(converged.outputs);
        outcome.outputs = Some(outputs.clone());

        let event = StackEvent::Settled {
            id: resource.id.clone(),
            resource_type: resource.resource_type.clone(),
            key: converged.key,
            change,
            properties: converged.properties,
            outputs: outputs.clone(),
        };
        if let Some(credentials) = &self.credentials {
            if change == Change::Created {
                credentials.invalidate(&resource.id);
            }
            credentials.observe(&event);
        }

        self.events.publish(event);
        own.resolve(Settlement::Settled(outputs));
        info!(
            resource = %resource.id,
            change = %change,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Settled"
        );
        outcome
    }

    fn fail(&self, mut outcome: ResourceOutcome, error: CloudError, own: &Cell) -> ResourceOutcome {
        error!(resource = %outcome.id, error = %error, "Failed");
        outcome.enter(Phase::Failed);
        self.events.publish(StackEvent::Failed {
            id: outcome.id.clone(),
            error: error.to_string(),
        });
        own.resolve(Settlement::Failed);
        outcome.error = Some(error);
        outcome
    }

    fn block(
        &self,
        mut outcome: ResourceOutcome,
        blocked_by: Option<String>,
        own: &Cell,
    ) -> ResourceOutcome {
        match &blocked_by {
            Some(dep) => warn!(resource = %outcome.id, blocked_by = %dep, "Blocked"),
            None => warn!(resource = %outcome.id, "Blocked by cancellation"),
        }
        outcome.enter(Phase::Blocked);
        self.events.publish(StackEvent::Blocked {
            id: outcome.id.clone(),
            blocked_by: blocked_by.clone(),
        });
        own.resolve(Settlement::Blocked);
        outcome.blocked_by = blocked_by;
        outcome
    }

    /// Resolve deferred properties, waiting on credential bundles as needed
    async fn resolve(&self, resource: &Resource, inputs: &Externals) -> Result<ResolvedResource> {
        let credentials = self.credential_inputs(resource).await?;
        let source = Inputs {
            outputs: inputs,
            credentials: &credentials,
        };
        Ok(resolve_resource(resource, &source)?)
    }

    async fn credential_inputs(&self, resource: &Resource) -> Result<BTreeMap<CredentialRef, String>> {
        let mut values = BTreeMap::new();
        for reference in resource.credential_refs() {
            let resolver = self.credentials.as_ref().ok_or_else(|| {
                CloudError::InvalidConfig(format!(
                    "{} needs credentials of {} but no credential source is configured",
                    resource.id, reference.resource
                ))
            })?;
            let bundle = resolver.get(&reference.resource).await?;
            let value = bundle
                .field(reference.field)
                .ok_or_else(|| CloudError::CredentialDecode {
                    resource: reference.resource.clone(),
                    message: format!("bundle carries no {}", reference.field),
                })?;
            values.insert(reference.clone(), value);
        }
        Ok(values)
    }

    async fn converge(&self, resource: &Resource, inputs: &Externals) -> Result<Converged> {
        let resolved = self.resolve(resource, inputs).await?;
        let key = &resolved.key;
        let retry = &self.config.retry;

        let _lease = self.leases.acquire(key).await;
        debug!(resource = %resolved.id, key = %key, "Reading actual state");
        let actual = retry_with_backoff(retry, "read", CloudError::is_transient, || {
            self.provider.read(key)
        })
        .await?;

        let (change, state) = match actual {
            None => {
                info!(resource = %resolved.id, key = %key, "Creating");
                let state = retry_with_backoff(retry, "create", CloudError::is_transient, || {
                    self.provider.create(&resolved)
                })
                .await?;
                (Change::Created, state)
            }
            Some(actual) if actual.matches(&resolved.properties) => (Change::NoOp, actual),
            Some(actual) => {
                info!(resource = %resolved.id, key = %key, "Updating drifted resource");
                let state = retry_with_backoff(retry, "update", CloudError::is_transient, || {
                    self.provider.update(&resolved, &actual)
                })
                .await?;
                (Change::Updated, state)
            }
        };

        let outputs = state.settled_outputs(key);
        Ok(Converged {
            change,
            key: resolved.key,
            properties: resolved.properties,
            outputs,
        })
    }

    fn binder_for(&self, resource: &Resource) -> Result<&Arc<WorkloadBinder>> {
        self.binder
            .as_ref()
            .filter(|binder| binder.id() == resource.id)
            .ok_or_else(|| {
                CloudError::InvalidConfig(format!("no workload target bound for {}", resource.id))
            })
    }

    async fn bind_workloads(&self, resource: &Resource, inputs: &Externals) -> Attempt<Converged> {
        let binder = match self.binder_for(resource) {
            Ok(binder) => binder,
            Err(e) => return Attempt::failed(e),
        };
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CloudError::Cancelled),
            resolved = self.resolve(resource, inputs) => resolved,
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => return Attempt::failed(e),
        };

        let report = match binder.converge(self, inputs).await {
            Ok(report) => report,
            Err(e) => return Attempt::failed(e),
        };
        if !report.is_success() {
            let error = if report.failed().is_empty() && self.cancel.is_cancelled() {
                CloudError::Cancelled
            } else {
                let mut failed = report.root_causes();
                if failed.is_empty() {
                    failed = report.blocked_without_cause();
                }
                CloudError::WorkloadsFailed { failed }
            };
            return Attempt {
                result: Err(error),
                nested: Some(report),
            };
        }

        let changes: Vec<_> = report.outcomes.iter().filter_map(|o| o.change).collect();
        let change = if changes.contains(&Change::Created) {
            Change::Created
        } else if changes.contains(&Change::Updated) {
            Change::Updated
        } else {
            Change::NoOp
        };

        let mut outputs = WorkloadBinder::flatten_outputs(&report);
        if let Value::Object(properties) = &resolved.properties {
            for (name, value) in properties {
                outputs.insert(name.clone(), value.clone());
            }
        }
        Attempt {
            result: Ok(Converged {
                change,
                key: resolved.key,
                properties: resolved.properties,
                outputs,
            }),
            nested: Some(report),
        }
    }

    /// Dry run: what `apply` would do, without changing anything
    #[instrument(skip_all, fields(resources = graph.len(), provider = %self.provider.name()))]
    pub async fn plan(&self, graph: &ResourceGraph) -> Result<Plan> {
        let plan = graph.plan()?;
        let retry = &self.config.retry;
        let mut known = Externals::new();
        let mut actions = Vec::new();

        for resource in plan.order().iter().filter_map(|id| graph.get(id)) {
            let type_name = resource.resource_type.to_string();

            if resource.resource_type == ResourceType::WorkloadSet {
                let description = if resource.dependencies().iter().all(|d| known.contains_key(d)) {
                    "converge workloads against the existing cluster"
                } else {
                    "apply workloads once the cluster exists"
                };
                actions.push(Action::new(
                    &resource.id,
                    type_name,
                    ActionType::Deferred,
                    description,
                ));
                continue;
            }

            let credentials = self.plan_credentials(resource).await;
            let source = Inputs {
                outputs: &known,
                credentials: &credentials,
            };

            let key = match resolve_key(resource, &source) {
                Ok(key) => key,
                Err(_) => {
                    let mut action = Action::new(
                        &resource.id,
                        type_name,
                        ActionType::Create,
                        format!("create {} (parent not created yet)", resource.name),
                    );
                    action.unknown = resource.properties.keys().cloned().collect();
                    actions.push(action);
                    continue;
                }
            };

            let actual = retry_with_backoff(retry, "read", CloudError::is_transient, || {
                self.provider.read(&key)
            })
            .await?;
            let (desired, unknown) = resolve_partial(resource, &source);

            let mut action = match actual {
                None => Action::new(
                    &resource.id,
                    type_name,
                    ActionType::Create,
                    format!("create {}", key),
                ),
                Some(actual) => {
                    let outputs = actual.settled_outputs(&key);
                    let mut drift = BTreeMap::new();
                    for (name, value) in &desired {
                        let current = actual.properties.get(name).unwrap_or(&Value::Null);
                        if !is_subset(value, current) {
                            drift.insert(name.clone(), value.clone());
                        }
                    }
                    self.observe_existing(resource, &key, &desired, &outputs);
                    known.insert(resource.id.clone(), Arc::new(outputs));

                    let action_type = if drift.is_empty() && unknown.is_empty() {
                        ActionType::NoOp
                    } else {
                        ActionType::Update
                    };
                    let mut action = Action::new(
                        &resource.id,
                        type_name,
                        action_type,
                        match action_type {
                            ActionType::NoOp => format!("{} is up to date", key),
                            _ => format!("update {}", key),
                        },
                    );
                    action.details = drift;
                    action
                }
            };
            action.unknown = unknown;
            actions.push(action);
        }

        let plan = Plan::new(actions);
        info!(summary = %plan.summary(), "Plan computed");
        Ok(plan)
    }

    /// Credentials the plan can already see; failures just leave values unknown
    async fn plan_credentials(&self, resource: &Resource) -> BTreeMap<CredentialRef, String> {
        let mut values = BTreeMap::new();
        let Some(resolver) = &self.credentials else {
            return values;
        };
        for reference in resource.credential_refs() {
            match resolver.get(&reference.resource).await {
                Ok(bundle) => {
                    if let Some(value) = bundle.field(reference.field) {
                        values.insert(reference.clone(), value);
                    }
                }
                Err(e) => debug!(resource = %reference.resource, error = %e, "Credentials not available for plan"),
            }
        }
        values
    }

    /// Treat an existing resource like a settled one for credential lookups
    fn observe_existing(
        &self,
        resource: &Resource,
        key: &ResourceKey,
        desired: &serde_json::Map<String, Value>,
        outputs: &Outputs,
    ) {
        if let Some(credentials) = &self.credentials {
            credentials.observe(&StackEvent::Settled {
                id: resource.id.clone(),
                resource_type: resource.resource_type.clone(),
                key: key.clone(),
                change: Change::NoOp,
                properties: Value::Object(desired.clone()),
                outputs: Arc::new(outputs.clone()),
            });
        }
    }

    /// Tear `graph` down in reverse order
    pub async fn destroy(&self, graph: &ResourceGraph) -> Result<ApplyReport> {
        self.destroy_with_externals(graph, &Externals::new()).await
    }

    /// Tear `graph` down in reverse order, one resource at a time.
    ///
    /// Fails closed: a resource is only deleted once none of its dependents
    /// exist any more. A failure blocks everything the failed resource
    /// depends on; unrelated branches are still torn down.
    #[instrument(skip_all, fields(resources = graph.len(), provider = %self.provider.name()))]
    pub async fn destroy_with_externals(
        &self,
        graph: &ResourceGraph,
        externals: &Externals,
    ) -> Result<ApplyReport> {
        let started = Instant::now();
        let plan = graph.plan()?;
        let retry = &self.config.retry;
        let no_credentials = BTreeMap::new();

        // what exists, and the outputs that locate dependents
        let mut known = externals.clone();
        // kept after deletion so fail-closed checks re-read every dependent
        let mut present: HashMap<String, ResourceKey> = HashMap::new();
        let mut read_errors: HashMap<String, CloudError> = HashMap::new();
        for resource in plan.order().iter().filter_map(|id| graph.get(id)) {
            if resource.resource_type == ResourceType::WorkloadSet {
                continue;
            }
            let source = Inputs {
                outputs: &known,
                credentials: &no_credentials,
            };
            let Ok(key) = resolve_key(resource, &source) else {
                continue;
            };
            match retry_with_backoff(retry, "read", CloudError::is_transient, || {
                self.provider.read(&key)
            })
            .await
            {
                Ok(Some(actual)) => {
                    known.insert(resource.id.clone(), Arc::new(actual.settled_outputs(&key)));
                    present.insert(resource.id.clone(), key);
                }
                Ok(None) => {}
                Err(e) => {
                    read_errors.insert(resource.id.clone(), e);
                }
            }
        }

        let mut outcomes: HashMap<String, ResourceOutcome> = HashMap::new();
        // resource id -> failed dependent that pins it in place
        let mut pinned: HashMap<String, String> = HashMap::new();
        for resource in plan.reversed().iter().filter_map(|id| graph.get(id)) {
            let mut outcome = ResourceOutcome::new(&resource.id, resource.resource_type.clone());

            let blocked_by = pinned.get(&resource.id).cloned();
            if self.cancel.is_cancelled() || blocked_by.is_some() {
                if let Some(root) = &blocked_by {
                    for dep in resource.dependencies() {
                        pinned.entry(dep).or_insert_with(|| root.clone());
                    }
                }
                outcome.enter(Phase::Blocked);
                outcome.blocked_by = blocked_by;
                outcomes.insert(resource.id.clone(), outcome);
                continue;
            }

            outcome.enter(Phase::Resolving);
            let begun = Instant::now();
            let timeout = resource.effective_timeout();

            let attempt = if let Some(e) = read_errors.remove(&resource.id) {
                Attempt::failed(e)
            } else if resource.resource_type == ResourceType::WorkloadSet {
                match tokio::time::timeout(timeout, self.unbind_workloads(resource, &present, &known))
                    .await
                {
                    Ok(attempt) => attempt,
                    Err(_) => Attempt::failed(CloudError::TimeoutExceeded {
                        resource: resource.id.clone(),
                        timeout,
                    }),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Attempt::failed(CloudError::Cancelled),
                    result = tokio::time::timeout(timeout, self.teardown(graph, resource, &present)) => {
                        match result {
                            Ok(result) => Attempt::of(result),
                            Err(_) => Attempt::failed(CloudError::TimeoutExceeded {
                                resource: resource.id.clone(),
                                timeout,
                            }),
                        }
                    }
                }
            };

            outcome.duration = begun.elapsed();
            outcome.nested = attempt.nested.map(Box::new);
            match attempt.result {
                Ok(change) => {
                    if change == Change::Deleted {
                        if let Some(credentials) = &self.credentials {
                            credentials.invalidate(&resource.id);
                        }
                        self.events.publish(StackEvent::Deleted {
                            id: resource.id.clone(),
                        });
                    }
                    info!(resource = %resource.id, change = %change, "Torn down");
                    outcome.change = Some(change);
                    outcome.enter(change.phase());
                    outcome.enter(Phase::Settled);
                }
                Err(e) => {
                    error!(resource = %resource.id, error = %e, "Teardown failed, keeping its dependencies");
                    outcome.enter(Phase::Failed);
                    outcome.error = Some(e);
                    for dep in resource.dependencies() {
                        pinned.entry(dep).or_insert_with(|| resource.id.clone());
                    }
                }
            }
            outcomes.insert(resource.id.clone(), outcome);
        }

        let ordered = plan
            .reversed()
            .into_iter()
            .filter_map(|id| outcomes.remove(&id))
            .collect();
        let report = ApplyReport::new(Operation::Destroy, ordered, started.elapsed());
        info!(summary = %report.summary(), "Destroy finished");
        Ok(report)
    }

    async fn teardown(
        &self,
        graph: &ResourceGraph,
        resource: &Resource,
        present: &HashMap<String, ResourceKey>,
    ) -> Result<Change> {
        let Some(key) = present.get(&resource.id) else {
            return Ok(Change::Absent);
        };
        let retry = &self.config.retry;

        let mut remaining = Vec::new();
        for dependent in graph.dependents(&resource.id) {
            let Some(dependent_key) = present.get(dependent) else {
                continue;
            };
            let still_there = retry_with_backoff(retry, "read", CloudError::is_transient, || {
                self.provider.read(dependent_key)
            })
            .await?
            .is_some();
            if still_there {
                remaining.push(dependent.to_string());
            }
        }
        if !remaining.is_empty() {
            return Err(CloudError::DependentStillPresent {
                resource: resource.id.clone(),
                dependents: remaining,
            });
        }

        let _lease = self.leases.acquire(key).await;
        info!(resource = %resource.id, key = %key, "Deleting");
        retry_with_backoff(retry, "delete", CloudError::is_transient, || {
            self.provider.delete(key)
        })
        .await?;
        Ok(Change::Deleted)
    }

    async fn unbind_workloads(
        &self,
        resource: &Resource,
        present: &HashMap<String, ResourceKey>,
        known: &Externals,
    ) -> Attempt<Change> {
        let binder = match self.binder_for(resource) {
            Ok(binder) => binder,
            Err(e) => return Attempt::failed(e),
        };
        let Some(cluster_key) = present.get(binder.cluster()) else {
            // nothing to reach; the workloads went with the cluster
            return Attempt::of(Ok(Change::Absent));
        };

        if let Some(credentials) = &self.credentials {
            credentials.register(
                binder.cluster(),
                CredentialTarget::Cluster {
                    key: cluster_key.clone(),
                    scope: credentials.scope(),
                },
            );
        }

        match binder.destroy(self, known).await {
            Ok(report) if report.is_success() => {
                let change = if report
                    .outcomes
                    .iter()
                    .any(|o| o.change == Some(Change::Deleted))
                {
                    Change::Deleted
                } else {
                    Change::Absent
                };
                Attempt {
                    result: Ok(change),
                    nested: Some(report),
                }
            }
            Ok(report) => Attempt {
                result: Err(CloudError::WorkloadsFailed {
                    failed: report.root_causes(),
                }),
                nested: Some(report),
            },
            Err(e) => Attempt::failed(e),
        }
    }
}
