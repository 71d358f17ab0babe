//! Workload binding
//!
//! The namespaced workloads of a stack cannot be applied until the cluster
//! exists and its credentials resolve. The binder waits for the cluster's
//! connection descriptor, asks the [`WorkloadTarget`] for a provider bound to
//! it, and runs a nested convergence pass of the workload graph.

use crate::engine::{ConvergenceEngine, Externals};
use crate::error::{CloudError, Result};
use crate::provider::{CloudProvider, Outputs, WorkloadTarget};
use crate::report::ApplyReport;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use stackflow_core::WorkloadSet;
use stackflow_core::graph::ResourceGraph;
use std::sync::Arc;
use tracing::info;

pub struct WorkloadBinder {
    workloads: WorkloadSet,
    target: Arc<dyn WorkloadTarget>,
}

impl WorkloadBinder {
    pub fn new(workloads: WorkloadSet, target: Arc<dyn WorkloadTarget>) -> Self {
        Self { workloads, target }
    }

    /// Id of the workload-set node in the outer graph
    pub fn id(&self) -> &str {
        &self.workloads.id
    }

    /// Id of the cluster the workloads run on
    pub fn cluster(&self) -> &str {
        &self.workloads.cluster
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.workloads.graph
    }

    /// Apply the workload graph against the cluster
    pub fn converge<'a>(
        &'a self,
        engine: &'a ConvergenceEngine,
        inputs: &'a Externals,
    ) -> BoxFuture<'a, Result<ApplyReport>> {
        async move {
            let provider = self.connect(engine).await?;
            info!(
                workloads = %self.id(),
                cluster = %self.cluster(),
                resources = self.graph().len(),
                "Binding workloads to cluster"
            );
            let externals = self.externals(inputs);
            engine
                .nested(provider)
                .apply_with_externals(self.graph(), &externals)
                .await
        }
        .boxed()
    }

    /// Delete the workload graph from the cluster, in reverse order
    pub fn destroy<'a>(
        &'a self,
        engine: &'a ConvergenceEngine,
        known: &'a Externals,
    ) -> BoxFuture<'a, Result<ApplyReport>> {
        async move {
            let provider = self.connect(engine).await?;
            info!(workloads = %self.id(), cluster = %self.cluster(), "Removing workloads");
            let externals = self.externals(known);
            engine
                .nested(provider)
                .destroy_with_externals(self.graph(), &externals)
                .await
        }
        .boxed()
    }

    async fn connect(&self, engine: &ConvergenceEngine) -> Result<Arc<dyn CloudProvider>> {
        let credentials = engine.credentials().ok_or_else(|| {
            CloudError::InvalidConfig(format!(
                "workloads need credentials of {} but no credential source is configured",
                self.cluster()
            ))
        })?;
        let cancel = engine.cancellation_token();
        let bundle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CloudError::Cancelled),
            bundle = credentials.get(self.cluster()) => bundle?,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CloudError::Cancelled),
            provider = self.target.connect(&bundle.descriptor) => provider,
        }
    }

    fn externals(&self, available: &Externals) -> Externals {
        self.graph()
            .externals()
            .iter()
            .filter_map(|id| available.get(id).map(|o| (id.clone(), o.clone())))
            .collect()
    }

    /// Outputs of every settled workload, as `<id>.<output>`
    pub fn flatten_outputs(report: &ApplyReport) -> Outputs {
        let mut outputs = Outputs::new();
        for outcome in &report.outcomes {
            let Some(values) = &outcome.outputs else {
                continue;
            };
            for (name, value) in values.iter() {
                outputs.insert(format!("{}.{}", outcome.id, name), value.clone());
            }
        }
        outputs
    }
}

impl std::fmt::Debug for WorkloadBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadBinder")
            .field("id", &self.workloads.id)
            .field("cluster", &self.workloads.cluster)
            .finish_non_exhaustive()
    }
}
