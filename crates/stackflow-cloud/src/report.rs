//! Apply and destroy reports

use crate::error::CloudError;
use crate::provider::Outputs;
use serde::{Deserialize, Serialize};
use stackflow_core::model::ResourceType;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle phase of a resource during one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Resolving,
    Created,
    Updated,
    NoOp,
    Deleted,
    Absent,
    Settled,
    Failed,
    Blocked,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Resolving => "resolving",
            Phase::Created => "created",
            Phase::Updated => "updated",
            Phase::NoOp => "no-op",
            Phase::Deleted => "deleted",
            Phase::Absent => "absent",
            Phase::Settled => "settled",
            Phase::Failed => "failed",
            Phase::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// What converging a resource did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    NoOp,
    Deleted,
    /// Nothing to delete
    Absent,
}

impl Change {
    pub fn phase(self) -> Phase {
        match self {
            Change::Created => Phase::Created,
            Change::Updated => Phase::Updated,
            Change::NoOp => Phase::NoOp,
            Change::Deleted => Phase::Deleted,
            Change::Absent => Phase::Absent,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.phase().fmt(f)
    }
}

/// Terminal record of one resource
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub id: String,
    pub resource_type: ResourceType,
    /// Every phase the resource went through, in order
    pub history: Vec<Phase>,
    pub change: Option<Change>,
    pub error: Option<CloudError>,
    /// Dependency that kept this resource from running
    pub blocked_by: Option<String>,
    pub outputs: Option<Arc<Outputs>>,
    pub duration: Duration,
    /// Report of the workload pass run by a workload-set
    pub nested: Option<Box<ApplyReport>>,
}

impl ResourceOutcome {
    pub fn new(id: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            id: id.into(),
            resource_type,
            history: vec![Phase::Pending],
            change: None,
            error: None,
            blocked_by: None,
            outputs: None,
            duration: Duration::ZERO,
            nested: None,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        self.history.push(phase);
    }

    pub fn phase(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Pending)
    }

    pub fn is_settled(&self) -> bool {
        self.phase() == Phase::Settled
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == Phase::Failed
    }

    pub fn is_blocked(&self) -> bool {
        self.phase() == Phase::Blocked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

/// Root cause and everything it kept from running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureChain {
    pub root: String,
    pub error: String,
    pub blocked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub absent: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (count, label) in [
            (self.created, "created"),
            (self.updated, "updated"),
            (self.unchanged, "unchanged"),
            (self.deleted, "deleted"),
            (self.absent, "already absent"),
            (self.failed, "failed"),
            (self.blocked, "blocked"),
        ] {
            if count > 0 {
                parts.push(format!("{} {}", count, label));
            }
        }
        if parts.is_empty() {
            write!(f, "nothing to do")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Result of one apply or destroy pass, outcomes in plan order
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub operation: Operation,
    pub outcomes: Vec<ResourceOutcome>,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn new(operation: Operation, outcomes: Vec<ResourceOutcome>, duration: Duration) -> Self {
        Self {
            operation,
            outcomes,
            duration,
        }
    }

    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.outcome(id).map(|o| o.phase())
    }

    pub fn change(&self, id: &str) -> Option<Change> {
        self.outcome(id).and_then(|o| o.change)
    }

    pub fn outputs(&self, id: &str) -> Option<&Outputs> {
        self.outcome(id)?.outputs.as_deref()
    }

    pub fn failed(&self) -> Vec<&ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed()).collect()
    }

    pub fn blocked(&self) -> Vec<&ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_blocked()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_settled())
    }

    /// Process exit code: non-zero when anything failed or was blocked
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for outcome in &self.outcomes {
            match (outcome.phase(), outcome.change) {
                (Phase::Failed, _) => summary.failed += 1,
                (Phase::Blocked, _) => summary.blocked += 1,
                (_, Some(Change::Created)) => summary.created += 1,
                (_, Some(Change::Updated)) => summary.updated += 1,
                (_, Some(Change::NoOp)) => summary.unchanged += 1,
                (_, Some(Change::Deleted)) => summary.deleted += 1,
                (_, Some(Change::Absent)) => summary.absent += 1,
                _ => {}
            }
        }
        summary
    }

    /// Follow `blocked_by` links back to the failed resource
    fn root_of(&self, outcome: &ResourceOutcome) -> Option<&ResourceOutcome> {
        let mut current = outcome;
        for _ in 0..=self.outcomes.len() {
            let upstream = self.outcome(current.blocked_by.as_deref()?)?;
            if upstream.is_failed() {
                return Some(upstream);
            }
            current = upstream;
        }
        None
    }

    /// Every failed resource with the resources it blocked
    pub fn failure_chains(&self) -> Vec<FailureChain> {
        self.failed()
            .into_iter()
            .map(|root| FailureChain {
                root: root.id.clone(),
                error: root
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
                blocked: self
                    .blocked()
                    .into_iter()
                    .filter(|b| self.root_of(b).is_some_and(|r| r.id == root.id))
                    .map(|b| b.id.clone())
                    .collect(),
            })
            .collect()
    }

    /// Ids of failed resources
    pub fn root_causes(&self) -> Vec<String> {
        self.failed().into_iter().map(|o| o.id.clone()).collect()
    }

    /// Resources blocked without a failed upstream (cancellation)
    pub fn blocked_without_cause(&self) -> Vec<String> {
        self.blocked()
            .into_iter()
            .filter(|b| self.root_of(b).is_none())
            .map(|b| b.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, phases: &[Phase], blocked_by: Option<&str>) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(id, ResourceType::ResourceGroup);
        for phase in phases {
            outcome.enter(*phase);
        }
        outcome.blocked_by = blocked_by.map(|s| s.to_string());
        outcome
    }

    fn failing_report() -> ApplyReport {
        let mut cluster = outcome("aks-cluster", &[Phase::Resolving, Phase::Failed], None);
        cluster.error = Some(CloudError::TimeoutExceeded {
            resource: "aks-cluster".into(),
            timeout: Duration::from_secs(3600),
        });
        let mut rg = outcome(
            "resource-group",
            &[Phase::Resolving, Phase::Created, Phase::Settled],
            None,
        );
        rg.change = Some(Change::Created);

        ApplyReport::new(
            Operation::Apply,
            vec![
                rg,
                cluster,
                outcome("aks-acr-pull", &[Phase::Blocked], Some("aks-cluster")),
                outcome("workloads", &[Phase::Blocked], Some("aks-acr-pull")),
                outcome("orphan", &[Phase::Blocked], None),
            ],
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_failure_chain_names_root_cause() {
        let report = failing_report();
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);

        let chains = report.failure_chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].root, "aks-cluster");
        assert!(chains[0].error.contains("did not settle"));
        assert_eq!(chains[0].blocked, vec!["aks-acr-pull", "workloads"]);
        assert_eq!(report.blocked_without_cause(), vec!["orphan"]);
    }

    #[test]
    fn test_summary() {
        let report = failing_report();
        assert_eq!(
            report.summary().to_string(),
            "1 created, 1 failed, 3 blocked"
        );
    }

    #[test]
    fn test_success_report() {
        let mut rg = outcome(
            "resource-group",
            &[Phase::Resolving, Phase::NoOp, Phase::Settled],
            None,
        );
        rg.change = Some(Change::NoOp);
        let report = ApplyReport::new(Operation::Apply, vec![rg], Duration::ZERO);

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.change("resource-group"), Some(Change::NoOp));
        assert!(report.failure_chains().is_empty());
    }
}
