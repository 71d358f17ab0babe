//! Dry-run plans

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What applying the stack would do to one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub resource_id: String,

    /// Resource type (e.g., "managed-cluster", "kubernetes/Deployment")
    pub resource_type: String,

    pub action_type: ActionType,

    pub description: String,

    /// Properties whose value is only known after apply
    pub unknown: Vec<String>,

    /// Properties that differ from the actual state
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Action {
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        action_type: ActionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            action_type,
            description: description.into(),
            unknown: Vec::new(),
            details: BTreeMap::new(),
        }
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
    /// Decided during apply (workloads on a cluster not reachable yet)
    Deferred,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
            ActionType::Deferred => write!(f, "deferred"),
        }
    }
}

/// Plan containing all actions, in convergence order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// List of actions to perform
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            actions,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
            has_changes: false,
        }
    }

    pub fn action(&self, resource_id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.resource_id == resource_id)
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
            deferred: self.actions_by_type(ActionType::Deferred).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
    pub deferred: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )?;
        if self.deferred > 0 {
            write!(f, ", {} decided during apply", self.deferred)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_summary() {
        let plan = Plan::new(vec![
            Action::new("resource-group", "resource-group", ActionType::NoOp, "up to date"),
            Action::new("aks-cluster", "managed-cluster", ActionType::Create, "create"),
            Action::new("workloads", "workload-set", ActionType::Deferred, "after apply"),
        ]);

        assert!(plan.has_changes);
        assert_eq!(
            plan.summary().to_string(),
            "1 to create, 0 to update, 0 to delete, 1 unchanged, 1 decided during apply"
        );
        assert_eq!(
            plan.action("aks-cluster").map(|a| a.action_type),
            Some(ActionType::Create)
        );
    }

    #[test]
    fn test_no_change_plan() {
        let plan = Plan::new(vec![Action::new(
            "resource-group",
            "resource-group",
            ActionType::NoOp,
            "up to date",
        )]);
        assert!(!plan.has_changes);
        assert!(!Plan::empty().has_changes);
    }
}
