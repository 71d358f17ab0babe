//! Stack outputs
//!
//! Output specs are resolved once the stack has converged, from the settled
//! outputs in the report and from the credential cache.

use crate::credentials::CredentialResolver;
use crate::report::ApplyReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackflow_core::OutputSpec;
use stackflow_core::model::{CredentialRef, OutputRef, ValueSource};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A resolved output value
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOutput {
    pub name: String,
    /// `None` when a resource it depends on did not settle
    pub value: Option<Value>,
    pub sensitive: bool,
}

impl fmt::Debug for StackOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: &dyn fmt::Debug = if self.sensitive {
            &"<redacted>"
        } else {
            &self.value
        };
        f.debug_struct("StackOutput")
            .field("name", &self.name)
            .field("value", value)
            .finish()
    }
}

impl StackOutput {
    /// Value for display; sensitive values are masked unless `reveal` is set
    pub fn display_value(&self, reveal: bool) -> String {
        match (&self.value, self.sensitive && !reveal) {
            (None, _) => "(unavailable)".to_string(),
            (Some(_), true) => "(sensitive)".to_string(),
            (Some(Value::String(s)), false) => s.clone(),
            (Some(other), false) => other.to_string(),
        }
    }
}

struct Settled<'a> {
    report: &'a ApplyReport,
    credentials: BTreeMap<CredentialRef, String>,
}

impl ValueSource for Settled<'_> {
    fn output(&self, reference: &OutputRef) -> Option<Value> {
        self.report
            .outputs(&reference.resource)?
            .get(&reference.output)
            .cloned()
    }

    fn credential(&self, reference: &CredentialRef) -> Option<String> {
        self.credentials.get(reference).cloned()
    }
}

/// Resolve `specs` against a finished apply
pub async fn resolve_outputs(
    specs: &[OutputSpec],
    report: &ApplyReport,
    resolver: Option<&Arc<CredentialResolver>>,
) -> Vec<StackOutput> {
    let mut credentials = BTreeMap::new();
    if let Some(resolver) = resolver {
        for reference in specs.iter().flat_map(|s| s.value.credential_refs()) {
            // only resources that settled in this pass have fresh credentials
            if report.outcome(&reference.resource).is_none_or(|o| !o.is_settled()) {
                continue;
            }
            match resolver.get(&reference.resource).await {
                Ok(bundle) => {
                    if let Some(value) = bundle.field(reference.field) {
                        credentials.insert(reference.clone(), value);
                    }
                }
                Err(e) => debug!(output = %reference, error = %e, "Credential output unavailable"),
            }
        }
    }

    let source = Settled {
        report,
        credentials,
    };
    specs
        .iter()
        .map(|spec| StackOutput {
            name: spec.name.clone(),
            value: spec.value.resolve(&source).ok(),
            sensitive: spec.sensitive,
        })
        .collect()
}
