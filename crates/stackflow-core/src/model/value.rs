//! Property values and deferred references
//!
//! A property is either a literal JSON value or a reference to something only
//! known once another resource settles. References are parsed out of
//! `${resource.output}` templates when the stack is declared, so the dependency
//! resolver can turn them into edges before anything runs.

use crate::error::{Result, StackError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Reference to an output property of another resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    /// Id of the resource producing the output
    pub resource: String,

    /// Output property name (e.g. "loginServer", "kubeletIdentityObjectId")
    pub output: String,
}

impl OutputRef {
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

/// Field of a resolved credential bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CredentialField {
    Username,
    Password,
    Kubeconfig,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialField::Username => write!(f, "username"),
            CredentialField::Password => write!(f, "password"),
            CredentialField::Kubeconfig => write!(f, "kubeconfig"),
        }
    }
}

/// Reference to a credential of another resource (registry admin user, kubeconfig)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CredentialRef {
    pub resource: String,
    pub field: CredentialField,
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "credentials({}).{}", self.resource, self.field)
    }
}

/// Piece of an interpolated string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Output(OutputRef),
}

/// Declared value of a resource property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Known at declaration time
    Literal(Value),
    /// Whole value taken from another resource's output
    Output(OutputRef),
    /// String assembled from text and outputs
    Interpolate(Vec<Segment>),
    /// Secret taken from another resource's credential bundle
    Credential(CredentialRef),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

/// A deferred reference that had no value when resolution was attempted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unresolved reference {0}")]
pub struct UnresolvedReference(pub String);

/// Supplies values for deferred references at resolution time
pub trait ValueSource {
    fn output(&self, reference: &OutputRef) -> Option<Value>;

    fn credential(&self, reference: &CredentialRef) -> Option<String>;
}

impl PropertyValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        PropertyValue::Literal(value.into())
    }

    pub fn output(resource: impl Into<String>, output: impl Into<String>) -> Self {
        PropertyValue::Output(OutputRef::new(resource, output))
    }

    pub fn credential(resource: impl Into<String>, field: CredentialField) -> Self {
        PropertyValue::Credential(CredentialRef {
            resource: resource.into(),
            field,
        })
    }

    /// Parse a string that may contain `${resource.output}` references.
    ///
    /// `$${` escapes a literal `${`. A template consisting of a single
    /// reference becomes a plain [`PropertyValue::Output`] so non-string
    /// outputs keep their JSON type.
    pub fn template(template: &str) -> Result<Self> {
        let segments = parse_template(template)?;

        if segments.iter().all(|s| matches!(s, Segment::Text(_))) {
            let text: String = segments
                .into_iter()
                .map(|s| match s {
                    Segment::Text(t) => t,
                    Segment::Output(_) => String::new(),
                })
                .collect();
            return Ok(PropertyValue::Literal(Value::String(text)));
        }

        if let [Segment::Output(reference)] = segments.as_slice() {
            return Ok(PropertyValue::Output(reference.clone()));
        }

        Ok(PropertyValue::Interpolate(segments))
    }

    /// Convert a JSON document, parsing templates found in its strings.
    ///
    /// Subtrees without references collapse back to a single literal.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::template(&s),
            Value::Array(items) => {
                let converted = items
                    .iter()
                    .cloned()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()?;
                if converted.iter().all(|v| !v.is_deferred()) {
                    Ok(PropertyValue::Literal(Value::Array(
                        converted.into_iter().map(|v| v.into_literal()).collect(),
                    )))
                } else {
                    Ok(PropertyValue::List(converted))
                }
            }
            Value::Object(map) => {
                let converted = map
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                if converted.values().all(|v| !v.is_deferred()) {
                    Ok(PropertyValue::Literal(Value::Object(
                        converted
                            .into_iter()
                            .map(|(k, v)| (k, v.into_literal()))
                            .collect(),
                    )))
                } else {
                    Ok(PropertyValue::Map(converted))
                }
            }
            other => Ok(PropertyValue::Literal(other)),
        }
    }

    // Only called on values already known to hold no references.
    fn into_literal(self) -> Value {
        match self {
            PropertyValue::Literal(v) => v,
            PropertyValue::List(items) => {
                Value::Array(items.into_iter().map(|v| v.into_literal()).collect())
            }
            PropertyValue::Map(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_literal()))
                    .collect(),
            ),
            PropertyValue::Output(_)
            | PropertyValue::Interpolate(_)
            | PropertyValue::Credential(_) => Value::Null,
        }
    }

    /// Whether the value depends on anything that is not yet known
    pub fn is_deferred(&self) -> bool {
        match self {
            PropertyValue::Literal(_) => false,
            PropertyValue::Output(_)
            | PropertyValue::Interpolate(_)
            | PropertyValue::Credential(_) => true,
            PropertyValue::List(items) => items.iter().any(|v| v.is_deferred()),
            PropertyValue::Map(map) => map.values().any(|v| v.is_deferred()),
        }
    }

    /// Ids of every resource this value refers to
    pub fn references(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.collect_references(&mut ids);
        ids
    }

    fn collect_references(&self, ids: &mut BTreeSet<String>) {
        match self {
            PropertyValue::Literal(_) => {}
            PropertyValue::Output(r) => {
                ids.insert(r.resource.clone());
            }
            PropertyValue::Interpolate(segments) => {
                for segment in segments {
                    if let Segment::Output(r) = segment {
                        ids.insert(r.resource.clone());
                    }
                }
            }
            PropertyValue::Credential(r) => {
                ids.insert(r.resource.clone());
            }
            PropertyValue::List(items) => {
                for item in items {
                    item.collect_references(ids);
                }
            }
            PropertyValue::Map(map) => {
                for value in map.values() {
                    value.collect_references(ids);
                }
            }
        }
    }

    /// Credential references contained in this value
    pub fn credential_refs(&self) -> Vec<&CredentialRef> {
        let mut refs = Vec::new();
        self.collect_credentials(&mut refs);
        refs
    }

    fn collect_credentials<'a>(&'a self, refs: &mut Vec<&'a CredentialRef>) {
        match self {
            PropertyValue::Credential(r) => refs.push(r),
            PropertyValue::List(items) => items.iter().for_each(|v| v.collect_credentials(refs)),
            PropertyValue::Map(map) => map.values().for_each(|v| v.collect_credentials(refs)),
            _ => {}
        }
    }

    /// Look up a literal nested inside this value.
    pub fn literal_at(&self, path: &[&str]) -> Option<&Value> {
        match (self, path.split_first()) {
            (PropertyValue::Literal(v), _) => {
                let mut current = v;
                for key in path {
                    current = current.get(*key)?;
                }
                Some(current)
            }
            (PropertyValue::Map(map), Some((first, rest))) => map.get(*first)?.literal_at(rest),
            _ => None,
        }
    }

    /// Produce the concrete JSON value, failing on the first missing reference.
    pub fn resolve(
        &self,
        source: &dyn ValueSource,
    ) -> std::result::Result<Value, UnresolvedReference> {
        match self {
            PropertyValue::Literal(v) => Ok(v.clone()),
            PropertyValue::Output(r) => source
                .output(r)
                .ok_or_else(|| UnresolvedReference(r.to_string())),
            PropertyValue::Interpolate(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Output(r) => {
                            let value = source
                                .output(r)
                                .ok_or_else(|| UnresolvedReference(r.to_string()))?;
                            match value {
                                Value::String(s) => out.push_str(&s),
                                other => out.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::String(out))
            }
            PropertyValue::Credential(r) => source
                .credential(r)
                .map(Value::String)
                .ok_or_else(|| UnresolvedReference(r.to_string())),
            PropertyValue::List(items) => items
                .iter()
                .map(|v| v.resolve(source))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            PropertyValue::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.resolve(source)?);
                }
                Ok(Value::Object(out))
            }
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Literal(value)
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>> {
    let invalid = |message: &str| StackError::InvalidTemplate {
        template: template.to_string(),
        message: message.to_string(),
    };

    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find("${") {
        // "$${" keeps a literal "${"
        if pos > 0 && rest[..pos].ends_with('$') {
            text.push_str(&rest[..pos - 1]);
            text.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        text.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after.find('}').ok_or_else(|| invalid("missing closing '}'"))?;
        let inner = after[..end].trim();
        let (resource, output) = inner
            .split_once('.')
            .ok_or_else(|| invalid("reference must look like ${resource.output}"))?;

        if resource.is_empty() || output.is_empty() {
            return Err(invalid("reference must look like ${resource.output}"));
        }
        if !resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("resource id may only contain [A-Za-z0-9_-]"));
        }

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Output(OutputRef::new(resource, output)));
        rest = &after[end + 1..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct Outputs(HashMap<String, Value>);

    impl ValueSource for Outputs {
        fn output(&self, reference: &OutputRef) -> Option<Value> {
            self.0
                .get(&format!("{}.{}", reference.resource, reference.output))
                .cloned()
        }

        fn credential(&self, reference: &CredentialRef) -> Option<String> {
            (reference.field == CredentialField::Password).then(|| "s3cret".to_string())
        }
    }

    #[test]
    fn test_template_without_references_is_literal() {
        let value = PropertyValue::template("eastus").unwrap();
        assert_eq!(value, PropertyValue::literal("eastus"));
        assert!(!value.is_deferred());
    }

    #[test]
    fn test_template_single_reference_keeps_output() {
        let value = PropertyValue::template("${container-registry.id}").unwrap();
        assert_eq!(value, PropertyValue::output("container-registry", "id"));
    }

    #[test]
    fn test_template_interpolation() {
        let value =
            PropertyValue::template("${container-registry.loginServer}/backend-service:latest")
                .unwrap();
        assert_eq!(
            value,
            PropertyValue::Interpolate(vec![
                Segment::Output(OutputRef::new("container-registry", "loginServer")),
                Segment::Text("/backend-service:latest".to_string()),
            ])
        );
        assert_eq!(
            value.references().into_iter().collect::<Vec<_>>(),
            vec!["container-registry".to_string()]
        );
    }

    #[test]
    fn test_template_output_with_dots() {
        let value = PropertyValue::template("${workloads.frontend-service.ingress}").unwrap();
        assert_eq!(
            value,
            PropertyValue::output("workloads", "frontend-service.ingress")
        );
    }

    #[test]
    fn test_template_escape() {
        let value = PropertyValue::template("$${HOME}/bin").unwrap();
        assert_eq!(value, PropertyValue::literal("${HOME}/bin"));
    }

    #[test]
    fn test_template_errors() {
        assert!(PropertyValue::template("${unterminated").is_err());
        assert!(PropertyValue::template("${noperiod}").is_err());
        assert!(PropertyValue::template("${bad id.x}").is_err());
    }

    #[test]
    fn test_from_json_collapses_literal_subtrees() {
        let value = PropertyValue::from_json(json!({
            "sku": { "name": "Basic" },
            "tags": ["a", "b"],
        }))
        .unwrap();
        assert!(matches!(value, PropertyValue::Literal(_)));
    }

    #[test]
    fn test_from_json_keeps_deferred_branches() {
        let value = PropertyValue::from_json(json!({
            "sku": { "name": "Basic" },
            "image": "${container-registry.loginServer}/frontend-service:latest",
        }))
        .unwrap();
        let PropertyValue::Map(map) = &value else {
            panic!("expected map, got {value:?}");
        };
        assert!(matches!(map["sku"], PropertyValue::Literal(_)));
        assert!(matches!(map["image"], PropertyValue::Interpolate(_)));
        assert_eq!(value.literal_at(&["sku", "name"]), Some(&json!("Basic")));
    }

    #[test]
    fn test_resolve() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "container-registry.loginServer".to_string(),
            json!("demo.azurecr.io"),
        );
        outputs.insert("plan.capacity".to_string(), json!(3));
        let source = Outputs(outputs);

        let value = PropertyValue::Map(BTreeMap::from([
            (
                "image".to_string(),
                PropertyValue::template("${container-registry.loginServer}/api:1").unwrap(),
            ),
            ("count".to_string(), PropertyValue::output("plan", "capacity")),
            (
                "password".to_string(),
                PropertyValue::credential("container-registry", CredentialField::Password),
            ),
        ]));

        let resolved = value.resolve(&source).unwrap();
        assert_eq!(
            resolved,
            json!({"image": "demo.azurecr.io/api:1", "count": 3, "password": "s3cret"})
        );
        assert_eq!(value.credential_refs().len(), 1);
    }

    #[test]
    fn test_resolve_missing_reference() {
        let source = Outputs(HashMap::new());
        let err = PropertyValue::output("aks-cluster", "kubeletIdentityObjectId")
            .resolve(&source)
            .unwrap_err();
        assert!(err.to_string().contains("aks-cluster.kubeletIdentityObjectId"));
    }
}
