use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// One declared run parameter: a name, an optional default and a kind that
/// supplied values are checked against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    #[default]
    String,
    Integer,
    Boolean,
}

impl ParameterKind {
    fn accepts(&self, value: &str) -> bool {
        match self {
            ParameterKind::String => true,
            ParameterKind::Integer => value.trim().parse::<i64>().is_ok(),
            ParameterKind::Boolean => {
                matches!(value.trim().to_lowercase().as_str(), "true" | "false")
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Boolean => "boolean",
        }
    }
}

/// The materialized parameter set for one run. Immutable once resolved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedParameters {
    values: BTreeMap<String, String>,
}

impl ResolvedParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace `{name}` placeholders in `template` with resolved values.
    /// Unknown placeholders are left untouched so callers can layer their own
    /// substitutions on top.
    pub fn expand(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        for (name, value) in &self.values {
            let placeholder = format!("{{{name}}}");
            rendered = rendered.replace(&placeholder, value);
        }
        rendered
    }
}

/// Materialize the parameter set for a run from the declared schema and the
/// run-time overrides. Fails before any stage executes.
pub fn resolve(
    schema: &[ParameterSpec],
    overrides: &BTreeMap<String, String>,
) -> Result<ResolvedParameters, PipelineError> {
    for name in overrides.keys() {
        if !schema.iter().any(|spec| &spec.name == name) {
            return Err(PipelineError::validation(format!(
                "override supplied for undeclared parameter '{name}'"
            )));
        }
    }

    let mut values = BTreeMap::new();
    for spec in schema {
        let value = overrides
            .get(&spec.name)
            .cloned()
            .or_else(|| spec.default.clone())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "parameter '{}' has no default and no supplied value",
                    spec.name
                ))
            })?;

        if !spec.kind.accepts(&value) {
            return Err(PipelineError::validation(format!(
                "parameter '{}' expects a {} value, got '{}'",
                spec.name,
                spec.kind.label(),
                value
            )));
        }

        values.insert(spec.name.clone(), value);
    }

    Ok(ResolvedParameters { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, default: Option<&str>, kind: ParameterKind) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            default: default.map(str::to_string),
            kind,
            description: None,
        }
    }

    #[test]
    fn defaults_apply_when_no_override_given() {
        let schema = vec![spec("repo_name", Some("demo-ecr"), ParameterKind::String)];
        let resolved = resolve(&schema, &BTreeMap::new()).unwrap();
        assert_eq!(resolved.get("repo_name"), Some("demo-ecr"));
    }

    #[test]
    fn missing_required_parameter_fails() {
        let schema = vec![spec("account_id", None, ParameterKind::String)];
        let err = resolve(&schema, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("account_id"));
    }

    #[test]
    fn override_must_match_declared_kind() {
        let schema = vec![spec("replicas", None, ParameterKind::Integer)];
        let mut overrides = BTreeMap::new();
        overrides.insert("replicas".to_string(), "three".to_string());
        assert!(resolve(&schema, &overrides).is_err());

        overrides.insert("replicas".to_string(), "3".to_string());
        let resolved = resolve(&schema, &overrides).unwrap();
        assert_eq!(resolved.get("replicas"), Some("3"));
    }

    #[test]
    fn undeclared_override_is_rejected() {
        let schema = vec![spec("repo_name", Some("demo"), ParameterKind::String)];
        let mut overrides = BTreeMap::new();
        overrides.insert("surprise".to_string(), "value".to_string());
        assert!(resolve(&schema, &overrides).is_err());
    }

    #[test]
    fn expand_substitutes_placeholders() {
        let schema = vec![
            spec("account_id", Some("123456789012"), ParameterKind::String),
            spec("region", Some("us-east-1"), ParameterKind::String),
        ];
        let resolved = resolve(&schema, &BTreeMap::new()).unwrap();
        assert_eq!(
            resolved.expand("{account_id}.dkr.ecr.{region}.amazonaws.com"),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com"
        );
        assert_eq!(resolved.expand("{unknown}"), "{unknown}");
    }
}
