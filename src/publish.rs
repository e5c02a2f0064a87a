use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::invoker::{self, ToolRequest};
use crate::params::ResolvedParameters;

/// Registry coordinates for the built image. `update_latest` controls
/// whether the floating tag moves on every publish; default `true`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishSpec {
    /// Registry host template, e.g. `{account_id}.dkr.ecr.{region}.amazonaws.com`.
    pub registry: String,
    /// Repository template, e.g. `{repo_name}`.
    pub repository: String,
    /// Registry client binary used for tag/push/rmi.
    #[serde(default = "default_client")]
    pub client: String,
    #[serde(default = "default_update_latest")]
    pub update_latest: bool,
    #[serde(default = "default_latest_tag")]
    pub latest_tag: String,
}

fn default_client() -> String {
    "docker".to_string()
}

fn default_update_latest() -> bool {
    true
}

fn default_latest_tag() -> String {
    "latest".to_string()
}

/// The two references derived for one build: the unique build-identifier tag
/// and, policy permitting, the floating tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSet {
    pub build: String,
    pub latest: Option<String>,
}

impl TagSet {
    pub fn all(&self) -> Vec<String> {
        let mut tags = vec![self.build.clone()];
        if let Some(latest) = &self.latest {
            tags.push(latest.clone());
        }
        tags
    }
}

/// Derive the full tag references from the publish spec, the resolved
/// parameters and the build identifier.
pub fn tag_refs(spec: &PublishSpec, params: &ResolvedParameters, build_id: u64) -> TagSet {
    let registry = params.expand(&spec.registry);
    let repository = params.expand(&spec.repository);
    let base = format!("{registry}/{repository}");
    TagSet {
        build: format!("{base}:{build_id}"),
        latest: spec
            .update_latest
            .then(|| format!("{base}:{}", spec.latest_tag)),
    }
}

/// What actually made it to the registry. `failure` is set as soon as a tag
/// or push step fails; pushes after the failing one are not attempted.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub pushed: Vec<String>,
    pub unpushed: Vec<String>,
    pub failure: Option<String>,
}

impl PublishReport {
    /// True when the registry holds the build-identifier tag but a later push
    /// failed, leaving the floating tag stale. Surfaced distinctly from a
    /// full failure.
    pub fn is_partial(&self) -> bool {
        self.failure.is_some() && !self.pushed.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Apply every tag to the built image, then push each tag independently, the
/// build-identifier tag before the floating tag. Both reference the same
/// content; the ordering is a documented convention so `latest` never leads
/// the identifier tag.
pub fn tag_and_push(
    client: &str,
    image: &str,
    tags: &TagSet,
    cwd: &Path,
    env: &[(String, String)],
    redact: &[String],
) -> Result<PublishReport, PipelineError> {
    let ordered = tags.all();
    let mut report = PublishReport::default();

    for tag in &ordered {
        let result = run_client(client, &["tag", image, tag], cwd, env, redact)?;
        if !result.success() {
            report.failure = Some(format!(
                "tagging '{tag}' failed with exit code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
            report.unpushed = ordered.clone();
            return Ok(report);
        }
    }

    for (index, tag) in ordered.iter().enumerate() {
        let result = run_client(client, &["push", tag], cwd, env, redact)?;
        if result.success() {
            info!(tag = %tag, "Pushed image tag");
            report.pushed.push(tag.clone());
        } else {
            report.failure = Some(format!(
                "push of '{tag}' failed with exit code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
            report.unpushed = ordered[index..].to_vec();
            if report.is_partial() {
                warn!(
                    pushed = ?report.pushed,
                    unpushed = ?report.unpushed,
                    "Partial publish: registry holds the build tag but the floating tag was not updated"
                );
            }
            return Ok(report);
        }
    }

    Ok(report)
}

fn run_client(
    client: &str,
    args: &[&str],
    cwd: &Path,
    env: &[(String, String)],
    redact: &[String],
) -> Result<invoker::ToolResult, PipelineError> {
    let request = ToolRequest {
        env: env.to_vec(),
        cwd: Some(cwd.to_path_buf()),
        redact: redact.to_vec(),
        ..ToolRequest::new(client).args(args.iter().copied())
    };
    invoker::run(&request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterKind, ParameterSpec, resolve};
    use std::collections::BTreeMap;

    fn demo_params() -> ResolvedParameters {
        let schema = vec![
            ParameterSpec {
                name: "repo_name".to_string(),
                default: Some("demo-ecr".to_string()),
                kind: ParameterKind::String,
                description: None,
            },
            ParameterSpec {
                name: "account_id".to_string(),
                default: Some("123456789012".to_string()),
                kind: ParameterKind::String,
                description: None,
            },
            ParameterSpec {
                name: "region".to_string(),
                default: Some("us-east-1".to_string()),
                kind: ParameterKind::String,
                description: None,
            },
        ];
        resolve(&schema, &BTreeMap::new()).unwrap()
    }

    fn demo_spec() -> PublishSpec {
        PublishSpec {
            registry: "{account_id}.dkr.ecr.{region}.amazonaws.com".to_string(),
            repository: "{repo_name}".to_string(),
            client: default_client(),
            update_latest: true,
            latest_tag: default_latest_tag(),
        }
    }

    #[test]
    fn tag_refs_expand_registry_and_repository() {
        let tags = tag_refs(&demo_spec(), &demo_params(), 42);
        assert_eq!(
            tags.build,
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/demo-ecr:42"
        );
        assert_eq!(
            tags.latest.as_deref(),
            Some("123456789012.dkr.ecr.us-east-1.amazonaws.com/demo-ecr:latest")
        );
    }

    #[test]
    fn build_tag_always_precedes_latest() {
        let tags = tag_refs(&demo_spec(), &demo_params(), 7);
        let all = tags.all();
        assert_eq!(all.len(), 2);
        assert!(all[0].ends_with(":7"));
        assert!(all[1].ends_with(":latest"));
    }

    #[test]
    fn latest_tag_respects_update_policy() {
        let mut spec = demo_spec();
        spec.update_latest = false;
        let tags = tag_refs(&spec, &demo_params(), 42);
        assert!(tags.latest.is_none());
        assert_eq!(tags.all().len(), 1);
    }
}
