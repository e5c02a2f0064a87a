use std::path::Path;

use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::invoker::{self, ToolRequest};

/// What the cleanup pass managed to remove. Warnings never change the run's
/// already-determined status.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub warnings: Vec<PipelineError>,
}

/// Remove each locally tagged reference through the registry client. Missing
/// local tags are not errors, so repeated cleanup calls are safe; anything
/// else that fails becomes a logged warning.
pub fn remove_local_tags(client: &str, tags: &[String], cwd: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();

    for tag in tags {
        let request = ToolRequest {
            cwd: Some(cwd.to_path_buf()),
            ..ToolRequest::new(client).args(["rmi", tag.as_str()])
        };

        match invoker::run(&request) {
            Ok(result) if result.success() => {
                debug!(tag = %tag, "Removed local image tag");
                report.removed.push(tag.clone());
            }
            Ok(result) if is_missing_tag(&result.stderr) => {
                debug!(tag = %tag, "Local image tag already absent");
            }
            Ok(result) => {
                let warning = PipelineError::Cleanup {
                    tag: tag.clone(),
                    reason: format!(
                        "exit code {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    ),
                };
                warn!(tag = %tag, "{warning}");
                report.warnings.push(warning);
            }
            Err(err) => {
                let warning = PipelineError::Cleanup {
                    tag: tag.clone(),
                    reason: err.to_string(),
                };
                warn!(tag = %tag, "{warning}");
                report.warnings.push(warning);
            }
        }
    }

    report
}

fn is_missing_tag(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such image") || lowered.contains("not found")
}
