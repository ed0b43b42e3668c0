//! A [`GenerationBackend`] that runs a bridge subprocess per request.
//!
//! The bridge protocol is one JSON object each way:
//!
//! ```text
//! stdin  → {"template": "...", "variables": {...}, "pdl_file": "..."}
//! stdout ← {"success": true,  "content": "..."}
//!        ← {"success": false, "error": "...", "error_type": "ai_error"}
//! ```
//!
//! The bridge owns prompt rendering and the model call. The process is
//! killed if the request future is dropped, which is how the arbiter's
//! timeout reaches it.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{GenerationBackend, GenerationError, TemplateVars};

/// How to launch the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Prompt definition file forwarded to the bridge as `pdl_file`.
    pub template_file: Option<String>,
    /// Working directory for the child, if not the current one.
    pub working_dir: Option<PathBuf>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["bridge.py".to_string()],
            template_file: Some("story.pdl".to_string()),
            working_dir: None,
        }
    }
}

/// Runs the configured bridge once per request.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    template: &'a str,
    variables: &'a TemplateVars,
    #[serde(skip_serializing_if = "Option::is_none")]
    pdl_file: Option<&'a str>,
}

#[derive(Deserialize)]
struct BridgeResponse {
    success: bool,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

impl GenerationBackend for ProcessBackend {
    async fn invoke(
        &self,
        template: &str,
        variables: &TemplateVars,
    ) -> Result<String, GenerationError> {
        let request = serde_json::to_vec(&BridgeRequest {
            template,
            variables,
            pdl_file: self.config.template_file.as_deref(),
        })
        .map_err(|e| GenerationError::Backend(format!("failed to encode request: {e}")))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            GenerationError::Backend(format!(
                "failed to spawn {}: {e}",
                self.config.program.display()
            ))
        })?;
        debug!(template, pid = child.id(), "bridge process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .map_err(|e| GenerationError::Backend(format!("failed to write request: {e}")))?;
            // Dropping stdin closes the pipe so the bridge sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GenerationError::Backend(format!("bridge process failed: {e}")))?;

        parse_bridge_output(&output.stdout, output.status.code(), &output.stderr)
    }
}

/// Interprets what the bridge printed.
///
/// A failed bridge still prints a JSON reply before exiting non-zero, so
/// stdout is parsed first and the exit code only matters when it is not
/// JSON.
fn parse_bridge_output(
    stdout: &[u8],
    exit_code: Option<i32>,
    stderr: &[u8],
) -> Result<String, GenerationError> {
    let response: BridgeResponse = match serde_json::from_slice(stdout) {
        Ok(response) => response,
        Err(e) if exit_code == Some(0) => {
            return Err(GenerationError::MalformedResponse(format!(
                "bridge output is not a valid reply: {e}"
            )));
        }
        Err(_) => {
            let stderr = String::from_utf8_lossy(stderr);
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(GenerationError::Backend(format!(
                "bridge exited with {code}: {}",
                stderr.trim()
            )));
        }
    };

    if !response.success {
        let kind = response.error_type.as_deref().unwrap_or("unknown");
        let message = response.error.as_deref().unwrap_or("no error message");
        return Err(GenerationError::Backend(format!("{kind}: {message}")));
    }

    match response.content {
        Some(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
        _ => Err(GenerationError::MalformedResponse(
            "bridge reported success without content".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bridge_output_success_returns_trimmed_content() {
        let out = br#"{"success": true, "content": "  The fire crackled.\n", "template": "t"}"#;
        assert_eq!(
            parse_bridge_output(out, Some(0), b"").unwrap(),
            "The fire crackled."
        );
    }

    #[test]
    fn test_parse_bridge_output_failure_reply_is_backend_error() {
        let out = br#"{"success": false, "error": "no such file", "error_type": "file_not_found"}"#;
        let err = parse_bridge_output(out, Some(1), b"").unwrap_err();
        assert_eq!(
            err,
            GenerationError::Backend("file_not_found: no such file".into())
        );
    }

    #[test]
    fn test_parse_bridge_output_empty_content_is_malformed() {
        let out = br#"{"success": true, "content": "   "}"#;
        assert!(matches!(
            parse_bridge_output(out, Some(0), b""),
            Err(GenerationError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_bridge_output_garbage_with_clean_exit_is_malformed() {
        assert!(matches!(
            parse_bridge_output(b"hello", Some(0), b""),
            Err(GenerationError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_bridge_output_crash_reports_stderr() {
        let err = parse_bridge_output(b"", Some(2), b"Traceback: boom\n").unwrap_err();
        assert_eq!(
            err,
            GenerationError::Backend("bridge exited with 2: Traceback: boom".into())
        );
    }

    #[test]
    fn test_request_serializes_bridge_fields() {
        let mut variables = TemplateVars::new();
        variables.insert("seed_text".into(), "a lighthouse".into());
        let json = serde_json::to_value(BridgeRequest {
            template: "story_continuation",
            variables: &variables,
            pdl_file: Some("story.pdl"),
        })
        .unwrap();
        assert_eq!(json["template"], "story_continuation");
        assert_eq!(json["variables"]["seed_text"], "a lighthouse");
        assert_eq!(json["pdl_file"], "story.pdl");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_runs_bridge_script() {
        let backend = ProcessBackend::new(ProcessBackendConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                r#"cat > /dev/null; printf '{"success": true, "content": "Once upon a time"}'"#
                    .into(),
            ],
            template_file: None,
            working_dir: None,
        });
        let text = backend
            .invoke("story_continuation", &TemplateVars::new())
            .await
            .unwrap();
        assert_eq!(text, "Once upon a time");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_missing_program_is_backend_error() {
        let backend = ProcessBackend::new(ProcessBackendConfig {
            program: PathBuf::from("/nonexistent/taleweave-bridge"),
            args: vec![],
            template_file: None,
            working_dir: None,
        });
        let err = backend
            .invoke("story_continuation", &TemplateVars::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Backend(_)));
    }
}
