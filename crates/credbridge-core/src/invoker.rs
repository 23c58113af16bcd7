//! Credential helper invocation
//!
//! Runs `docker-credential-<name> <verb>` with the operand on stdin, the
//! caller's environment inherited, and both output streams captured.

use crate::{BridgeError, Command, CredentialRecord, HelperConfig, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Substring native helpers print when a credential is missing
pub const NOT_FOUND_MARKER: &str = "credentials not found";

/// Default deadline for a single helper call
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a helper call the bridge understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOutcome {
    /// `get` returned a credential
    Found(CredentialRecord),
    /// The store has nothing for this server
    NotFound,
    /// `store`/`erase` succeeded
    Completed,
    /// `list` output: server URL → username
    Listed(HashMap<String, String>),
}

/// Raw output of one helper process
#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// stdout followed by stderr
    pub combined: String,
}

impl HelperOutput {
    /// Whether a failed call is the helper's "no such credential" answer
    pub fn reports_not_found(&self) -> bool {
        !self.success && self.combined.to_lowercase().contains(NOT_FOUND_MARKER)
    }
}

/// Runs resolved helpers
#[derive(Debug, Clone)]
pub struct HelperInvoker {
    timeout: Duration,
}

impl Default for HelperInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_HELPER_TIMEOUT)
    }
}

impl HelperInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the helper once. The child is killed if the deadline passes.
    pub async fn run(&self, helper: &HelperConfig, verb: Command, input: &[u8]) -> Result<HelperOutput> {
        tracing::debug!("Calling {} {}", helper.binary_name, verb);

        let call = async {
            let mut child = tokio::process::Command::new(&helper.resolved_path)
                .arg(verb.as_str())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    BridgeError::Invocation(format!(
                        "failed to start {}: {}",
                        helper.resolved_path.display(),
                        e
                    ))
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                // A helper that exits without reading stdin is not an error here
                if let Err(e) = stdin.write_all(input).await {
                    tracing::debug!("Helper closed stdin early: {}", e);
                }
                drop(stdin);
            }

            let output = child.wait_with_output().await?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}{}", stdout, stderr).trim().to_string();

            Ok::<_, BridgeError>(HelperOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout,
                combined,
            })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Timeout calling {} {}, helper killed",
                    helper.binary_name,
                    verb
                );
                Err(BridgeError::HelperTimeout(self.timeout.as_secs()))
            }
        }
    }

    /// `get`: stdin is the server URL
    pub async fn get(&self, helper: &HelperConfig, server_url: &str) -> Result<HelperOutcome> {
        let output = self.run(helper, Command::Get, server_url.as_bytes()).await?;
        if let Some(outcome) = check_failure(&output)? {
            return Ok(outcome);
        }

        let record: CredentialRecord = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            BridgeError::Invocation(format!("failed to parse credential response: {}", e))
        })?;
        if record.is_empty() {
            return Ok(HelperOutcome::NotFound);
        }
        Ok(HelperOutcome::Found(record))
    }

    /// `store`: stdin is the serialized record
    pub async fn store(&self, helper: &HelperConfig, record: &CredentialRecord) -> Result<HelperOutcome> {
        let payload = serde_json::to_vec(record)?;
        let output = self.run(helper, Command::Store, &payload).await?;
        Ok(check_failure(&output)?.unwrap_or(HelperOutcome::Completed))
    }

    /// `erase`: stdin is the server URL
    pub async fn erase(&self, helper: &HelperConfig, server_url: &str) -> Result<HelperOutcome> {
        let output = self.run(helper, Command::Erase, server_url.as_bytes()).await?;
        Ok(check_failure(&output)?.unwrap_or(HelperOutcome::Completed))
    }

    /// `list`: no operand
    pub async fn list(&self, helper: &HelperConfig) -> Result<HelperOutcome> {
        let output = self.run(helper, Command::List, b"").await?;
        if let Some(outcome) = check_failure(&output)? {
            return Ok(outcome);
        }
        let body = output.stdout.trim();
        if body.is_empty() {
            return Ok(HelperOutcome::Listed(HashMap::new()));
        }
        let entries: HashMap<String, String> = serde_json::from_str(body).map_err(|e| {
            BridgeError::Invocation(format!("failed to parse list response: {}", e))
        })?;
        Ok(HelperOutcome::Listed(entries))
    }
}

/// Map a non-zero exit to `NotFound` or an invocation error
fn check_failure(output: &HelperOutput) -> Result<Option<HelperOutcome>> {
    if output.success {
        return Ok(None);
    }
    if output.reports_not_found() {
        return Ok(Some(HelperOutcome::NotFound));
    }
    let code = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Err(BridgeError::Invocation(format!(
        "exit status {}: {}",
        code, output.combined
    )))
}
