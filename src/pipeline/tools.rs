//! Bounded external-process invocation.
//!
//! Every external tool (rasterizer, OCR engine, repair tools, table detector)
//! goes through [`run_tool`]:
//!
//! - `HOME` points at a private scratch directory, so tools that write caches
//!   or config never touch the service user's home.
//! - A timeout kills the process (`kill_on_drop`) and its output is discarded.
//! - Only the listed exit codes count as success; anything else becomes
//!   [`ToolError::Failed`] carrying the tool's stderr.

use crate::error::ToolError;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt kept in an error.
const STDERR_EXCERPT: usize = 2000;

/// A fully described external invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub timeout: Duration,
    /// Exit codes treated as success. Default: `[0]`.
    pub success_codes: Vec<i32>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            success_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `invocation` with `HOME` set to `home`, killing it on timeout.
pub async fn run_tool(invocation: &ToolInvocation, home: &Path) -> Result<ToolOutput, ToolError> {
    let program = invocation.program.clone();
    debug!(program = %program, args = ?invocation.args, "Running external tool");

    let child = Command::new(&invocation.program)
        .args(&invocation.args)
        .env("HOME", home)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound {
                program: program.clone(),
            },
            _ => ToolError::Io {
                program: program.clone(),
                source: e,
            },
        })?;

    let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolError::Io {
            program: program.clone(),
            source: e,
        })?,
        Err(_) => {
            warn!(program = %program, secs = invocation.timeout.as_secs(), "External tool timed out, killed");
            return Err(ToolError::Timeout {
                program,
                secs: invocation.timeout.as_secs(),
            });
        }
    };

    let code = output.status.code();
    match code {
        Some(c) if invocation.success_codes.contains(&c) => Ok(ToolOutput {
            code: c,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        _ => Err(ToolError::Failed {
            program,
            code,
            stderr: stderr_excerpt(&output.stderr),
        }),
    }
}

/// Run `invocation` and read the file it was expected to write.
pub async fn run_tool_for_file(
    invocation: &ToolInvocation,
    home: &Path,
    output_path: &Path,
) -> Result<Vec<u8>, ToolError> {
    run_tool(invocation, home).await?;
    match tokio::fs::read(output_path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(ToolError::MissingOutput {
            program: invocation.program.clone(),
            path: output_path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ToolError::MissingOutput {
            program: invocation.program.clone(),
            path: output_path.to_path_buf(),
        }),
        Err(e) => Err(ToolError::Io {
            program: invocation.program.clone(),
            source: e,
        }),
    }
}

/// A scratch directory usable as a private `HOME`.
pub fn scratch_dir(prefix: &str) -> Result<tempfile::TempDir, ToolError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|e| ToolError::Io {
            program: prefix.to_string(),
            source: e,
        })
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.chars().count() > STDERR_EXCERPT {
        let cut: String = text.chars().take(STDERR_EXCERPT).collect();
        format!("{cut}…")
    } else {
        text.to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_ms: u64) -> ToolInvocation {
        ToolInvocation::new("sh", Duration::from_millis(timeout_ms)).args(["-c", script])
    }

    #[tokio::test]
    async fn home_is_private_scratch() {
        let home = tempfile::tempdir().unwrap();
        let out = run_tool(&sh("printf %s \"$HOME\"", 5000), home.path())
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout), home.path().to_string_lossy());
    }

    #[tokio::test]
    async fn disallowed_exit_code_carries_stderr() {
        let home = tempfile::tempdir().unwrap();
        let err = run_tool(&sh("echo broken xref >&2; exit 2", 5000), home.path())
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "broken xref");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn warning_exit_code_accepted() {
        let home = tempfile::tempdir().unwrap();
        let out = run_tool(&sh("exit 3", 5000).success_codes(&[0, 3]), home.path())
            .await
            .unwrap();
        assert_eq!(out.code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let home = tempfile::tempdir().unwrap();
        let err = run_tool(&sh("sleep 5", 100), home.path()).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let home = tempfile::tempdir().unwrap();
        let inv = ToolInvocation::new("definitely-not-a-real-tool-xyz", Duration::from_secs(1));
        let err = run_tool(&inv, home.path()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_output_file_reported() {
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("out.pdf");
        let err = run_tool_for_file(&sh("true", 5000), home.path(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { .. }));

        let inv = sh(&format!("printf data > '{}'", target.display()), 5000);
        let bytes = run_tool_for_file(&inv, home.path(), &target).await.unwrap();
        assert_eq!(bytes, b"data");
    }
}
