//! Best-effort table detection through an external command.
//!
//! The detector receives the PDF path as its last argument and prints a JSON
//! array of table descriptions on stdout. Nothing about the result shape is
//! interpreted here; the array is stored verbatim under `_tables`.

use crate::config::ToolCommand;
use crate::error::ToolError;
use crate::pipeline::tools::{run_tool, scratch_dir, ToolInvocation};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait TableDetector: Send + Sync {
    /// Detected tables, or an error; callers record errors as "no tables".
    async fn detect(&self, pdf: &Path) -> Result<Vec<Value>, ToolError>;
}

#[derive(Debug, Clone)]
pub struct CommandTableDetector {
    command: ToolCommand,
    timeout: Duration,
}

impl CommandTableDetector {
    pub fn new(command: ToolCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl TableDetector for CommandTableDetector {
    async fn detect(&self, pdf: &Path) -> Result<Vec<Value>, ToolError> {
        let home = scratch_dir("pdfindex-tables-")?;
        let invocation = ToolInvocation::new(&self.command.program, self.timeout)
            .args(&self.command.args)
            .arg(pdf);
        let output = run_tool(&invocation, home.path()).await?;
        parse_tables(&self.command.program, &output.stdout)
    }
}

fn parse_tables(program: &str, stdout: &[u8]) -> Result<Vec<Value>, ToolError> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(tables)) => Ok(tables),
        Ok(other) => Err(ToolError::BadOutput {
            program: program.to_string(),
            detail: format!("expected a JSON array, got {}", type_name(&other)),
        }),
        Err(e) => Err(ToolError::BadOutput {
            program: program.to_string(),
            detail: e.to_string(),
        }),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_output() {
        let tables = parse_tables("det", br#"[{"page": 2, "rows": 4}]"#).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0]["page"], 2);
    }

    #[test]
    fn empty_output_is_no_tables() {
        assert!(parse_tables("det", b"  \n").unwrap().is_empty());
    }

    #[test]
    fn non_array_rejected() {
        let err = parse_tables("det", br#"{"tables": []}"#).unwrap_err();
        assert!(err.to_string().contains("object"));
        assert!(parse_tables("det", b"not json").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_pdf_path() {
        let detector = CommandTableDetector::new(
            "sh -c".parse::<ToolCommand>().unwrap().arg("printf '[\"%s\"]' \"$0\""),
            Duration::from_secs(5),
        );
        let tables = detector.detect(Path::new("/tmp/doc.pdf")).await.unwrap();
        assert_eq!(tables, vec![Value::String("/tmp/doc.pdf".into())]);
    }
}
