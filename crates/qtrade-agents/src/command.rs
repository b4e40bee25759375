use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use qtrade_models::agent_message::{AnalysisResult, PartialDecision};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agent::{finding_str, Agent, AgentContext};
use crate::error::AgentError;
use crate::parser::parse_command_reply;

/// How to invoke an external agent executable.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            timeout: Duration::from_secs(30),
        }
    }
}

/// Run the command, write `input` to its stdin and return its stdout.
pub async fn run_command(input: &str, config: &CommandConfig) -> Result<String, AgentError> {
    debug!(program = %config.program, "Invoking agent command");

    let output = tokio::time::timeout(config.timeout, async {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }
        child.wait_with_output().await
    })
    .await
    .map_err(|_| AgentError::Timeout(config.timeout.as_millis() as u64))?
    .map_err(|e| AgentError::Command(format!("Failed to run {}: {e}", config.program)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(program = %config.program, status = %output.status, stderr = %stderr, "Agent command failed");
        return Err(AgentError::Command(format!(
            "{} exited {}: {}",
            config.program, output.status, stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if stdout.trim().is_empty() {
        return Err(AgentError::Command(format!(
            "{} returned empty output",
            config.program
        )));
    }

    Ok(stdout)
}

/// An agent implemented by an external executable.
///
/// The executable receives the agent context as JSON on stdin and prints a
/// reply containing `action`, `confidence`, and optionally `rationale` and
/// `findings`.
pub struct CommandAgent {
    id: String,
    config: CommandConfig,
}

impl CommandAgent {
    pub fn new(id: impl Into<String>, config: CommandConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, context: &AgentContext) -> Result<AnalysisResult, AgentError> {
        let input = serde_json::to_string(context)?;
        let raw = run_command(&input, &self.config).await?;
        let reply = parse_command_reply(&raw)?;

        let mut analysis = AnalysisResult::new(&self.id, context.tier, reply.score());
        analysis.findings = reply.findings;
        Ok(analysis
            .with_finding("action", serde_json::json!(reply.action.as_str()))
            .with_finding("rationale", serde_json::json!(reply.rationale)))
    }

    async fn decide(&self, analysis: &AnalysisResult) -> Result<PartialDecision, AgentError> {
        let action = finding_str(analysis, "action")?
            .parse()
            .map_err(AgentError::Parse)?;
        let rationale = finding_str(analysis, "rationale")
            .map(str::to_string)
            .unwrap_or_default();

        Ok(PartialDecision {
            action,
            confidence: analysis.confidence,
            rationale,
            factors: analysis.findings.clone(),
        })
    }
}
