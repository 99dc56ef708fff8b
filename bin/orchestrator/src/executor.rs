//! Agents implemented as external commands.
//!
//! Each attempt spawns the configured program with the window described in
//! environment variables. The exit status decides the outcome:
//!
//! | exit | outcome |
//! |------|---------|
//! | 0    | success, output reference is the last stdout line |
//! | 3    | partial success, stderr lines become warnings |
//! | 69   | resources exhausted |
//! | 75   | transient failure |
//! | 78   | configuration error |
//! | other | executor failure |
//!
//! The child is killed when the attempt is cancelled or times out.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use trendline_pipeline::{AgentExecutor, AgentOutcome, ErrorKind, ExecutionRequest, OutputRef};

const EXIT_PARTIAL: i32 = 3;
const EXIT_UNAVAILABLE: i32 = 69;
const EXIT_TEMPFAIL: i32 = 75;
const EXIT_CONFIG: i32 = 78;

/// Trailing stderr kept in failure messages.
const STDERR_TAIL_BYTES: usize = 2_048;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    fn command(&self, request: &ExecutionRequest, inputs: String) -> Command {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .env("TRENDLINE_RUN_ID", request.run_id.to_string())
            .env("TRENDLINE_AGENT", request.agent.as_str())
            .env("TRENDLINE_WINDOW_START", request.window.start().to_rfc3339())
            .env("TRENDLINE_WINDOW_END", request.window.end().to_rfc3339())
            .env("TRENDLINE_ATTEMPT", request.attempt.to_string())
            .env("TRENDLINE_DEADLINE", request.deadline.to_rfc3339())
            .env("TRENDLINE_INPUTS", inputs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> AgentOutcome {
        let inputs = match serde_json::to_string(&request.inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                return AgentOutcome::failed(ErrorKind::Config {
                    reason: format!("cannot encode upstream inputs: {e}"),
                });
            }
        };
        let output = match self.command(&request, inputs).output().await {
            Ok(output) => output,
            Err(e) => {
                return AgentOutcome::failed(ErrorKind::Executor {
                    message: format!("cannot start '{}': {e}", self.spec.program),
                });
            }
        };
        debug!(
            agent = %request.agent,
            run_id = %request.run_id,
            status = %output.status,
            "agent command exited"
        );
        classify(output.status.code(), &output.stdout, &output.stderr)
    }
}

/// Maps an exit code and captured output to an outcome. `None` means the
/// process was killed by a signal.
fn classify(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> AgentOutcome {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let output = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(OutputRef::new);
    let message = tail(stderr.trim(), STDERR_TAIL_BYTES);

    match code {
        Some(0 | EXIT_PARTIAL) => {
            let Some(output) = output else {
                return AgentOutcome::failed(ErrorKind::Executor {
                    message: "agent exited without printing an output reference".to_string(),
                });
            };
            if code == Some(0) {
                return AgentOutcome::Succeeded { output };
            }
            AgentOutcome::PartialSuccess {
                output,
                warnings: stderr
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            }
        }
        Some(EXIT_UNAVAILABLE) => AgentOutcome::failed(ErrorKind::ResourceExhausted),
        Some(EXIT_TEMPFAIL) => AgentOutcome::failed(ErrorKind::Transient { message }),
        Some(EXIT_CONFIG) => AgentOutcome::failed(ErrorKind::Config { reason: message }),
        Some(code) => AgentOutcome::failed(ErrorKind::Executor {
            message: format!("exit status {code}: {message}"),
        }),
        None => AgentOutcome::failed(ErrorKind::Executor {
            message: format!("terminated by signal: {message}"),
        }),
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
