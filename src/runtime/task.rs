//! Tasks: the resolved, backend-bound unit of sandboxed work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::resources::{EffectiveResources, Resources};
use super::security::{SecurityProfile, SecurityRequirements};
use crate::tools::{Arguments, Tool};
use crate::types::TaskId;

/// Task lifecycle state.
///
/// ```text
/// PREPARED → SANDBOX_ACQUIRING → RUNNING → {SUCCEEDED | FAILED | TIMED_OUT | CANCELLED} → RELEASED
/// ```
///
/// `Failed` and `Cancelled` are also reachable before `Running` (rejected at
/// planning, acquisition failure, cancelled while acquiring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Prepared,
    SandboxAcquiring,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Released,
}

impl TaskState {
    /// Outcome states, reached exactly once before `Released`.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TaskState::Released
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        match (self, to) {
            // PREPARED
            (TaskState::Prepared, TaskState::SandboxAcquiring) => true,
            (TaskState::Prepared, TaskState::Failed) => true,
            // SANDBOX_ACQUIRING
            (TaskState::SandboxAcquiring, TaskState::Running) => true,
            (TaskState::SandboxAcquiring, TaskState::Failed) => true,
            (TaskState::SandboxAcquiring, TaskState::Cancelled) => true,
            // RUNNING
            (TaskState::Running, TaskState::Succeeded) => true,
            (TaskState::Running, TaskState::Failed) => true,
            (TaskState::Running, TaskState::TimedOut) => true,
            (TaskState::Running, TaskState::Cancelled) => true,
            // Outcomes
            (from, TaskState::Released) => from.is_outcome(),
            // RELEASED is terminal
            _ => false,
        }
    }
}

/// How a sandbox starts the tool. Supplied by the backend's tool manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entrypoint {
    /// Nothing configured; the sandbox rejects the task.
    #[default]
    Unspecified,
    /// Host executable.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Container image and optional command override.
    Image {
        image: String,
        #[serde(default)]
        command: Vec<String>,
    },
    /// WebAssembly module and the export to call.
    Module {
        path: PathBuf,
        #[serde(default = "default_export")]
        export: String,
    },
}

fn default_export() -> String {
    "run".to_string()
}

/// One unit of sandboxed work. Consumed by exactly one `Runtime::execute`.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub tool: Tool,
    pub input: Arguments,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    pub requirements: SecurityRequirements,
    pub entrypoint: Entrypoint,
    /// Surface tool progress lines as progress events.
    pub stream_progress: bool,
}

impl Task {
    pub fn new(tool: Tool, input: Arguments) -> Self {
        Self {
            id: TaskId::new(),
            tool,
            input,
            env: BTreeMap::new(),
            resources: Resources::default(),
            requirements: SecurityRequirements::default(),
            entrypoint: Entrypoint::Unspecified,
            stream_progress: false,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_requirements(mut self, requirements: SecurityRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Entrypoint) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.stream_progress = enabled;
        self
    }

    /// Input serialized as the JSON document handed to the tool.
    pub fn input_json(&self) -> String {
        Value::Object(self.input.clone()).to_string()
    }
}

/// Outcome of one `Runtime::execute` call that reached a running sandbox
/// and finished on its own (zero or non-zero exit).
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub profile: SecurityProfile,
    pub resources: EffectiveResources,
    /// Every state the task passed through, ending in `Released`.
    pub states: Vec<TaskState>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn final_outcome(&self) -> Option<TaskState> {
        self.states.iter().rev().copied().find(|s| s.is_outcome())
    }

    /// Tool output: stdout parsed as JSON, or the trimmed text when it is not
    /// JSON. Empty stdout is `null`.
    pub fn output_value(&self) -> Value {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_transitions() {
        use TaskState::*;
        assert!(Prepared.can_transition_to(SandboxAcquiring));
        assert!(SandboxAcquiring.can_transition_to(Running));
        assert!(Running.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Released));
        assert!(Cancelled.can_transition_to(Released));
    }

    #[test]
    fn test_invalid_transitions() {
        use TaskState::*;
        assert!(!Prepared.can_transition_to(Running));
        assert!(!Running.can_transition_to(Released));
        assert!(!Released.can_transition_to(Prepared));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!SandboxAcquiring.can_transition_to(TimedOut));
    }

    #[test]
    fn test_entrypoint_serde() {
        let ep: Entrypoint =
            serde_json::from_value(json!({"type": "command", "program": "jq"})).unwrap();
        assert_eq!(
            ep,
            Entrypoint::Command {
                program: "jq".into(),
                args: vec![]
            }
        );
        let ep: Entrypoint =
            serde_json::from_value(json!({"type": "module", "path": "add.wasm"})).unwrap();
        assert!(matches!(ep, Entrypoint::Module { export, .. } if export == "run"));
    }

    fn result_with_stdout(stdout: &str) -> TaskResult {
        TaskResult {
            task_id: TaskId::new(),
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::from_millis(3),
            started_at: Utc::now(),
            profile: SecurityProfile::None,
            resources: Resources::default()
                .resolve(&Resources::default())
                .unwrap(),
            states: vec![TaskState::Running, TaskState::Succeeded, TaskState::Released],
        }
    }

    #[test]
    fn test_output_value_parses_json_or_falls_back_to_text() {
        assert_eq!(result_with_stdout("{\"a\": 1}\n").output_value(), json!({"a": 1}));
        assert_eq!(result_with_stdout("plain text\n").output_value(), json!("plain text"));
        assert_eq!(result_with_stdout("  \n").output_value(), Value::Null);
    }

    #[test]
    fn test_final_outcome() {
        assert_eq!(
            result_with_stdout("").final_outcome(),
            Some(TaskState::Succeeded)
        );
    }
}
