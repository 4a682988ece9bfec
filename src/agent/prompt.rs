//! Launch prompt assembly.
//!
//! Loads the agent's role definition from `{agency_dir}/agents/{name}/AGENT.md`
//! and appends runtime information, the context briefing, the API cheat
//! sheet and the interception-mode contract that lets the orchestrator
//! inject messages mid-task.

use std::path::{Path, PathBuf};

use chrono::Utc;

use super::context::{self, AgentContext};
use crate::error::ControllerError;
use crate::model::AgentType;
use crate::store::Store;

/// Where a launch happens and under which conversation id.
#[derive(Clone, Debug)]
pub struct RuntimeInfo {
    pub agent_name: String,
    pub agent_type: AgentType,
    pub agency_dir: PathBuf,
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    /// Base URL of the HTTP API, e.g. `http://127.0.0.1:3000/api`.
    pub api_base: String,
    pub external_session_id: String,
}

pub fn role_definition_path(agency_dir: &Path, agent_name: &str) -> PathBuf {
    agency_dir.join("agents").join(agent_name).join("AGENT.md")
}

/// Read the agent's role definition.
///
/// # Errors
///
/// Returns [`ControllerError::RoleDefinitionNotFound`] if the file cannot be read.
pub async fn load_role_definition(
    agency_dir: &Path,
    agent_name: &str,
) -> Result<String, ControllerError> {
    let path = role_definition_path(agency_dir, agent_name);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ControllerError::RoleDefinitionNotFound { path })
}

/// Build the complete prompt for a fresh launch.
pub async fn build_launch_prompt(
    store: &Store,
    runtime: &RuntimeInfo,
    task_id: Option<&str>,
) -> Result<String, ControllerError> {
    let role = load_role_definition(&runtime.agency_dir, &runtime.agent_name).await?;
    let context = context::build_context(
        store,
        &runtime.agent_name,
        runtime.agent_type,
        &runtime.projects_dir,
        task_id,
    )
    .await?;
    Ok(compose_prompt(&role, runtime, &context))
}

pub fn compose_prompt(role: &str, runtime: &RuntimeInfo, context: &AgentContext) -> String {
    let name = &runtime.agent_name;
    let api = &runtime.api_base;
    let mut prompt = format!(
        "\
{role}

## Runtime Information

- **Agency Directory:** {agency}
- **Data Directory:** {data}
- **Projects Directory:** {projects}
- **Current Time:** {now}
- **Session ID:** {session}

{briefing}
## API Integration

You can interact with the Agency system via HTTP API at {api}

### Key Endpoints
- GET {api}/tasks?status=READY - Get available tasks
- POST {api}/tasks/{{id}}/claim - Claim a task (body: {{\"agent\": \"{name}\"}})
- POST {api}/tasks/{{id}}/complete - Complete a task (body: {{\"summary\": \"...\", \"files_changed\": [...]}})
- POST {api}/agents/{name}/heartbeat - Send heartbeat

## INTERCEPTION MODE

The orchestrator can inject messages at any time. When you receive a new user message:
1. Acknowledge the interruption
2. Follow new instructions immediately
3. Do NOT continue previous work unless told to resume
",
        role = role.trim_end(),
        agency = runtime.agency_dir.display(),
        data = runtime.data_dir.display(),
        projects = runtime.projects_dir.display(),
        now = Utc::now().to_rfc3339(),
        session = runtime.external_session_id,
        briefing = context::format_as_text(context),
    );

    if let Some(task) = &context.current_task {
        prompt.push_str(&format!(
            "
## Your Assignment

You have been assigned to work on task {id}. The task details are shown above.
Please claim this task via the API and begin work immediately.
",
            id = task.id
        ));
        if runtime.agent_type == AgentType::Qa {
            prompt.push_str(
                "
### QA Notes
Review the \"Recent Work\" section above to understand what the developer implemented.
Check the files_changed list to know which files to test.
",
            );
        }
    }
    prompt
}

/// The urgent message injected when an agent is redirected to another task.
pub fn redirect_message(task_id: &str) -> String {
    format!(
        "URGENT: Stop current work immediately. Your new priority is task {task_id}. \
         Read the task details and begin work on it now."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, TaskStatus};
    use tempfile::TempDir;

    fn runtime(tmp: &TempDir, name: &str, agent_type: AgentType) -> RuntimeInfo {
        RuntimeInfo {
            agent_name: name.to_string(),
            agent_type,
            agency_dir: tmp.path().join("agency"),
            data_dir: tmp.path().join("data"),
            projects_dir: tmp.path().join("projects"),
            api_base: "http://127.0.0.1:3000/api".to_string(),
            external_session_id: "ext-123".to_string(),
        }
    }

    async fn write_role(tmp: &TempDir, name: &str, body: &str) {
        let path = role_definition_path(&tmp.path().join("agency"), name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, body).await.unwrap();
        tokio::fs::create_dir_all(tmp.path().join("projects")).await.unwrap();
    }

    #[tokio::test]
    async fn launch_prompt_layers_role_runtime_and_interception_mode() {
        let tmp = TempDir::new().unwrap();
        write_role(&tmp, "qa", "# QA\nYou test things.").await;
        let store = Store::open_in_memory().unwrap();
        let task = store
            .tasks()
            .create(&NewTask {
                status: Some(TaskStatus::Done),
                ..NewTask::titled("Fix login bug")
            })
            .unwrap();

        let prompt = build_launch_prompt(&store, &runtime(&tmp, "qa", AgentType::Qa), Some(&task.id))
            .await
            .unwrap();

        let role_pos = prompt.find("You test things.").unwrap();
        let runtime_pos = prompt.find("## Runtime Information").unwrap();
        let mode_pos = prompt.find("## INTERCEPTION MODE").unwrap();
        assert!(role_pos < runtime_pos && runtime_pos < mode_pos);
        assert!(prompt.contains("- **Session ID:** ext-123"));
        assert!(prompt.contains("POST http://127.0.0.1:3000/api/agents/qa/heartbeat"));
        assert!(prompt.contains(r#"(body: {"agent": "qa"})"#));
        assert!(prompt.contains(&format!("You have been assigned to work on task {}", task.id)));
        assert!(prompt.contains("### QA Notes"));
    }

    #[tokio::test]
    async fn no_assignment_section_without_a_task() {
        let tmp = TempDir::new().unwrap();
        write_role(&tmp, "dev-alpha", "You write code.").await;
        let store = Store::open_in_memory().unwrap();
        let prompt = build_launch_prompt(
            &store,
            &runtime(&tmp, "dev-alpha", AgentType::Developer),
            None,
        )
        .await
        .unwrap();
        assert!(!prompt.contains("## Your Assignment"));
        assert!(!prompt.contains("### QA Notes"));
        assert!(prompt.contains("You are the developer."));
    }

    #[tokio::test]
    async fn missing_role_definition_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let err = build_launch_prompt(&store, &runtime(&tmp, "ghost", AgentType::Devops), None)
            .await
            .unwrap_err();
        match err {
            ControllerError::RoleDefinitionNotFound { path } => {
                assert!(path.ends_with("agents/ghost/AGENT.md"));
            }
            other => panic!("Expected RoleDefinitionNotFound, got: {other}"),
        }
    }

    #[test]
    fn redirect_message_names_the_task() {
        assert!(redirect_message("t-9").starts_with("URGENT: Stop current work immediately. Your new priority is task t-9."));
    }
}
