//! Briefing assembled for an agent at launch: project metadata, its task,
//! recent work around it and handoffs waiting for it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{AgentType, Handoff, HandoffFilter, HandoffStatus, Task, TaskStatus};
use crate::store::Store;

/// Well-known project config filenames, searched in order under the projects root.
pub const PROJECT_CONFIG_FILES: [&str; 3] =
    ["agency-project.json", "agency.json", ".agency/project.json"];

/// How many late-stage tasks to show as recent work.
const RECENT_WORK_LIMIT: usize = 5;

/// Files listed per recent task before collapsing into "(+N more)".
const FILES_SHOWN: usize = 5;

const RECENT_WORK_STATUSES: [TaskStatus; 5] = [
    TaskStatus::Done,
    TaskStatus::QaPassed,
    TaskStatus::QaTesting,
    TaskStatus::Reviewed,
    TaskStatus::Shipped,
];

/// Project description read from `agency-project.json` (camelCase keys).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub name: String,
    pub description: String,
    /// Always the directory the config was loaded for, whatever the file says.
    pub root_path: PathBuf,
    pub tech_stack: Vec<String>,
    pub key_directories: BTreeMap<String, String>,
    pub current_focus: Option<String>,
    pub notes: Vec<String>,
}

impl ProjectConfig {
    /// Stand-in used when no config file exists.
    pub fn stub(root: &Path) -> Self {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown Project".to_string());
        Self {
            name,
            description: "No agency-project.json found. Create one for better context.".into(),
            root_path: root.to_path_buf(),
            ..Self::default()
        }
    }
}

/// Load the first well-known config under `root`, or a stub if none parses.
pub async fn load_project_config(root: &Path) -> ProjectConfig {
    for file in PROJECT_CONFIG_FILES {
        let path = root.join(file);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        match serde_json::from_str::<ProjectConfig>(&contents) {
            Ok(mut config) => {
                config.root_path = root.to_path_buf();
                return config;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse project config");
            }
        }
    }
    ProjectConfig::stub(root)
}

/// A late-stage task shown to the agent for orientation.
#[derive(Clone, Debug, Serialize)]
pub struct RecentWork {
    pub task: Task,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
}

/// Everything an agent is told about its surroundings at launch.
#[derive(Clone, Debug, Serialize)]
pub struct AgentContext {
    pub project: ProjectConfig,
    pub current_task: Option<Task>,
    pub recent_work: Vec<RecentWork>,
    pub pending_handoffs: Vec<Handoff>,
    pub workflow_position: String,
}

/// What the agent should do next given its task (or lack of one).
pub fn workflow_position(task: Option<&Task>, agent_type: AgentType) -> String {
    match task {
        Some(task) => task.status.workflow_hint().to_string(),
        None => format!("You are the {agent_type}. Check for work appropriate to your role."),
    }
}

pub async fn build_context(
    store: &Store,
    agent_name: &str,
    agent_type: AgentType,
    projects_root: &Path,
    task_id: Option<&str>,
) -> Result<AgentContext, StoreError> {
    let project = load_project_config(projects_root).await;
    let current_task = match task_id {
        Some(id) => store.tasks().get(id)?,
        None => None,
    };
    let recent_work = store
        .tasks()
        .recent_in(&RECENT_WORK_STATUSES, RECENT_WORK_LIMIT)?
        .into_iter()
        .map(|task| RecentWork {
            summary: task.summary.clone(),
            files_changed: task.files_changed.clone(),
            task,
        })
        .collect();
    let pending_handoffs = store.handoffs().list(&HandoffFilter {
        to_agent: Some(agent_name.to_string()),
        status: Some(HandoffStatus::Pending),
        limit: None,
    })?;
    let workflow_position = workflow_position(current_task.as_ref(), agent_type);

    Ok(AgentContext {
        project,
        current_task,
        recent_work,
        pending_handoffs,
        workflow_position,
    })
}

/// Render the context as markdown sections, skipping any with no data.
pub fn format_as_text(context: &AgentContext) -> String {
    let mut sections: Vec<String> = Vec::new();

    let project = &context.project;
    let mut head = format!("## Project: {}\n\n", project.name);
    if !project.description.is_empty() {
        head.push_str(&format!("{}\n\n", project.description));
    }
    head.push_str(&format!("**Root Path:** `{}`\n", project.root_path.display()));
    if !project.tech_stack.is_empty() {
        head.push_str(&format!("**Tech Stack:** {}\n", project.tech_stack.join(", ")));
    }
    if let Some(focus) = &project.current_focus {
        head.push_str(&format!("**Current Focus:** {focus}\n"));
    }
    sections.push(head);

    if !project.key_directories.is_empty() {
        let dirs: Vec<String> = project
            .key_directories
            .iter()
            .map(|(key, path)| format!("- **{key}:** `{path}`"))
            .collect();
        sections.push(format!("### Key Directories\n{}\n", dirs.join("\n")));
    }

    if !project.notes.is_empty() {
        let notes: Vec<String> = project.notes.iter().map(|n| format!("- {n}")).collect();
        sections.push(format!("### Notes\n{}\n", notes.join("\n")));
    }

    if let Some(task) = &context.current_task {
        sections.push(format_task(task));
    }

    sections.push(format!("## Workflow Position\n\n{}\n", context.workflow_position));

    if !context.recent_work.is_empty() {
        let items: Vec<String> = context.recent_work.iter().map(format_recent).collect();
        sections.push(format!(
            "## Recent Work (for context)\n\n{}\n",
            items.join("\n\n")
        ));
    }

    if !context.pending_handoffs.is_empty() {
        let items: Vec<String> = context
            .pending_handoffs
            .iter()
            .map(|h| {
                format!(
                    "### {}\n**From:** {} | **Priority:** {} | **Type:** {}\n\n{}\n",
                    h.title, h.from_agent, h.priority, h.kind, h.content
                )
            })
            .collect();
        sections.push(format!(
            "## Pending Handoffs For You\n\n{}\n",
            items.join("\n")
        ));
    }

    sections.join("\n")
}

fn format_task(task: &Task) -> String {
    let mut out = format!(
        "## Your Current Task\n\n**Title:** {}\n**ID:** {}\n**Status:** {}\n**Priority:** {}\n**Size:** {}\n\n",
        task.title, task.id, task.status, task.priority, task.size
    );
    match task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => out.push_str(&format!("{description}\n\n")),
        None => out.push_str("No description provided.\n\n"),
    }
    if !task.acceptance_criteria.is_empty() {
        let items: Vec<String> = task
            .acceptance_criteria
            .iter()
            .map(|c| format!("- [ ] {c}"))
            .collect();
        out.push_str(&format!("### Acceptance Criteria\n{}\n\n", items.join("\n")));
    }
    if let Some(extra) = task.context.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str(&format!("### Additional Context\n{extra}\n\n"));
    }
    if let Some(agent) = &task.assigned_to {
        out.push_str(&format!("**Assigned to:** {agent}\n"));
    }
    out
}

fn format_recent(work: &RecentWork) -> String {
    let mut item = format!(
        "- **{}** ({})\n  {}",
        work.task.title,
        work.task.status,
        work.summary.as_deref().unwrap_or("No summary")
    );
    if !work.files_changed.is_empty() {
        let shown: Vec<&str> = work
            .files_changed
            .iter()
            .take(FILES_SHOWN)
            .map(String::as_str)
            .collect();
        item.push_str(&format!("\n  Files: {}", shown.join(", ")));
        if work.files_changed.len() > FILES_SHOWN {
            item.push_str(&format!(
                " (+{} more)",
                work.files_changed.len() - FILES_SHOWN
            ));
        }
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HandoffKind, NewHandoff, NewTask, Priority};

    #[tokio::test]
    async fn missing_config_yields_stub_named_after_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("shop-frontend");
        std::fs::create_dir_all(&root).unwrap();
        let config = load_project_config(&root).await;
        assert_eq!(config.name, "shop-frontend");
        assert!(config.tech_stack.is_empty());
        assert_eq!(config.root_path, root);
    }

    #[tokio::test]
    async fn first_parseable_config_wins_and_root_is_overridden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agency-project.json"), "{ broken").unwrap();
        std::fs::write(
            dir.path().join("agency.json"),
            r#"{"name":"Shop","description":"Storefront","rootPath":"/elsewhere","techStack":["Rust","SQLite"],"keyDirectories":{"src":"src/"}}"#,
        )
        .unwrap();
        let config = load_project_config(dir.path()).await;
        assert_eq!(config.name, "Shop");
        assert_eq!(config.root_path, dir.path());
        assert_eq!(config.key_directories["src"], "src/");
    }

    #[tokio::test]
    async fn context_collects_task_recent_work_and_handoffs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let task = store
            .tasks()
            .create(&NewTask {
                status: Some(TaskStatus::Ready),
                priority: Some(Priority::P1),
                acceptance_criteria: vec!["Login succeeds".into()],
                ..NewTask::titled("Fix login bug")
            })
            .unwrap();
        let shipped = store.tasks().create(&NewTask::titled("Old feature")).unwrap();
        store.tasks().set_status(&shipped.id, TaskStatus::Shipped).unwrap();
        store
            .handoffs()
            .create(&NewHandoff {
                from_agent: "tech-lead".into(),
                to_agent: Some("dev-alpha".into()),
                kind: HandoffKind::Clarification,
                title: "Use the new session API".into(),
                content: "See docs/auth.md".into(),
                task_id: None,
                priority: None,
            })
            .unwrap();

        let context = build_context(
            &store,
            "dev-alpha",
            AgentType::Developer,
            dir.path(),
            Some(&task.id),
        )
        .await
        .unwrap();
        assert_eq!(context.current_task.as_ref().unwrap().id, task.id);
        assert_eq!(context.recent_work.len(), 1);
        assert_eq!(context.pending_handoffs.len(), 1);
        assert_eq!(context.workflow_position, TaskStatus::Ready.workflow_hint());

        let text = format_as_text(&context);
        assert!(text.contains("## Your Current Task"));
        assert!(text.contains("- [ ] Login succeeds"));
        assert!(text.contains("**Old feature** (SHIPPED)\n  No summary"));
        assert!(text.contains("**From:** tech-lead | **Priority:** normal | **Type:** clarification"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let context = AgentContext {
            project: ProjectConfig::stub(Path::new("/work/app")),
            current_task: None,
            recent_work: Vec::new(),
            pending_handoffs: Vec::new(),
            workflow_position: workflow_position(None, AgentType::Qa),
        };
        let text = format_as_text(&context);
        assert!(text.contains("## Project: app"));
        assert!(text.contains("You are the qa. Check for work appropriate to your role."));
        assert!(!text.contains("Key Directories"));
        assert!(!text.contains("Your Current Task"));
        assert!(!text.contains("Recent Work"));
        assert!(!text.contains("Pending Handoffs"));
        assert!(!text.contains("Tech Stack"));
    }

    #[test]
    fn long_file_lists_are_truncated() {
        let store = Store::open_in_memory().unwrap();
        let task = store.tasks().create(&NewTask::titled("Big change")).unwrap();
        let work = RecentWork {
            summary: Some("Refactored".into()),
            files_changed: (1..=7).map(|i| format!("f{i}.rs")).collect(),
            task,
        };
        let item = format_recent(&work);
        assert!(item.ends_with("Files: f1.rs, f2.rs, f3.rs, f4.rs, f5.rs (+2 more)"));
    }
}
