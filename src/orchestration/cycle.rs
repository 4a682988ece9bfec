//! The periodic orchestration cycle.
//!
//! Six passes run in a fixed order. Each pass checks its own precondition and
//! is isolated from the others: a failure is logged and recorded in the
//! [`CycleReport`], and the next pass runs regardless.
//!
//! An agent is a wake target when its roster status is idle or offline and
//! it has no controller in a non-startable state.

use std::collections::HashSet;

use serde_json::json;

use super::manager::AgentManager;
use super::types::{Assignment, CycleReport, PassError};
use crate::error::ManagerError;
use crate::model::{Agent, AgentType, HandoffFilter, HandoffStatus, NewEvent, TaskFilter, TaskStatus, kind};

impl AgentManager {
    /// Run every pass once. Never fails; per-pass errors land in the report.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock().lock().await;
        let mut report = CycleReport::default();

        // 1. Product owner triages the inbox.
        let result = self.wake_product_owner(&mut report).await;
        settle(&mut report, "wake_po", result);

        // 2. Addressees of pending handoffs.
        let result = self.wake_handoff_targets(&mut report).await;
        settle(&mut report, "wake_handoffs", result);

        // 3. Idle developers onto READY tasks.
        let result = self.assign_developers(&mut report).await;
        settle(&mut report, "assign_developers", result);

        // 4. QA picks up the oldest DONE task.
        let result = self.wake_qa(&mut report).await;
        settle(&mut report, "wake_qa", result);

        // 5. Reviewer for QA_PASSED tasks that need review.
        let result = self.wake_reviewer(&mut report).await;
        settle(&mut report, "wake_reviewer", result);

        // 6. Devops ships what is ready to go.
        let result = self.wake_devops(&mut report).await;
        settle(&mut report, "wake_devops", result);

        report
    }

    fn is_wake_target(&self, agent: &Agent) -> bool {
        agent.status.is_available() && !self.is_busy(&agent.name)
    }

    fn available_of_type(&self, agent_type: AgentType) -> Result<Vec<Agent>, ManagerError> {
        Ok(self
            .store()
            .agents()
            .list()?
            .into_iter()
            .filter(|a| a.agent_type == agent_type && self.is_wake_target(a))
            .collect())
    }

    async fn wake_product_owner(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let inbox = self.store().tasks().count_in(TaskStatus::Inbox)?;
        if inbox == 0 {
            return Ok(());
        }
        let Some(po) = self.available_of_type(AgentType::ProductOwner)?.into_iter().next() else {
            return Ok(());
        };
        self.start_agent(&po.name, None).await?;
        self.hub().record_or_warn(
            NewEvent::new(kind::ORCHESTRATOR_WAKE_PO)
                .agent(&po.name)
                .data(json!({ "inboxCount": inbox }))
                .message(format!("Woke {} for {inbox} inbox task(s)", po.name)),
        );
        report.started.push(Assignment {
            agent: po.name,
            task_id: None,
            reason: "wake_po",
        });
        Ok(())
    }

    async fn wake_handoff_targets(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let pending = self.store().handoffs().list(&HandoffFilter {
            status: Some(HandoffStatus::Pending),
            ..HandoffFilter::default()
        })?;

        let mut considered = HashSet::new();
        for handoff in pending {
            // Broadcast handoffs reach agents through their briefing only.
            let Some(target) = handoff.to_agent.as_deref() else {
                continue;
            };
            if !considered.insert(target.to_string()) {
                continue;
            }
            let Some(agent) = self.store().agents().get(target)? else {
                tracing::debug!(handoff = %handoff.id, target, "handoff addressed to unknown agent");
                continue;
            };
            if !self.is_wake_target(&agent) {
                continue;
            }
            match self.start_agent(target, None).await {
                Ok(_) => {
                    self.hub().record_or_warn(
                        NewEvent::new(kind::ORCHESTRATOR_WAKE_HANDOFF)
                            .agent(target)
                            .handoff(&handoff.id)
                            .task(handoff.task_id.as_deref())
                            .data(json!({ "handoffId": handoff.id, "from": handoff.from_agent }))
                            .message(format!("Woke {target} for handoff \"{}\"", handoff.title)),
                    );
                    report.started.push(Assignment {
                        agent: target.to_string(),
                        task_id: None,
                        reason: "wake_handoff",
                    });
                }
                Err(e) => settle(report, "wake_handoffs", Err(e)),
            }
        }
        Ok(())
    }

    async fn assign_developers(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let developers = self.available_of_type(AgentType::Developer)?;
        if developers.is_empty() {
            return Ok(());
        }

        // A READY task already handed to a live controller is still READY
        // until that agent claims it.
        let in_hand: HashSet<String> = self
            .running_agents()
            .into_iter()
            .filter_map(|r| r.task_id)
            .collect();
        let ready: Vec<_> = self
            .store()
            .tasks()
            .list(&TaskFilter::status(TaskStatus::Ready))?
            .into_iter()
            .filter(|t| !in_hand.contains(&t.id))
            .take(developers.len())
            .collect();

        for (developer, task) in developers.iter().zip(ready.iter()) {
            match self.start_agent(&developer.name, Some(&task.id)).await {
                Ok(_) => {
                    self.hub().record_or_warn(
                        NewEvent::new(kind::ORCHESTRATOR_ASSIGNED)
                            .agent(&developer.name)
                            .task(Some(&task.id))
                            .data(json!({ "taskId": task.id, "title": task.title }))
                            .message(format!("Assigned \"{}\" to {}", task.title, developer.name)),
                    );
                    report.started.push(Assignment {
                        agent: developer.name.clone(),
                        task_id: Some(task.id.clone()),
                        reason: "assign_developer",
                    });
                }
                Err(e) => settle(report, "assign_developers", Err(e)),
            }
        }
        Ok(())
    }

    async fn wake_qa(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let Some(task) = self.store().tasks().oldest_in(TaskStatus::Done)? else {
            return Ok(());
        };
        self.wake_with_task(report, AgentType::Qa, &task.id, &task.title, kind::ORCHESTRATOR_WAKE_QA, "wake_qa")
            .await
    }

    async fn wake_reviewer(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let Some(task) = self
            .store()
            .tasks()
            .list(&TaskFilter::status(TaskStatus::QaPassed))?
            .into_iter()
            .find(|t| t.review_required)
        else {
            return Ok(());
        };
        self.wake_with_task(
            report,
            AgentType::Reviewer,
            &task.id,
            &task.title,
            kind::ORCHESTRATOR_WAKE_REVIEWER,
            "wake_reviewer",
        )
        .await
    }

    async fn wake_devops(&self, report: &mut CycleReport) -> Result<(), ManagerError> {
        let tasks = self.store().tasks();
        let reviewed = tasks
            .list(&TaskFilter::status(TaskStatus::Reviewed).limit(1))?
            .into_iter()
            .next();
        let shippable = match reviewed {
            Some(task) => Some(task),
            None => tasks
                .list(&TaskFilter::status(TaskStatus::QaPassed))?
                .into_iter()
                .find(|t| !t.review_required),
        };
        let Some(task) = shippable else {
            return Ok(());
        };
        self.wake_with_task(
            report,
            AgentType::Devops,
            &task.id,
            &task.title,
            kind::ORCHESTRATOR_WAKE_DEVOPS,
            "wake_devops",
        )
        .await
    }

    /// Start the first available agent of `agent_type` on `task_id`.
    async fn wake_with_task(
        &self,
        report: &mut CycleReport,
        agent_type: AgentType,
        task_id: &str,
        title: &str,
        event_kind: &str,
        reason: &'static str,
    ) -> Result<(), ManagerError> {
        let Some(agent) = self.available_of_type(agent_type)?.into_iter().next() else {
            return Ok(());
        };
        self.start_agent(&agent.name, Some(task_id)).await?;
        self.hub().record_or_warn(
            NewEvent::new(event_kind)
                .agent(&agent.name)
                .task(Some(task_id))
                .data(json!({ "taskId": task_id }))
                .message(format!("Woke {} for \"{title}\"", agent.name)),
        );
        report.started.push(Assignment {
            agent: agent.name,
            task_id: Some(task_id.to_string()),
            reason,
        });
        Ok(())
    }
}

fn settle(report: &mut CycleReport, pass: &'static str, result: Result<(), ManagerError>) {
    if let Err(e) = result {
        tracing::warn!(pass, error = %e, "orchestration pass failed");
        report.errors.push(PassError {
            pass,
            message: e.to_string(),
        });
    }
}
