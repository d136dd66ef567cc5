use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use weft_tasks::TaskStore;

use crate::descriptor::{ParamKind, ParamSpec, SandboxProfile, SkillDescriptor};
use crate::registry::{Skill, SkillOutcome};

/// List a user's recent tasks via the store's per-user index.
pub struct TaskListSkill {
    descriptor: SkillDescriptor,
    tasks: Arc<TaskStore>,
}

impl TaskListSkill {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "task_list".to_string(),
                description: "List the calling user's tasks and their statuses".to_string(),
                params: vec![ParamSpec::required("user_id", ParamKind::String)],
                sandbox: SandboxProfile {
                    network: Some(false),
                    fs_scope: None,
                    timeout_secs: Some(5),
                },
                secret_sensitive: false,
            },
            tasks,
        }
    }
}

#[async_trait]
impl Skill for TaskListSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, args: Value) -> SkillOutcome {
        let Some(user_id) = args.get("user_id").and_then(|v| v.as_str()) else {
            return SkillOutcome::error("missing user_id");
        };

        let ids = match self.tasks.list_by_user(&user_id.into()) {
            Ok(ids) => ids,
            Err(e) => return SkillOutcome::error(format!("task index unavailable: {e}")),
        };

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(Some(task)) = self.tasks.get(&id) {
                rows.push(serde_json::json!({
                    "id": task.id,
                    "status": task.status.to_string(),
                    "iterations": task.iterations,
                    "created_at": task.created_at,
                }));
            }
        }
        SkillOutcome::ok(Value::Array(rows))
    }
}
