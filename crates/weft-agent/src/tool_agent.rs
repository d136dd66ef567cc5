//! The ToolAgent — stateless dispatcher from a tool call to a ToolResult.
//!
//! Lookup, schema validation, sandboxed execution, and the audit entry all
//! happen here; the orchestrator only sees the resulting envelope payload.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use weft_bus::envelope::ToolResult;
use weft_core::types::TaskId;
use weft_skills::{SandboxRunner, SkillRegistry};

pub struct ToolAgent {
    registry: Arc<SkillRegistry>,
    runner: SandboxRunner,
}

impl ToolAgent {
    pub fn new(registry: Arc<SkillRegistry>, runner: SandboxRunner) -> Self {
        Self { registry, runner }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Dispatch a named tool call. Never fails — every problem becomes an
    /// `ok=false` result so the model can recover or apologize.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        actor: &str,
        name: &str,
        arguments: Value,
    ) -> ToolResult {
        debug!(task_id = %task_id, skill = name, "tool dispatch");

        let Some(skill) = self.registry.get(name) else {
            return ToolResult {
                name: name.to_string(),
                ok: false,
                result: Value::Null,
                error: Some(format!("denied:unknown skill: {name}")),
                extra: Default::default(),
            };
        };

        let outcome = self
            .runner
            .invoke(skill, arguments, actor, task_id.as_str())
            .await;

        ToolResult {
            name: name.to_string(),
            ok: outcome.ok,
            result: outcome.result,
            error: outcome.error,
            extra: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::config::SandboxConfig;
    use weft_skills::skills::{FsReadSkill, ShellRunSkill};
    use weft_skills::{AuditLog, Skill};

    fn agent_with(skills: Vec<Arc<dyn Skill>>) -> (ToolAgent, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let runner = SandboxRunner::new(SandboxConfig::default(), Arc::clone(&audit));
        (
            ToolAgent::new(Arc::new(SkillRegistry::new(skills)), runner),
            audit,
        )
    }

    #[tokio::test]
    async fn unknown_skill_is_a_denial_result() {
        let (agent, _) = agent_with(vec![]);
        let result = agent
            .dispatch(&TaskId::from("t1"), "u1", "no_such", json!({}))
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().starts_with("denied:"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_denied_before_execution() {
        let (agent, audit) = agent_with(vec![Arc::new(ShellRunSkill::new(
            &SandboxConfig::default(),
        ))]);
        let result = agent
            .dispatch(&TaskId::from("t2"), "u1", "shell_run", json!({"cmd": "ls"}))
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("denied:"));

        // The denial still produced an audit entry.
        let entries = audit.by_correlation("t2").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn successful_dispatch_audits_with_task_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.workspace_root = dir.path().to_string_lossy().into_owned();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/a.txt"), "X").unwrap();

        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let runner = SandboxRunner::new(config.clone(), Arc::clone(&audit));
        let agent = ToolAgent::new(
            Arc::new(SkillRegistry::new(vec![Arc::new(FsReadSkill::new(&config))])),
            runner,
        );

        let result = agent
            .dispatch(&TaskId::from("t3"), "u1", "fs_read", json!({"path": "a.txt"}))
            .await;
        assert!(result.ok);
        assert_eq!(result.result, json!("X"));

        let entries = audit.by_correlation("t3").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "ok");
    }
}
