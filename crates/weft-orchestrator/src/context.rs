//! TaskContext assembly.
//!
//! The context is rebuilt from storage at every iteration so the window
//! reflects tool results appended since the last model call.

use weft_agent::TaskContext;
use weft_bus::Kv;
use weft_core::Result;
use weft_skills::{ParamKind, ParamSpec, SandboxProfile, SkillDescriptor, SkillRegistry};
use weft_tasks::Task;

/// Pseudo-skill the model calls to ask the human for a go-ahead. Handled by
/// the orchestrator's confirmation path, never dispatched to the registry.
pub const CONFIRM_SKILL: &str = "user_confirm";

pub fn confirm_descriptor() -> SkillDescriptor {
    SkillDescriptor {
        name: CONFIRM_SKILL.to_string(),
        description: "Ask the user to confirm or reject an action before proceeding".to_string(),
        params: vec![
            ParamSpec::required("message", ParamKind::String),
            ParamSpec::optional("timeout_sec", ParamKind::Integer),
        ],
        sandbox: SandboxProfile::default(),
        secret_sensitive: false,
    }
}

/// Build the context for one iteration: identity, short-term window, and
/// the user-scoped memory fragments in fixed order (summary first, then the
/// free-form data block).
pub fn build_context(task: &Task, kv: &Kv, registry: &SkillRegistry) -> Result<TaskContext> {
    let summary = kv.get(&format!("user:{}:summary", task.user_id))?;
    let data = kv.get(&format!("user:{}:data", task.user_id))?;

    let mut memory = Vec::new();
    if let Some(s) = summary {
        memory.push(s);
    }
    if let Some(d) = data {
        memory.push(d);
    }

    let mut skills = registry.descriptors();
    skills.push(confirm_descriptor());

    Ok(TaskContext {
        user_id: task.user_id.clone(),
        channel: task.channel.clone(),
        chat_id: task.chat_id.clone(),
        window: task.window.clone(),
        memory,
        skills,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::{ChannelTag, ChatId, TaskId, UserId};

    #[test]
    fn memory_blocks_keep_fixed_order() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set("user:u1:summary", "summary-block").unwrap();
        kv.set("user:u1:data", "data-block").unwrap();

        let task = Task::new(
            TaskId::new(),
            UserId::from("u1"),
            ChannelTag::telegram(),
            ChatId::from("1"),
            "m1".into(),
        );
        let registry = SkillRegistry::new(vec![]);
        let ctx = build_context(&task, &kv, &registry).unwrap();

        assert_eq!(ctx.memory, vec!["summary-block", "data-block"]);
    }

    #[test]
    fn absent_memory_yields_no_fragments() {
        let kv = Kv::open_in_memory().unwrap();
        let task = Task::new(
            TaskId::new(),
            UserId::from("u2"),
            ChannelTag::telegram(),
            ChatId::from("1"),
            "m1".into(),
        );
        let registry = SkillRegistry::new(vec![]);
        let ctx = build_context(&task, &kv, &registry).unwrap();
        assert!(ctx.memory.is_empty());
    }

    #[test]
    fn confirm_pseudo_skill_is_always_offered() {
        let kv = Kv::open_in_memory().unwrap();
        let task = Task::new(
            TaskId::new(),
            UserId::from("u1"),
            ChannelTag::telegram(),
            ChatId::from("1"),
            "m1".into(),
        );
        let registry = SkillRegistry::new(vec![]);
        let ctx = build_context(&task, &kv, &registry).unwrap();
        assert!(ctx.skills.iter().any(|d| d.name == CONFIRM_SKILL));
    }
}
