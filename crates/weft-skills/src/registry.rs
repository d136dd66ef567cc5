//! Process-local skill registry, populated once at startup.
//!
//! The registry is immutable after construction: introducing a new skill
//! requires a restart. Lookup is by the skill's unique name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::descriptor::SkillDescriptor;

/// Outcome of one skill invocation, carried verbatim into `ToolResult`.
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub ok: bool,
    pub result: Value,
    pub error: Option<String>,
}

impl SkillOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn denied(reason: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(format!("denied:{reason}")),
        }
    }

    pub fn timeout() -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some("timeout".to_string()),
        }
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &SkillDescriptor;

    /// Execute with already-validated arguments. Implementations must stay
    /// inside their declared sandbox profile; the runner enforces timeouts
    /// and path/command gates on top.
    async fn run(&self, args: Value) -> SkillOutcome;
}

pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    /// Build the registry from the startup skill set. Duplicate names panic:
    /// that is a wiring bug, not a runtime condition.
    pub fn new(skills: Vec<Arc<dyn Skill>>) -> Self {
        let mut map: HashMap<String, Arc<dyn Skill>> = HashMap::with_capacity(skills.len());
        for skill in skills {
            let name = skill.descriptor().name.clone();
            info!(skill = %name, "skill registered");
            if map.insert(name.clone(), skill).is_some() {
                panic!("duplicate skill name at startup: {name}");
            }
        }
        Self { skills: map }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.skills.get(name)
    }

    /// Descriptors of every registered skill, sorted by name for
    /// deterministic tool listings.
    pub fn descriptors(&self) -> Vec<SkillDescriptor> {
        let mut out: Vec<SkillDescriptor> = self
            .skills
            .values()
            .map(|s| s.descriptor().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
