//! Built-in skill bodies.
//!
//! These exercise the dispatch contract end to end: filesystem scope
//! (`fs_read`), the command allow-list (`shell_run`), and the task store's
//! per-user index (`task_list`). Richer integrations register the same way
//! at startup.

mod fs_read;
mod shell_run;
mod task_list;

pub use fs_read::FsReadSkill;
pub use shell_run::ShellRunSkill;
pub use task_list::TaskListSkill;

use std::sync::Arc;

use weft_core::config::SandboxConfig;
use weft_tasks::TaskStore;

use crate::registry::{Skill, SkillRegistry};

/// Assemble the default startup skill set.
pub fn default_registry(config: &SandboxConfig, tasks: Arc<TaskStore>) -> SkillRegistry {
    let skills: Vec<Arc<dyn Skill>> = vec![
        Arc::new(FsReadSkill::new(config)),
        Arc::new(ShellRunSkill::new(config)),
        Arc::new(TaskListSkill::new(tasks)),
    ];
    SkillRegistry::new(skills)
}
