use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft_core::config::SandboxConfig;

use crate::descriptor::{ParamKind, ParamSpec, SandboxProfile, SkillDescriptor};
use crate::registry::{Skill, SkillOutcome};
use crate::sandbox::run_command;

/// Run an allow-listed command as a direct subprocess. No shell is ever
/// involved; the command string is split into argv by whitespace.
pub struct ShellRunSkill {
    descriptor: SkillDescriptor,
    timeout: Duration,
}

impl ShellRunSkill {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "shell_run".to_string(),
                description: "Run an allow-listed command and return its output".to_string(),
                params: vec![ParamSpec::required("command", ParamKind::String)],
                sandbox: SandboxProfile {
                    network: Some(false),
                    fs_scope: None,
                    timeout_secs: Some(config.shell_timeout_secs),
                },
                secret_sensitive: false,
            },
            timeout: Duration::from_secs(config.shell_timeout_secs),
        }
    }
}

#[async_trait]
impl Skill for ShellRunSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, args: Value) -> SkillOutcome {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return SkillOutcome::error("missing command");
        };
        run_command(command, self.timeout).await
    }
}
