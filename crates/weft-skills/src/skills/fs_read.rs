use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use weft_core::config::SandboxConfig;

use crate::descriptor::{ParamKind, ParamSpec, SandboxProfile, SkillDescriptor};
use crate::registry::{Skill, SkillOutcome};
use crate::sandbox::resolve_in_root;

/// Largest file the skill will return.
const MAX_READ_BYTES: u64 = 256 * 1024;

/// Read a file confined to the `files` scope under the workspace root.
pub struct FsReadSkill {
    descriptor: SkillDescriptor,
    scope_root: PathBuf,
}

impl FsReadSkill {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "fs_read".to_string(),
                description: "Read a text file from the assistant workspace".to_string(),
                params: vec![ParamSpec::required("path", ParamKind::Path)],
                sandbox: SandboxProfile {
                    network: Some(false),
                    fs_scope: Some("files".to_string()),
                    timeout_secs: None,
                },
                secret_sensitive: false,
            },
            scope_root: PathBuf::from(&config.workspace_root).join("files"),
        }
    }
}

#[async_trait]
impl Skill for FsReadSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, args: Value) -> SkillOutcome {
        let Some(requested) = args.get("path").and_then(|v| v.as_str()) else {
            return SkillOutcome::error("missing path");
        };

        let resolved = match resolve_in_root(&self.scope_root, requested) {
            Ok(p) => p,
            Err(reason) => return SkillOutcome::denied(reason),
        };

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.len() > MAX_READ_BYTES => {
                return SkillOutcome::error(format!(
                    "file too large: {} bytes (max {MAX_READ_BYTES})",
                    meta.len()
                ));
            }
            Err(e) => return SkillOutcome::error(format!("cannot stat {requested}: {e}")),
            Ok(_) => {}
        }

        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => SkillOutcome::ok(Value::String(content)),
            Err(e) => SkillOutcome::error(format!("cannot read {requested}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn skill_with_root(root: &std::path::Path) -> FsReadSkill {
        let mut config = SandboxConfig::default();
        config.workspace_root = root.to_string_lossy().into_owned();
        std::fs::create_dir_all(root.join("files")).unwrap();
        FsReadSkill::new(&config)
    }

    #[tokio::test]
    async fn reads_file_inside_scope() {
        let dir = tempfile::tempdir().unwrap();
        let skill = skill_with_root(dir.path());
        std::fs::write(dir.path().join("files/a.txt"), "X").unwrap();

        let out = skill.run(json!({"path": "a.txt"})).await;
        assert!(out.ok);
        assert_eq!(out.result, json!("X"));
    }

    #[tokio::test]
    async fn rejects_escape_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let skill = skill_with_root(dir.path());

        let out = skill.run(json!({"path": "../../etc/passwd"})).await;
        assert!(!out.ok);
        assert!(out.error.unwrap().starts_with("denied:"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error_not_a_denial() {
        let dir = tempfile::tempdir().unwrap();
        let skill = skill_with_root(dir.path());

        let out = skill.run(json!({"path": "nope.txt"})).await;
        assert!(!out.ok);
        assert!(!out.error.unwrap().starts_with("denied:"));
    }
}
