//! Sandbox runner — the system boundary for an untrusted operation.
//!
//! Enforcement layers, in order:
//!   1. Argument validation against the skill's declared parameter schema.
//!   2. Network policy: off by default, per-skill enablement gated by the
//!      global switch.
//!   3. Filesystem scope: paths are canonicalized and rejected when they
//!      escape the declared root (symlink traversal resolves first).
//!   4. Command gate for shell-like skills: the program name must match an
//!      allow-list entry literally, and a deny-pattern scan vetoes dangerous
//!      constructs. Command interpretation is never delegated to a shell.
//!   5. Wall-clock timeout: expiry kills the subprocess and yields
//!      `ok=false, error="timeout"`.
//!
//! Every invocation, success or failure, emits exactly one audit entry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use weft_core::config::SandboxConfig;

use crate::audit::{AuditEntry, AuditLog};
use crate::registry::{Skill, SkillOutcome};

/// Cap on captured subprocess output fed back to the model.
const MAX_CAPTURED_BYTES: usize = 32 * 1024;

pub struct SandboxRunner {
    config: SandboxConfig,
    audit: Arc<AuditLog>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig, audit: Arc<AuditLog>) -> Self {
        Self { config, audit }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run a skill under its sandbox profile. The returned outcome is what
    /// goes on the wire as `ToolResult` — failures are data, not errors.
    pub async fn invoke(
        &self,
        skill: &Arc<dyn Skill>,
        args: Value,
        actor: &str,
        correlation: &str,
    ) -> SkillOutcome {
        let descriptor = skill.descriptor();
        let started = Instant::now();

        let outcome = self.invoke_inner(skill, &args).await;

        let entry = AuditEntry::for_skill(
            actor,
            &descriptor.name,
            correlation,
            &args,
            &outcome,
            started.elapsed().as_millis() as u64,
        );
        if let Err(e) = self.audit.record(&entry) {
            // The invocation already happened; losing the audit row is worth
            // a loud log line but must not fail the tool result.
            warn!(skill = %descriptor.name, error = %e, "audit write failed");
        }

        outcome
    }

    async fn invoke_inner(&self, skill: &Arc<dyn Skill>, args: &Value) -> SkillOutcome {
        let descriptor = skill.descriptor();

        if let Err(reason) = descriptor.validate(args) {
            return SkillOutcome::denied(reason);
        }

        let wants_network = descriptor.sandbox.network.unwrap_or(false);
        if wants_network && !self.config.network_enabled {
            return SkillOutcome::denied("network disabled by sandbox policy");
        }

        let timeout_secs = descriptor
            .sandbox
            .timeout_secs
            .unwrap_or(self.config.timeout_secs);

        debug!(skill = %descriptor.name, timeout_secs, "sandbox invoke");

        match tokio::time::timeout(Duration::from_secs(timeout_secs), skill.run(args.clone()))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => SkillOutcome::timeout(),
        }
    }

}

/// Execute an allow-listed command as a direct subprocess (argv, no shell).
/// Returns combined stdout/stderr, truncated to a sane cap.
pub async fn run_command(command: &str, timeout: Duration) -> SkillOutcome {
    if let Err(reason) = check_command(command) {
        return SkillOutcome::denied(reason);
    }

    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return SkillOutcome::denied("empty command");
    };
    let args: Vec<&str> = parts.collect();

    let child = tokio::process::Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Err(_) => SkillOutcome::timeout(),
        Ok(Err(e)) => SkillOutcome::error(format!("spawn failed: {e}")),
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.stderr.is_empty() {
                text.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            if text.len() > MAX_CAPTURED_BYTES {
                text.truncate(MAX_CAPTURED_BYTES);
                text.push_str("\n[output truncated]");
            }
            if output.status.success() {
                SkillOutcome::ok(Value::String(text))
            } else {
                SkillOutcome {
                    ok: false,
                    result: Value::String(text),
                    error: Some(format!(
                        "exit status {}",
                        output.status.code().unwrap_or(-1)
                    )),
                }
            }
        }
    }
}

/// Canonicalize `requested` against `root` and reject scope escapes.
///
/// Nonexistent targets are resolved through their parent directory so write
/// destinations can be checked before creation.
pub fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let root = root
        .canonicalize()
        .map_err(|e| format!("scope root unavailable: {e}"))?;

    let raw = Path::new(requested);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };

    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            // Target may not exist yet — canonicalize the parent and
            // re-append the final component.
            let parent = joined
                .parent()
                .ok_or_else(|| "path has no parent".to_string())?;
            let name = joined
                .file_name()
                .ok_or_else(|| "path has no file name".to_string())?;
            parent
                .canonicalize()
                .map_err(|e| format!("invalid path: {e}"))?
                .join(name)
        }
    };

    if !resolved.starts_with(&root) {
        return Err(format!("path escapes sandbox scope: {requested}"));
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Command gate
// ---------------------------------------------------------------------------

/// Programs a shell-like skill may invoke. The first token of the command
/// must equal one of these literally — prefix tricks like `lsof` for `ls`
/// do not match.
const ALLOWED_PROGRAMS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "echo", "date", "whoami", "hostname", "uname", "grep",
    "find", "git", "rustc", "sort", "uniq",
];

/// `(substring_pattern, reason)` pairs scanned against the lowercased
/// command. The first match vetoes. Checked even for allow-listed programs:
/// an argument can smuggle a dangerous construct.
const DENY_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "recursive forced removal from root"),
    ("rm -rf /*", "recursive forced removal of root children"),
    ("curl", "raw network fetch is not permitted"),
    ("wget", "raw network fetch is not permitted"),
    ("| sh", "piping into a shell interpreter"),
    ("| bash", "piping into a shell interpreter"),
    ("|sh", "piping into a shell interpreter"),
    ("|bash", "piping into a shell interpreter"),
    ("$(", "command substitution"),
    ("`", "command substitution"),
    ("> /etc/", "writing under /etc"),
    (">> /etc/", "writing under /etc"),
    ("dd if=", "raw disk I/O"),
    ("mkfs", "filesystem creation"),
    ("sudo", "privilege escalation"),
    ("shutdown", "system state change"),
    ("reboot", "system state change"),
];

/// Gate a shell-like command. `Ok(())` when safe to execute, `Err(reason)`
/// otherwise.
pub fn check_command(command: &str) -> Result<(), String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err("empty command".to_string());
    }

    let lower = trimmed.to_lowercase();
    for (pattern, reason) in DENY_PATTERNS {
        if lower.contains(pattern) {
            return Err(format!("{reason} (matched pattern: `{pattern}`)"));
        }
    }

    let program = trimmed.split_whitespace().next().unwrap_or("");
    if !ALLOWED_PROGRAMS.contains(&program) {
        return Err(format!("program not on allow-list: {program}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Command gate ---

    #[test]
    fn allowlisted_program_passes() {
        assert!(check_command("ls -la /tmp").is_ok());
        assert!(check_command("git status --short").is_ok());
        assert!(check_command("echo hello world").is_ok());
    }

    #[test]
    fn program_match_is_literal_not_prefix() {
        assert!(check_command("lsblk").is_err());
        assert!(check_command("gitk").is_err());
    }

    #[test]
    fn unknown_program_is_denied() {
        let err = check_command("nmap localhost").unwrap_err();
        assert!(err.contains("allow-list"));
    }

    #[test]
    fn deny_pattern_vetoes_allowlisted_program() {
        // "echo" is allow-listed but the argument smuggles a veto pattern.
        assert!(check_command("echo x > /etc/passwd").is_err());
        assert!(check_command("grep -r pattern . | sh").is_err());
    }

    #[test]
    fn deny_rm_rf_root() {
        let err = check_command("rm -rf /").unwrap_err();
        assert!(err.contains("recursive"));
    }

    #[test]
    fn deny_raw_curl() {
        assert!(check_command("curl https://example.com").is_err());
    }

    #[test]
    fn deny_is_case_insensitive() {
        assert!(check_command("SUDO apt install x").is_err());
    }

    #[test]
    fn empty_command_is_denied() {
        assert!(check_command("   ").is_err());
    }

    // --- Path resolution ---

    #[test]
    fn relative_path_resolves_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let p = resolve_in_root(dir.path(), "a.txt").unwrap();
        assert!(p.ends_with("a.txt"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in_root(dir.path(), "../outside.txt").unwrap_err();
        assert!(err.contains("escapes"));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_in_root(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();
        assert!(resolve_in_root(dir.path(), "link").is_err());
    }

    #[test]
    fn nonexistent_target_resolves_through_parent() {
        let dir = tempfile::tempdir().unwrap();
        let p = resolve_in_root(dir.path(), "new-file.txt").unwrap();
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
    }

    // --- Subprocess execution ---

    #[tokio::test]
    async fn run_command_captures_stdout() {
        let out = run_command("echo hello-sandbox", Duration::from_secs(5)).await;
        assert!(out.ok);
        assert!(out.result.as_str().unwrap().contains("hello-sandbox"));
    }

    #[tokio::test]
    async fn run_command_denies_unlisted_program() {
        let out = run_command("nmap localhost", Duration::from_secs(5)).await;
        assert!(!out.ok);
        assert!(out.error.unwrap().starts_with("denied:"));
    }

    #[tokio::test]
    async fn run_command_reports_nonzero_exit() {
        let out = run_command("cat /definitely/not/a/file", Duration::from_secs(5)).await;
        assert!(!out.ok);
        assert!(out.error.unwrap().contains("exit status"));
    }
}
