//! Autostart manifest execution inside a conversation's sandbox runtime.
//!
//! Repositories declare startup commands in `.openhands/autostart.yaml`. Once
//! a runtime exists and the repo is cloned, the commands run in manifest
//! order with condition gating, background rewriting and per-command
//! timeouts. Autostart is best-effort: every failure is logged and skipped,
//! nothing propagates out.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::host::{CmdRequest, Runtime};

/// Manifest location relative to the workspace (or cloned repo) root.
pub const MANIFEST_RELATIVE_PATH: &str = ".openhands/autostart.yaml";

const CONDITION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const OUTPUT_TAIL_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct RawManifest {
    /// Legacy schema: top-level list of commands.
    startup: Option<Vec<RawCommand>>,
    /// Current schema: `autostart: { enabled, commands }`.
    autostart: Option<RawAutostart>,
}

#[derive(Debug, Deserialize)]
struct RawAutostart {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    commands: Vec<RawCommand>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    name: Option<String>,
    command: Option<String>,
    condition: Option<String>,
    #[serde(default)]
    background: bool,
    timeout: Option<u64>,
}

/// A normalized startup command.
#[derive(Debug, Clone, PartialEq)]
pub struct AutostartCommand {
    pub name: String,
    pub command: String,
    /// Shell test expression; the command runs only when `[ <condition> ]`
    /// exits 0.
    pub condition: Option<String>,
    pub background: bool,
    pub timeout: Duration,
}

/// Parse a manifest, accepting both the legacy and current schemas and
/// normalizing into a single command list. Entries without a command are
/// dropped with a warning.
pub fn parse_manifest(content: &str) -> Result<Vec<AutostartCommand>, serde_yaml::Error> {
    let raw: RawManifest = serde_yaml::from_str(content)?;

    let entries = if let Some(startup) = raw.startup {
        startup
    } else if let Some(autostart) = raw.autostart {
        if autostart.enabled {
            autostart.commands
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    Ok(entries.into_iter().filter_map(normalize).collect())
}

fn normalize(raw: RawCommand) -> Option<AutostartCommand> {
    let name = raw.name.unwrap_or_else(|| "unnamed".to_string());
    let command = match raw.command {
        Some(command) if !command.is_empty() => command,
        _ => {
            warn!(name = %name, "autostart: skipping entry with no command");
            return None;
        }
    };
    Some(AutostartCommand {
        name,
        command,
        condition: raw.condition,
        background: raw.background,
        timeout: Duration::from_secs(raw.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)),
    })
}

/// Resolve the manifest path for a workspace, inside the cloned repo when a
/// repository is selected.
pub fn manifest_path(workspace_path: &str, selected_repository: Option<&str>) -> String {
    match selected_repository {
        Some(repo) => {
            let leaf = repo.rsplit('/').next().unwrap_or(repo);
            format!("{}/{}/{}", workspace_path, leaf, MANIFEST_RELATIVE_PATH)
        }
        None => format!("{}/{}", workspace_path, MANIFEST_RELATIVE_PATH),
    }
}

/// Rewrite a background command so it survives terminal signals, with its
/// output captured to a per-command log file.
pub fn background_rewrite(name: &str, command: &str) -> String {
    let safe_name = name.replace([' ', '/'], "_");
    format!(
        "nohup {} > /tmp/autostart_{}.log 2>&1 & disown",
        command, safe_name
    )
}

/// Execute the repo's autostart commands, if a manifest exists.
pub async fn execute_autostart_commands(
    runtime: Arc<dyn Runtime>,
    sid: &str,
    selected_repository: Option<&str>,
) {
    let Some(workspace_path) = runtime.workspace_path() else {
        debug!(sid, "autostart: no workspace path configured, skipping");
        return;
    };

    let path = manifest_path(&workspace_path, selected_repository);
    debug!(sid, path = %path, "autostart: looking for manifest");

    let content = match runtime.read_file(&path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(sid, path = %path, error = %e, "autostart: no manifest found");
            return;
        }
    };
    if content.is_empty() || content.starts_with("ERROR") {
        debug!(sid, path = %path, "autostart: could not read manifest");
        return;
    }

    let commands = match parse_manifest(&content) {
        Ok(commands) => commands,
        Err(e) => {
            warn!(sid, error = %e, "autostart: failed to parse manifest");
            return;
        }
    };
    if commands.is_empty() {
        debug!(sid, "autostart: no startup commands in manifest");
        return;
    }

    info!(sid, count = commands.len(), "autostart: found startup commands");
    for command in &commands {
        run_command(runtime.as_ref(), sid, command).await;
    }
}

async fn run_command(runtime: &dyn Runtime, sid: &str, cmd: &AutostartCommand) {
    if let Some(condition) = &cmd.condition {
        let check = format!(
            "[ {} ] && echo CONDITION_MET || echo CONDITION_NOT_MET",
            condition
        );
        match runtime
            .run(CmdRequest::blocking_hidden(check, CONDITION_TIMEOUT))
            .await
        {
            Ok(output) if output.content.contains("CONDITION_NOT_MET") => {
                info!(sid, name = %cmd.name, "autostart: skipping, condition not met");
                return;
            }
            Ok(_) => {}
            // An inconclusive check does not block the command.
            Err(e) => {
                warn!(sid, name = %cmd.name, error = %e, "autostart: condition check failed");
            }
        }
    }

    let command = if cmd.background {
        background_rewrite(&cmd.name, &cmd.command)
    } else {
        cmd.command.clone()
    };

    info!(sid, name = %cmd.name, command = %command, "autostart: running");
    match runtime
        .run(CmdRequest::blocking_hidden(command, cmd.timeout))
        .await
    {
        // Background commands detach through a disowned shell that exits 0
        // immediately, so only foreground exit codes are meaningful.
        Ok(output) if output.exit_code != 0 && !cmd.background => {
            let tail: String = output.content.chars().take(OUTPUT_TAIL_CHARS).collect();
            warn!(
                sid,
                name = %cmd.name,
                exit_code = output.exit_code,
                output = %tail,
                "autostart: command failed"
            );
        }
        Ok(_) => {
            info!(sid, name = %cmd.name, "autostart: command completed");
        }
        Err(e) => {
            warn!(sid, name = %cmd.name, error = %e, "autostart: execution failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_schema() {
        let yaml = r#"
startup:
  - name: deps
    command: npm ci
    timeout: 300
  - command: make build
"#;
        let commands = parse_manifest(yaml).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "deps");
        assert_eq!(commands[0].command, "npm ci");
        assert_eq!(commands[0].timeout, Duration::from_secs(300));
        assert_eq!(commands[1].name, "unnamed");
        assert_eq!(commands[1].timeout, Duration::from_secs(120));
        assert!(!commands[1].background);
    }

    #[test]
    fn test_parse_current_schema() {
        let yaml = r#"
autostart:
  enabled: true
  commands:
    - name: dev
      command: npm run dev
      background: true
      condition: "-f package.json"
"#;
        let commands = parse_manifest(yaml).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].background);
        assert_eq!(commands[0].condition.as_deref(), Some("-f package.json"));
    }

    #[test]
    fn test_parse_disabled_yields_nothing() {
        let yaml = r#"
autostart:
  enabled: false
  commands:
    - name: dev
      command: npm run dev
"#;
        assert!(parse_manifest(yaml).unwrap().is_empty());
    }

    #[test]
    fn test_entry_without_command_skipped() {
        let yaml = r#"
startup:
  - name: broken
  - name: ok
    command: echo hi
"#;
        let commands = parse_manifest(yaml).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "ok");
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(parse_manifest("{{{not yaml").is_err());
    }

    #[test]
    fn test_manifest_path_with_repo() {
        assert_eq!(
            manifest_path("/workspace", Some("acme/widget")),
            "/workspace/widget/.openhands/autostart.yaml"
        );
        assert_eq!(
            manifest_path("/workspace", None),
            "/workspace/.openhands/autostart.yaml"
        );
    }

    #[test]
    fn test_background_rewrite_sanitizes_name() {
        assert_eq!(
            background_rewrite("dev server/web", "npm run dev"),
            "nohup npm run dev > /tmp/autostart_dev_server_web.log 2>&1 & disown"
        );
    }
}
