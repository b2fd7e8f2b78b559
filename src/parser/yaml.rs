// YAML playbook parser

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use super::ast::*;
use crate::output::errors::SpotError;

/// Raw YAML playbook structure (before conversion)
#[derive(Debug, Default, Deserialize)]
struct RawPlaybook {
    #[serde(default)]
    user: String,
    #[serde(default)]
    ssh_key: String,
    #[serde(default)]
    targets: HashMap<String, RawTarget>,
    #[serde(default)]
    tasks: HashMap<String, RawTask>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTarget {
    #[serde(default)]
    hosts: Vec<Destination>,
    #[serde(default)]
    inventory_file: InventorySource,
    #[serde(default)]
    inventory_url: InventorySource,
}

#[derive(Debug, Default, Deserialize)]
struct RawTask {
    #[serde(default)]
    user: String,
    #[serde(default)]
    ssh_key: String,
    #[serde(default)]
    commands: Vec<RawCommand>,
    #[serde(default)]
    on_error: String,
}

/// Command as written in YAML: every variant is an optional block
#[derive(Debug, Default, Deserialize)]
struct RawCommand {
    #[serde(default)]
    name: String,
    #[serde(default)]
    copy: RawCopy,
    #[serde(default)]
    sync: RawSync,
    #[serde(default)]
    delete: RawDelete,
    #[serde(default)]
    wait: RawWait,
    #[serde(default)]
    script: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    options: CommandOptions,
}

#[derive(Debug, Default, Deserialize)]
struct RawCopy {
    #[serde(default)]
    src: String,
    #[serde(default)]
    dst: String,
    #[serde(default)]
    mkdir: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawSync {
    #[serde(default)]
    src: String,
    #[serde(default)]
    dst: String,
    #[serde(default)]
    delete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawDelete {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recur: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawWait {
    #[serde(default, with = "humantime_serde")]
    timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    interval: Duration,
    #[serde(default)]
    cmd: String,
}

impl From<RawCommand> for Command {
    /// Picks the variant in fixed priority: script, copy, sync, delete, wait
    fn from(raw: RawCommand) -> Self {
        let RawCommand {
            name,
            copy,
            sync,
            delete,
            wait,
            script,
            env,
            options,
        } = raw;

        let kind = if !script.is_empty() {
            Some(CommandKind::Script(script))
        } else if !copy.src.is_empty() && !copy.dst.is_empty() {
            Some(CommandKind::Copy(CopySpec {
                source: copy.src,
                dest: copy.dst,
                mkdir: copy.mkdir,
            }))
        } else if !sync.src.is_empty() && !sync.dst.is_empty() {
            Some(CommandKind::Sync(SyncSpec {
                source: sync.src,
                dest: sync.dst,
                delete: sync.delete,
            }))
        } else if !delete.path.is_empty() {
            Some(CommandKind::Delete(DeleteSpec {
                path: delete.path,
                recursive: delete.recur,
            }))
        } else if !wait.cmd.is_empty() {
            Some(CommandKind::Wait(WaitSpec {
                command: wait.cmd,
                timeout: wait.timeout,
                interval: wait.interval,
            }))
        } else {
            None
        };

        Command {
            name,
            kind,
            env,
            options,
        }
    }
}

fn non_empty(src: InventorySource) -> Option<InventorySource> {
    if src.location.is_empty() {
        None
    } else {
        Some(src)
    }
}

impl From<RawTarget> for Target {
    fn from(raw: RawTarget) -> Self {
        Target {
            hosts: raw.hosts,
            inventory_file: non_empty(raw.inventory_file),
            inventory_url: non_empty(raw.inventory_url),
        }
    }
}

impl From<RawTask> for Task {
    fn from(raw: RawTask) -> Self {
        Task {
            name: String::new(),
            user: raw.user,
            ssh_key: raw.ssh_key,
            commands: raw.commands.into_iter().map(Command::from).collect(),
            on_error: raw.on_error,
        }
    }
}

/// Parse a playbook from a YAML string
pub fn parse_playbook(content: &str) -> Result<Playbook, serde_yaml::Error> {
    let raw: RawPlaybook = serde_yaml::from_str(content)?;
    Ok(Playbook {
        user: raw.user,
        ssh_key: raw.ssh_key,
        targets: raw
            .targets
            .into_iter()
            .map(|(name, t)| (name, Target::from(t)))
            .collect(),
        tasks: raw
            .tasks
            .into_iter()
            .map(|(name, t)| (name, Task::from(t)))
            .collect(),
        overrides: None,
    })
}

/// Load a playbook file and attach the run-time overrides
pub fn load_playbook(path: &Path, overrides: Option<Overrides>) -> Result<Playbook, SpotError> {
    let content = std::fs::read_to_string(path).map_err(|e| SpotError::Config {
        path: path.to_path_buf(),
        message: format!("can't read: {}", e),
    })?;

    let mut playbook = parse_playbook(&content).map_err(|e| SpotError::Config {
        path: path.to_path_buf(),
        message: format!("can't unmarshal: {}", e),
    })?;
    playbook.overrides = overrides;

    info!("playbook loaded with {} tasks", playbook.tasks.len());
    for (task_name, task) in &playbook.tasks {
        for cmd in &task.commands {
            debug!("load task {} command {}", task_name, cmd.name);
        }
    }
    Ok(playbook)
}
