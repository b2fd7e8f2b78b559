// Typed playbook model for spot

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::errors::SpotError;

/// Port used when a destination does not declare one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A complete spot playbook.
///
/// Read-only after load: resolving a task or a target never mutates it, so a
/// single instance can be shared by every host worker.
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    pub user: String,
    pub ssh_key: String,
    pub targets: HashMap<String, Target>,
    pub tasks: HashMap<String, Task>,
    pub(crate) overrides: Option<Overrides>,
}

impl Playbook {
    /// Attach run-time overrides (replacing any set before)
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn overrides(&self) -> Option<&Overrides> {
        self.overrides.as_ref()
    }

    /// Override user if set, else the playbook user
    pub fn default_user(&self) -> &str {
        match self.overrides {
            Some(ref o) if !o.user.is_empty() => &o.user,
            _ => &self.user,
        }
    }
}

/// A named group of hosts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub hosts: Vec<Destination>,
    pub inventory_file: Option<InventorySource>,
    pub inventory_url: Option<InventorySource>,
}

/// External inventory (file path or URL) plus the groups to take from it
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InventorySource {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub location: String,
}

/// A resolved host. Two destinations are equal when host and port match.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Destination {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Destination {
            name: String::new(),
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// `host:port` address used to reach and to label the host
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Destination {}

/// Named ordered list of commands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    /// Set from the lookup key when the task is resolved
    pub name: String,
    pub user: String,
    pub ssh_key: String,
    pub commands: Vec<Command>,
    pub on_error: String,
}

/// One unit of work inside a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub name: String,
    /// `None` when the playbook entry populated none of the command variants
    pub kind: Option<CommandKind>,
    pub env: HashMap<String, String>,
    pub options: CommandOptions,
}

impl Command {
    pub fn new(name: impl Into<String>, kind: CommandKind) -> Self {
        Command {
            name: name.into(),
            kind: Some(kind),
            env: HashMap::new(),
            options: CommandOptions::default(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    /// The variant to execute, or `UnknownCommand` if there is none
    pub fn kind(&self) -> Result<&CommandKind, SpotError> {
        self.kind
            .as_ref()
            .ok_or_else(|| SpotError::UnknownCommand(self.name.clone()))
    }

    /// Script body, if this is a script command
    pub fn script(&self) -> Option<&str> {
        match self.kind {
            Some(CommandKind::Script(ref body)) => Some(body),
            _ => None,
        }
    }
}

/// Exactly one variant per command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Script(String),
    Copy(CopySpec),
    Sync(SyncSpec),
    Delete(DeleteSpec),
    Wait(WaitSpec),
}

impl CommandKind {
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Script(_) => "script",
            CommandKind::Copy(_) => "copy",
            CommandKind::Sync(_) => "sync",
            CommandKind::Delete(_) => "delete",
            CommandKind::Wait(_) => "wait",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySpec {
    pub source: String,
    pub dest: String,
    pub mkdir: bool,
}

/// Recursive copy of a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSpec {
    pub source: String,
    pub dest: String,
    /// Remove remote files missing from the source
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSpec {
    pub path: String,
    pub recursive: bool,
}

/// Poll `command` every `interval` until it succeeds or `timeout` elapses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSpec {
    pub command: String,
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CommandOptions {
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default)]
    pub no_auto: bool,
    #[serde(default)]
    pub local: bool,
}

/// Caller-supplied values that win over the playbook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub user: String,
    /// `host` or `host:port` strings
    pub target_hosts: Vec<String>,
    pub inventory_file: String,
    pub inventory_url: String,
    pub environment: HashMap<String, String>,
}
