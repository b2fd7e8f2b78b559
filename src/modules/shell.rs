// Script commands: one-liners through `sh -c`, multi-line bodies as script files

use std::collections::HashMap;
use std::io::Write;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::Executor;
use crate::output::errors::SpotError;

/// How a script body is submitted to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptForm {
    /// Single line, run as a command string
    Command(String),
    /// Multi-line, uploaded and run as a shell script
    File(String),
}

impl ScriptForm {
    pub fn new(body: &str, env: &HashMap<String, String>) -> Self {
        if body.contains('\n') {
            ScriptForm::File(script_file(body, env))
        } else {
            ScriptForm::Command(script_command(body, env))
        }
    }

    pub fn map(self, f: impl FnOnce(&str) -> String) -> Self {
        match self {
            ScriptForm::Command(c) => ScriptForm::Command(f(&c)),
            ScriptForm::File(body) => ScriptForm::File(f(&body)),
        }
    }
}

/// `KEY='VALUE'` pairs sorted by key
fn env_pairs(env: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<(&String, &String)> = env.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}='{}'", k, v))
        .collect()
}

/// Trim a script line and cut a trailing `# comment`; `None` for lines too
/// short to be a statement
fn clean_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.len() < 2 {
        return None;
    }
    match line.find('#') {
        Some(i) if i > 0 => Some(line[..i].trim()),
        _ => Some(line),
    }
}

/// Single-line form: `sh -c "<env> <stmt>; <stmt>"`
pub fn script_command(body: &str, env: &HashMap<String, String>) -> String {
    let mut res = String::from("sh -c \"");
    let envs = env_pairs(env);
    if !envs.is_empty() {
        res.push_str(&envs.join(" "));
        res.push(' ');
    }
    let parts: Vec<&str> = body.split('\n').filter_map(clean_line).collect();
    res.push_str(&parts.join("; "));
    res.push('"');
    res
}

/// Multi-line form: shebang, `set -e`, exported env, then the cleaned lines
pub fn script_file(body: &str, env: &HashMap<String, String>) -> String {
    let mut res = String::from("#!/bin/sh\nset -e\n");
    for pair in env_pairs(env) {
        res.push_str(&format!("export {}\n", pair));
    }
    for line in body.split('\n') {
        if line.trim().starts_with('#') {
            continue;
        }
        if let Some(stmt) = clean_line(line) {
            res.push_str(stmt);
            res.push('\n');
        }
    }
    res
}

/// Remote location for an uploaded script
pub fn remote_script_path() -> (String, String) {
    let dir = format!("/tmp/.spot-{:016x}", rand::thread_rng().gen::<u64>());
    let file = format!("{}/script.sh", dir);
    (dir, file)
}

/// Upload a script body to `remote_file`, run it with `sh`, then remove `remote_dir`
pub async fn run_script_file(
    exec: &dyn Executor,
    cancel: &CancellationToken,
    body: &str,
    remote_dir: &str,
    remote_file: &str,
) -> Result<Vec<String>, SpotError> {
    let mut local = tempfile::NamedTempFile::new().map_err(|e| SpotError::io("script", e))?;
    local
        .write_all(body.as_bytes())
        .map_err(|e| SpotError::io(local.path(), e))?;

    let res = match exec
        .upload(cancel, &local.path().to_string_lossy(), remote_file, true)
        .await
    {
        Ok(()) => {
            debug!("uploaded script to {}", remote_file);
            exec.run(cancel, &format!("sh {}", remote_file)).await
        }
        Err(e) => Err(e),
    };

    // upload may have created the directory before failing
    if let Err(e) = exec.delete(cancel, remote_dir, true).await {
        warn!("can't remove script dir {}: {}", remote_dir, e);
    }
    res
}
