// Task resolution: independent, override-aware copies of playbook tasks

use super::ast::{Playbook, Task};
use crate::output::errors::SpotError;

impl Playbook {
    /// Resolve a task by name.
    ///
    /// The returned task is an owned copy: the display name is set to the lookup
    /// key, the user falls back to the playbook user and yields to the override
    /// user, and override environment variables are merged into every script
    /// command (overwriting same-named keys). Other command kinds are left alone.
    pub fn task(&self, name: &str) -> Result<Task, SpotError> {
        let stored = self
            .tasks
            .get(name)
            .ok_or_else(|| SpotError::TaskNotFound(name.to_string()))?;

        let mut task = stored.clone();
        task.name = name.to_string();
        if task.user.is_empty() {
            task.user = self.user.clone();
        }

        let Some(ref overrides) = self.overrides else {
            return Ok(task);
        };

        if !overrides.user.is_empty() {
            task.user = overrides.user.clone();
        }

        for cmd in task.commands.iter_mut() {
            if cmd.script().map_or(true, str::is_empty) {
                continue;
            }
            for (key, value) in &overrides.environment {
                cmd.env.insert(key.clone(), value.clone());
            }
        }

        Ok(task)
    }
}
