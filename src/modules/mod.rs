// Command executor: runs one playbook command against a connected host

mod shell;
pub mod template;
mod wait;

pub use shell::{remote_script_path, run_script_file, script_command, script_file, ScriptForm};
pub use template::{render, TemplateScope};
pub use wait::{poll_interval, wait_for, DEFAULT_WAIT_INTERVAL};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::Executor;
use crate::output::errors::SpotError;
use crate::parser::ast::{Command, CommandKind, CopySpec, DeleteSpec, SyncSpec, WaitSpec};

/// Runs commands for one host of one task.
///
/// Every path, command and script body is rendered with the host-scoped
/// template variables before it reaches the executor.
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor<'a> {
    /// Task name, `SPOT_TASK`
    pub task: &'a str,
    /// `host:port` address, `SPOT_REMOTE_HOST`
    pub host: &'a str,
    /// Remote identity, `SPOT_REMOTE_USER`
    pub user: &'a str,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(task: &'a str, host: &'a str, user: &'a str) -> Self {
        CommandExecutor { task, host, user }
    }

    fn scope<'s>(&'s self, cmd: &'s Command) -> TemplateScope<'s> {
        TemplateScope {
            host: self.host,
            command: &cmd.name,
            user: self.user,
            task: self.task,
            error: None,
        }
    }

    /// Execute `cmd`, returning a short description of what ran and the outcome.
    ///
    /// The description is produced for failures too.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        cmd: &Command,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let kind = match cmd.kind() {
            Ok(kind) => kind,
            Err(e) => return (String::new(), Err(e)),
        };
        let scope = self.scope(cmd);
        debug!("execute {} {:?} on {}", kind.label(), cmd.name, self.host);

        match kind {
            CommandKind::Script(body) => self.script(cancel, cmd, body, &scope, exec).await,
            CommandKind::Copy(spec) => self.copy(cancel, spec, &scope, exec).await,
            CommandKind::Sync(spec) => self.sync(cancel, spec, &scope, exec).await,
            CommandKind::Delete(spec) => self.delete(cancel, spec, &scope, exec).await,
            CommandKind::Wait(spec) => self.wait(cancel, spec, &scope, exec).await,
        }
    }

    async fn script(
        &self,
        cancel: &CancellationToken,
        cmd: &Command,
        body: &str,
        scope: &TemplateScope<'_>,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let res = match ScriptForm::new(body, &cmd.env).map(|s| render(s, scope)) {
            ScriptForm::Command(line) => {
                let details = format!(" {{script: {}}}", line);
                (details, exec.run(cancel, &line).await)
            }
            ScriptForm::File(script) => {
                let (dir, file) = remote_script_path();
                let details = format!(" {{script: {}}}", file);
                (details, run_script_file(exec, cancel, &script, &dir, &file).await)
            }
        };

        match res {
            (details, Ok(lines)) => {
                for line in lines {
                    debug!("[{}] {}", self.host, line);
                }
                (details, Ok(()))
            }
            (details, Err(e)) => (details, Err(SpotError::step("can't run script", self.host, e))),
        }
    }

    async fn copy(
        &self,
        cancel: &CancellationToken,
        spec: &CopySpec,
        scope: &TemplateScope<'_>,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let src = render(&spec.source, scope);
        let dst = render(&spec.dest, scope);
        let details = format!(" {{copy: {} -> {}}}", src, dst);
        let res = exec
            .upload(cancel, &src, &dst, spec.mkdir)
            .await
            .map_err(|e| SpotError::step("can't copy file", self.host, e));
        (details, res)
    }

    async fn sync(
        &self,
        cancel: &CancellationToken,
        spec: &SyncSpec,
        scope: &TemplateScope<'_>,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let src = render(&spec.source, scope);
        let dst = render(&spec.dest, scope);
        let details = format!(" {{sync: {} -> {}}}", src, dst);
        let res = match exec.sync(cancel, &src, &dst, spec.delete).await {
            Ok(changed) => {
                debug!("synced {} files to {}", changed.len(), self.host);
                Ok(())
            }
            Err(e) => Err(SpotError::step("can't sync files", self.host, e)),
        };
        (details, res)
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        spec: &DeleteSpec,
        scope: &TemplateScope<'_>,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let path = render(&spec.path, scope);
        let details = format!(" {{delete: {}, recursive: {}}}", path, spec.recursive);
        let res = exec
            .delete(cancel, &path, spec.recursive)
            .await
            .map_err(|e| SpotError::step("can't delete files", self.host, e));
        (details, res)
    }

    async fn wait(
        &self,
        cancel: &CancellationToken,
        spec: &WaitSpec,
        scope: &TemplateScope<'_>,
        exec: &dyn Executor,
    ) -> (String, Result<(), SpotError>) {
        let rendered = WaitSpec {
            command: render(&spec.command, scope),
            ..spec.clone()
        };
        let details = format!(
            " {{wait: {}, timeout: {:?}, duration: {:?}}}",
            rendered.command,
            rendered.timeout,
            poll_interval(&rendered)
        );
        let res = wait_for(exec, cancel, &rendered)
            .await
            .map_err(|e| SpotError::step("wait failed", self.host, e));
        (details, res)
    }
}
