// Task-over-target engine: bounded fan-out across hosts, sequential commands per host

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hook::run_on_error_logged;
use super::local::LocalExecutor;
use super::{Connector, Executor};
use crate::modules::{render, CommandExecutor, TemplateScope};
use crate::output::errors::SpotError;
use crate::output::terminal::HostPrinter;
use crate::parser::ast::{Command, Destination, Playbook, Task};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum hosts processed at the same time
    pub concurrency: usize,
    /// Run only these commands (case-insensitive); empty means all
    pub only: Vec<String>,
    /// Never run these commands (case-insensitive)
    pub skip: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            concurrency: 1,
            only: Vec::new(),
            skip: Vec::new(),
        }
    }
}

/// Outcome counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Hosts the task was started on
    pub hosts: usize,
    /// Commands completed on the first host, a per-host figure rather than a total
    pub commands: usize,
}

/// A failed run: the first fatal error plus whatever was counted before it
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RunError {
    pub stats: RunStats,
    #[source]
    pub source: SpotError,
}

impl RunError {
    fn unresolved(source: SpotError) -> Self {
        RunError {
            stats: RunStats::default(),
            source,
        }
    }
}

/// Runs tasks from one playbook through one connector
pub struct Scheduler {
    config: SchedulerConfig,
    playbook: Arc<Playbook>,
    connector: Arc<dyn Connector>,
    printer: HostPrinter,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, playbook: Arc<Playbook>, connector: Arc<dyn Connector>) -> Self {
        Scheduler {
            config,
            playbook,
            connector,
            printer: HostPrinter::default(),
        }
    }

    pub fn with_printer(mut self, printer: HostPrinter) -> Self {
        self.printer = printer;
        self
    }

    /// Run `task_name` on every host of `target`.
    ///
    /// Hosts without their own user log in as the task's resolved user.
    /// Task and target resolution errors are returned before any host is
    /// contacted. The first fatal host error cancels the remaining hosts,
    /// runs the task's `on_error` line once and becomes the run's error.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        task_name: &str,
        target: &str,
    ) -> Result<RunStats, RunError> {
        let task = self.playbook.task(task_name).map_err(RunError::unresolved)?;
        let hosts = self
            .playbook
            .target_hosts_as(target, &task.user)
            .await
            .map_err(RunError::unresolved)?;
        info!(
            "run task {:?} ({} commands) on {} hosts of target {:?}",
            task.name,
            task.commands.len(),
            hosts.len(),
            target
        );

        let group = cancel.child_token();
        let semaphore = Semaphore::new(self.config.concurrency.max(1));
        let first_err: Mutex<Option<SpotError>> = Mutex::new(None);

        let workers = hosts.iter().map(|host| {
            let group = &group;
            let semaphore = &semaphore;
            let first_err = &first_err;
            let task = &task;
            async move {
                let (count, res) = self.run_host(group, semaphore, task, host).await;
                if let Err(e) = res {
                    group.cancel();
                    let mut slot = first_err.lock();
                    // a worker unwound by the cancel never hides the error that caused it
                    let replace = match *slot {
                        None => true,
                        Some(ref prev) => prev.is_cancelled() && !e.is_cancelled(),
                    };
                    if replace {
                        *slot = Some(e);
                    }
                }
                count
            }
        });
        let counts = join_all(workers).await;

        let stats = RunStats {
            hosts: hosts.len(),
            commands: counts.first().copied().unwrap_or_default(),
        };

        match first_err.into_inner() {
            None => Ok(stats),
            Some(source) => {
                if !task.on_error.is_empty() {
                    let error = source.to_string();
                    let scope = TemplateScope {
                        task: &task.name,
                        error: Some(&error),
                        ..Default::default()
                    };
                    run_on_error_logged(&render(&task.on_error, &scope)).await;
                }
                Err(RunError { stats, source })
            }
        }
    }

    /// Filter by `only`, `skip` and `no_auto`
    fn should_run(&self, cmd: &Command) -> bool {
        let listed = |names: &[String]| names.iter().any(|n| n.eq_ignore_ascii_case(&cmd.name));
        if !self.config.only.is_empty() && !listed(&self.config.only) {
            return false;
        }
        if listed(&self.config.skip) {
            return false;
        }
        !cmd.options.no_auto || listed(&self.config.only)
    }

    /// One worker: wait for a slot, connect, run the commands in order.
    /// Returns the number of completed commands alongside the outcome.
    async fn run_host(
        &self,
        group: &CancellationToken,
        semaphore: &Semaphore,
        task: &Task,
        host: &Destination,
    ) -> (usize, Result<(), SpotError>) {
        let _permit = tokio::select! {
            _ = group.cancelled() => return (0, Err(SpotError::Cancelled)),
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return (0, Err(SpotError::Cancelled)),
            },
        };

        let addr = host.address();
        let session = match self.connector.connect(group, host).await {
            Ok(session) => session,
            Err(e) => return (0, Err(e)),
        };
        debug!("connected to {}", addr);

        let executor = CommandExecutor::new(&task.name, &addr, self.connector.user());
        let local = LocalExecutor::new();
        let mut count = 0;
        let mut res = Ok(());

        for cmd in &task.commands {
            if !self.should_run(cmd) {
                debug!("skip command {:?} on {}", cmd.name, addr);
                continue;
            }
            if group.is_cancelled() {
                res = Err(SpotError::Cancelled);
                break;
            }

            let exec: &dyn Executor = if cmd.options.local {
                &local
            } else {
                session.as_ref()
            };
            let start = Instant::now();
            let (details, outcome) = executor.execute(group, cmd, exec).await;

            match outcome {
                Ok(()) => {
                    self.printer
                        .print_command_result(&addr, &cmd.name, &details, start.elapsed(), false);
                    count += 1;
                }
                Err(e) if cmd.options.ignore_errors => {
                    self.printer
                        .print_command_result(&addr, &cmd.name, &details, start.elapsed(), true);
                    warn!("ignored failure of {:?} on {}: {}", cmd.name, addr, e);
                }
                Err(e) => {
                    self.printer
                        .print_command_result(&addr, &cmd.name, &details, start.elapsed(), true);
                    res = Err(SpotError::CommandFailed {
                        command: cmd.name.clone(),
                        host: addr.clone(),
                        source: Box::new(e),
                    });
                    break;
                }
            }
        }

        if let Err(e) = session.close().await {
            warn!("can't close session to {}: {}", addr, e);
        }
        (count, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::cancellable;
    use crate::parser::ast::{CommandKind, CommandOptions, Overrides, Target};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        active: AtomicUsize,
        max_active: AtomicUsize,
        connects: AtomicUsize,
        log: Mutex<Vec<String>>,
        /// `host=user` of every destination handed to `connect`
        logins: Mutex<Vec<String>>,
    }

    /// Fake transport. `run` records `host: cmd`, fails when the command
    /// contains "fail" (or on `fail_host` for anything) and otherwise
    /// sleeps `delay`, honouring cancellation.
    #[derive(Default)]
    struct FakeConnector {
        counters: Arc<Counters>,
        refuse: Vec<String>,
        fail_host: Option<String>,
        delay: Duration,
    }

    struct FakeSession {
        host: String,
        counters: Arc<Counters>,
        fail: bool,
        delay: Duration,
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _cancel: &CancellationToken,
            host: &Destination,
        ) -> Result<Box<dyn Executor>, SpotError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.counters
                .logins
                .lock()
                .push(format!("{}={}", host.host, host.user));
            if self.refuse.contains(&host.host) {
                return Err(SpotError::Connect {
                    host: host.address(),
                    message: "connection refused".to_string(),
                });
            }
            let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_active.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                host: host.host.clone(),
                counters: self.counters.clone(),
                fail: self.fail_host.as_deref() == Some(host.host.as_str()),
                delay: self.delay,
            }))
        }

        fn user(&self) -> &str {
            "app"
        }
    }

    #[async_trait]
    impl Executor for FakeSession {
        async fn run(&self, cancel: &CancellationToken, cmd: &str) -> Result<Vec<String>, SpotError> {
            self.counters.log.lock().push(format!("{}: {}", self.host, cmd));
            if self.fail || cmd.contains("fail") {
                return Err(SpotError::transport("run", &self.host, "exit status 1"));
            }
            let delay = self.delay;
            cancellable(cancel, async move {
                tokio::time::sleep(delay).await;
                Ok(vec![])
            })
            .await
        }
        async fn upload(&self, _: &CancellationToken, _: &str, _: &str, _: bool) -> Result<(), SpotError> {
            Ok(())
        }
        async fn download(&self, _: &CancellationToken, _: &str, _: &str, _: bool) -> Result<(), SpotError> {
            Ok(())
        }
        async fn sync(&self, _: &CancellationToken, _: &str, _: &str, _: bool) -> Result<Vec<String>, SpotError> {
            Ok(vec![])
        }
        async fn delete(&self, _: &CancellationToken, _: &str, _: bool) -> Result<(), SpotError> {
            Ok(())
        }
    }

    fn script(name: &str, body: &str) -> Command {
        Command::new(name, CommandKind::Script(body.to_string()))
    }

    fn playbook(hosts: &[&str], commands: Vec<Command>, on_error: &str) -> Arc<Playbook> {
        let target = Target {
            hosts: hosts.iter().map(|h| Destination::new(*h, 0, "")).collect(),
            ..Default::default()
        };
        let task = Task {
            commands,
            on_error: on_error.to_string(),
            ..Default::default()
        };
        Arc::new(Playbook {
            user: "app".to_string(),
            targets: HashMap::from([("web".to_string(), target)]),
            tasks: HashMap::from([("deploy".to_string(), task)]),
            ..Default::default()
        })
    }

    fn scheduler(config: SchedulerConfig, pb: Arc<Playbook>, conn: FakeConnector) -> Scheduler {
        Scheduler::new(config, pb, Arc::new(conn)).with_printer(HostPrinter::new(true))
    }

    fn log_of(counters: &Counters) -> Vec<String> {
        counters.log.lock().clone()
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            delay: Duration::from_millis(30),
            ..Default::default()
        };
        let pb = playbook(
            &["h1", "h2", "h3", "h4", "h5"],
            vec![script("one", "echo 1"), script("two", "echo 2")],
            "",
        );
        let config = SchedulerConfig {
            concurrency: 2,
            ..Default::default()
        };

        let stats = scheduler(config, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        assert_eq!(stats, RunStats { hosts: 5, commands: 2 });
        assert_eq!(counters.connects.load(Ordering::SeqCst), 5);
        assert_eq!(counters.max_active.load(Ordering::SeqCst), 2);
        assert_eq!(log_of(&counters).len(), 10);
    }

    #[tokio::test]
    async fn test_failure_runs_on_error_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("recovered");
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let pb = playbook(
            &["h1", "h2"],
            vec![
                script("first", "echo ok"),
                script("second", "fail-now"),
                script("third", "echo never"),
            ],
            &format!("echo recovered $SPOT_TASK >> {}", out.display()),
        );

        let err = scheduler(SchedulerConfig { concurrency: 2, ..Default::default() }, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap_err();

        assert!(matches!(err.source, SpotError::CommandFailed { ref command, .. } if command == "second"));
        assert_eq!(err.stats.hosts, 2);
        assert_eq!(err.stats.commands, 1);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "recovered deploy\n");
        assert!(!log_of(&counters).iter().any(|l| l.contains("never")));
    }

    #[tokio::test]
    async fn test_ignore_errors_continues() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let tolerant = CommandOptions {
            ignore_errors: true,
            ..Default::default()
        };
        let pb = playbook(
            &["h1"],
            vec![
                script("first", "echo ok"),
                script("second", "fail-now").with_options(tolerant),
                script("third", "echo after"),
            ],
            "",
        );

        let stats = scheduler(SchedulerConfig::default(), pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        assert_eq!(stats, RunStats { hosts: 1, commands: 2 });
        assert_eq!(
            log_of(&counters),
            vec![
                "h1: sh -c \"echo ok\"",
                "h1: sh -c \"fail-now\"",
                "h1: sh -c \"echo after\"",
            ]
        );
    }

    #[tokio::test]
    async fn test_only_skip_and_no_auto() {
        let manual = CommandOptions {
            no_auto: true,
            ..Default::default()
        };
        let commands = vec![
            script("a", "echo a"),
            script("b", "echo b"),
            script("c", "echo c").with_options(manual),
        ];

        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let config = SchedulerConfig {
            skip: vec!["B".to_string()],
            ..Default::default()
        };
        let pb = playbook(&["h1"], commands.clone(), "");
        scheduler(config, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        assert_eq!(log_of(&counters), vec!["h1: sh -c \"echo a\""]);

        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let config = SchedulerConfig {
            only: vec!["C".to_string(), "a".to_string()],
            ..Default::default()
        };
        let pb = playbook(&["h1"], commands, "");
        scheduler(config, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        assert_eq!(
            log_of(&counters),
            vec!["h1: sh -c \"echo a\"", "h1: sh -c \"echo c\""]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            refuse: vec!["h2".to_string()],
            ..Default::default()
        };
        let pb = playbook(&["h1", "h2"], vec![script("one", "echo 1")], "");

        let err = scheduler(SchedulerConfig { concurrency: 2, ..Default::default() }, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap_err();
        assert!(matches!(err.source, SpotError::Connect { ref host, .. } if host == "h2:22"));
        assert_eq!(err.stats.hosts, 2);
    }

    #[tokio::test]
    async fn test_first_failure_cancels_other_hosts() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            fail_host: Some("h1".to_string()),
            delay: Duration::from_secs(10),
            ..Default::default()
        };
        let pb = playbook(
            &["h1", "h2"],
            vec![script("slow", "sleep 10"), script("next", "echo next")],
            "",
        );

        let start = std::time::Instant::now();
        let err = scheduler(SchedulerConfig { concurrency: 2, ..Default::default() }, pb, conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!err.source.is_cancelled());
        assert!(matches!(err.source, SpotError::CommandFailed { ref host, .. } if host == "h1:22"));
        assert!(!log_of(&counters).iter().any(|l| l.contains("next")));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            delay: Duration::from_secs(10),
            ..Default::default()
        };
        let pb = playbook(&["h1"], vec![script("slow", "sleep 10")], "");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = scheduler(SchedulerConfig::default(), pb, conn)
            .run(&cancel, "deploy", "web")
            .await
            .unwrap_err();
        assert!(err.source.is_cancelled());
        assert_eq!(err.stats.commands, 0);
    }

    fn logins_of(counters: &Counters) -> Vec<String> {
        let mut logins = counters.logins.lock().clone();
        logins.sort();
        logins
    }

    fn users_playbook(overrides: Option<Overrides>) -> Arc<Playbook> {
        let target = Target {
            hosts: vec![
                Destination::new("h1", 0, ""),
                Destination::new("h2", 0, "ops"),
            ],
            ..Default::default()
        };
        let task = Task {
            user: "app".to_string(),
            commands: vec![script("one", "echo 1")],
            ..Default::default()
        };
        let pb = Playbook {
            user: "deploy".to_string(),
            targets: HashMap::from([("web".to_string(), target)]),
            tasks: HashMap::from([("deploy".to_string(), task)]),
            ..Default::default()
        };
        Arc::new(match overrides {
            Some(o) => pb.with_overrides(o),
            None => pb,
        })
    }

    #[tokio::test]
    async fn test_hosts_log_in_as_task_user() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        scheduler(SchedulerConfig::default(), users_playbook(None), conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        // the task user beats the playbook user, an explicit host user beats both
        assert_eq!(logins_of(&counters), vec!["h1=app", "h2=ops"]);
    }

    #[tokio::test]
    async fn test_override_user_beats_task_user() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let overrides = Overrides {
            user: "root".to_string(),
            ..Default::default()
        };
        scheduler(SchedulerConfig::default(), users_playbook(Some(overrides)), conn)
            .run(&CancellationToken::new(), "deploy", "web")
            .await
            .unwrap();
        assert_eq!(logins_of(&counters), vec!["h1=root", "h2=ops"]);
    }

    #[tokio::test]
    async fn test_resolution_errors_touch_no_host() {
        let counters = Arc::new(Counters::default());
        let conn = FakeConnector {
            counters: counters.clone(),
            ..Default::default()
        };
        let sched = scheduler(
            SchedulerConfig::default(),
            playbook(&["h1"], vec![script("one", "echo 1")], "echo hook"),
            conn,
        );
        let cancel = CancellationToken::new();

        let err = sched.run(&cancel, "missing", "web").await.unwrap_err();
        assert!(matches!(err.source, SpotError::TaskNotFound(_)));
        assert_eq!(err.stats, RunStats::default());

        let err = sched.run(&cancel, "deploy", "not-a-host").await.unwrap_err();
        assert!(matches!(err.source, SpotError::TargetNotFound(_)));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }
}
