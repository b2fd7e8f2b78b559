// SSH transport built on libssh2

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use ssh2::{Session, Sftp};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use super::{cancellable, Connector, Executor};
use crate::output::errors::SpotError;
use crate::parser::ast::Destination;

/// Connection settings shared by every host of a run
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: String::new(),
            private_key: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens an SSH session per host
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        SshConnector { config }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn open_session(
    host: &Destination,
    user: &str,
    private_key: Option<&Path>,
    timeout: Duration,
) -> Result<Session, String> {
    let addr = (host.host.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| format!("invalid address: {}", e))?
        .next()
        .ok_or_else(|| "address resolved to nothing".to_string())?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| format!("connection failed: {}", e))?;

    let mut session = Session::new().map_err(|e| format!("can't create ssh session: {}", e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| format!("ssh handshake failed: {}", e))?;

    match private_key {
        Some(key) => session
            .userauth_pubkey_file(user, None, key, None)
            .map_err(|e| format!("key authentication as {} failed: {}", user, e))?,
        None => session
            .userauth_agent(user)
            .map_err(|e| format!("agent authentication as {} failed: {}", user, e))?,
    }

    // libssh2 may not report the failure until the session is used
    if !session.authenticated() {
        return Err(format!("authentication as {} failed", user));
    }
    session.set_timeout(0);
    Ok(session)
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        host: &Destination,
    ) -> Result<Box<dyn Executor>, SpotError> {
        let dest = host.clone();
        let user = if host.user.is_empty() {
            self.config.user.clone()
        } else {
            host.user.clone()
        };
        let key = self.config.private_key.clone();
        let timeout = self.config.connect_timeout;
        let address = host.address();

        debug!("connect to {} as {}", address, user);
        let job = tokio::task::spawn_blocking(move || {
            open_session(&dest, &user, key.as_deref(), timeout)
        });
        let session = cancellable(cancel, async {
            job.await
                .map_err(|e| e.to_string())
                .and_then(|r| r)
                .map_err(|message| SpotError::Connect {
                    host: address.clone(),
                    message,
                })
        })
        .await?;

        Ok(Box::new(SshExecutor {
            session,
            host: address,
        }))
    }

    fn user(&self) -> &str {
        &self.config.user
    }
}

/// A connected SSH session
pub struct SshExecutor {
    session: Session,
    host: String,
}

impl SshExecutor {
    /// Run blocking libssh2 work off the runtime, honouring cancellation
    async fn blocking<T, F>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        work: F,
    ) -> Result<T, SpotError>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> Result<T, String> + Send + 'static,
    {
        let session = self.session.clone();
        let job = tokio::task::spawn_blocking(move || work(session));
        cancellable(cancel, async {
            job.await
                .map_err(|e| e.to_string())
                .and_then(|r| r)
                .map_err(|message| SpotError::transport(operation, &self.host, message))
        })
        .await
    }
}

fn exec(session: &Session, cmd: &str) -> Result<Vec<String>, String> {
    let mut channel = session.channel_session().map_err(|e| e.to_string())?;
    channel.exec(cmd).map_err(|e| e.to_string())?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).map_err(|e| e.to_string())?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| e.to_string())?;

    channel.wait_close().map_err(|e| e.to_string())?;
    let status = channel.exit_status().map_err(|e| e.to_string())?;
    if status != 0 {
        return Err(format!("exit status {}: {}", status, stderr.trim()));
    }
    Ok(stdout.lines().map(str::to_string).collect())
}

fn mkdir_parent(session: &Session, remote: &str) -> Result<(), String> {
    match Path::new(remote).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            exec(session, &format!("mkdir -p {}", shell_quote(&parent.to_string_lossy())))?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn scp_send(session: &Session, local: &Path, remote: &Path, mtime: Option<u64>) -> Result<(), String> {
    let data = std::fs::read(local).map_err(|e| format!("can't read {}: {}", local.display(), e))?;
    let times = mtime.map(|t| (t, t));
    let mut channel = session
        .scp_send(remote, 0o644, data.len() as u64, times)
        .map_err(|e| format!("can't open {}: {}", remote.display(), e))?;
    channel.write_all(&data).map_err(|e| e.to_string())?;
    channel.send_eof().map_err(|e| e.to_string())?;
    channel.wait_eof().map_err(|e| e.to_string())?;
    channel.close().map_err(|e| e.to_string())?;
    channel.wait_close().map_err(|e| e.to_string())
}

/// Remote files under `root`, keyed by relative path, with (size, mtime)
fn list_remote(
    sftp: &Sftp,
    root: &Path,
    dir: &Path,
    files: &mut HashMap<PathBuf, (u64, u64)>,
) -> Result<(), String> {
    let entries = match sftp.readdir(dir) {
        Ok(entries) => entries,
        // a missing destination is an empty one
        Err(_) if dir == root => return Ok(()),
        Err(e) => return Err(format!("can't list {}: {}", dir.display(), e)),
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            list_remote(sftp, root, &path, files)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            files.insert(
                rel.to_path_buf(),
                (stat.size.unwrap_or_default(), stat.mtime.unwrap_or_default()),
            );
        }
    }
    Ok(())
}

fn sync_tree(session: &Session, local_dir: &Path, remote_dir: &Path, delete: bool) -> Result<Vec<String>, String> {
    let sftp = session.sftp().map_err(|e| e.to_string())?;
    let mut remote = HashMap::new();
    list_remote(&sftp, remote_dir, remote_dir, &mut remote)?;

    let mut changed = Vec::new();
    let mut seen = HashSet::new();
    for entry in WalkDir::new(local_dir) {
        let entry = entry.map_err(|e| e.to_string())?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(local_dir) else {
            continue;
        };
        let meta = entry.metadata().map_err(|e| e.to_string())?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        seen.insert(rel.to_path_buf());

        if remote.get(rel) == Some(&(meta.len(), mtime)) {
            continue;
        }
        let dst = remote_dir.join(rel);
        mkdir_parent(session, &dst.to_string_lossy())?;
        scp_send(session, entry.path(), &dst, Some(mtime))?;
        changed.push(rel.display().to_string());
    }

    if delete {
        for rel in remote.keys().filter(|rel| !seen.contains(*rel)) {
            let dst = remote_dir.join(rel);
            sftp.unlink(&dst)
                .map_err(|e| format!("can't remove {}: {}", dst.display(), e))?;
            changed.push(rel.display().to_string());
        }
    }
    Ok(changed)
}

#[async_trait]
impl Executor for SshExecutor {
    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> Result<Vec<String>, SpotError> {
        let cmd = cmd.to_string();
        self.blocking(cancel, "run", move |session| exec(&session, &cmd))
            .await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local: &str,
        remote: &str,
        mkdir: bool,
    ) -> Result<(), SpotError> {
        let (local, remote) = (PathBuf::from(local), remote.to_string());
        self.blocking(cancel, "upload", move |session| {
            if mkdir {
                mkdir_parent(&session, &remote)?;
            }
            scp_send(&session, &local, Path::new(&remote), None)
        })
        .await
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &str,
        mkdir: bool,
    ) -> Result<(), SpotError> {
        let (remote, local) = (PathBuf::from(remote), PathBuf::from(local));
        self.blocking(cancel, "download", move |session| {
            let (mut channel, _) = session
                .scp_recv(&remote)
                .map_err(|e| format!("can't open {}: {}", remote.display(), e))?;
            let mut data = Vec::new();
            channel.read_to_end(&mut data).map_err(|e| e.to_string())?;
            channel.wait_close().map_err(|e| e.to_string())?;

            if mkdir {
                if let Some(parent) = local.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
            }
            std::fs::write(&local, data).map_err(|e| format!("can't write {}: {}", local.display(), e))
        })
        .await
    }

    async fn sync(
        &self,
        cancel: &CancellationToken,
        local_dir: &str,
        remote_dir: &str,
        delete: bool,
    ) -> Result<Vec<String>, SpotError> {
        let (local, remote) = (PathBuf::from(local_dir), PathBuf::from(remote_dir));
        self.blocking(cancel, "sync", move |session| {
            sync_tree(&session, &local, &remote, delete)
        })
        .await
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        recursive: bool,
    ) -> Result<(), SpotError> {
        let flags = if recursive { "-rf" } else { "-f" };
        let cmd = format!("rm {} {}", flags, shell_quote(remote));
        self.blocking(cancel, "delete", move |session| exec(&session, &cmd).map(|_| ()))
            .await
    }

    async fn close(&self) -> Result<(), SpotError> {
        self.session
            .disconnect(None, "bye", None)
            .map_err(|e| SpotError::transport("close", &self.host, e))
    }
}
