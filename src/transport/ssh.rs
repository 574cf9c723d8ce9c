//! SSH-backed `Transport` implementation shared by all three worker kinds.
//!
//! `ssh2` is a synchronous, blocking binding to libssh2. Every call runs on
//! `tokio::task::spawn_blocking` so a slow worker never stalls the runtime's
//! async worker threads — the session itself lives behind a `std::sync::Mutex`
//! so the blocking closure can borrow it across the `spawn_blocking` boundary.

use async_trait::async_trait;
use chrono::Utc;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use crate::error::{Error, Result};

use super::{Auth, HealthSample, Kind, Transport, WorkerConfig};

struct Inner {
    tcp: Option<TcpStream>,
    session: Option<Session>,
}

impl Inner {
    fn connected(&self) -> bool {
        self.session.is_some()
    }
}

/// A `Transport` bound to one worker, speaking SSH/SFTP over `ssh2`.
pub struct SshTransport {
    name: String,
    kind: Kind,
    config: WorkerConfig,
    inner: std::sync::Arc<StdMutex<Inner>>,
}

impl SshTransport {
    pub fn new(name: impl Into<String>, kind: Kind, config: WorkerConfig) -> Self {
        Self {
            name: name.into(),
            kind,
            config,
            inner: std::sync::Arc::new(StdMutex::new(Inner {
                tcp: None,
                session: None,
            })),
        }
    }

    fn transport_err(&self, message: impl Into<String>) -> Error {
        Error::Transport {
            worker: self.name.clone(),
            message: message.into(),
        }
    }

    /// Runs a blocking closure against the live session, mapping any lock
    /// poisoning or missing-session state onto a transport error.
    async fn with_session<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        let worker = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| Error::Transport {
                worker: worker.clone(),
                message: "session lock poisoned".to_string(),
            })?;
            let session = guard.session.as_mut().ok_or_else(|| Error::Transport {
                worker: worker.clone(),
                message: "not connected".to_string(),
            })?;
            f(session)
        })
        .await
        .map_err(|e| Error::Transport {
            worker: self.name.clone(),
            message: format!("blocking task panicked: {e}"),
        })?
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> Kind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.connected())
            .unwrap_or(false)
    }

    async fn connect(&self) -> Result<()> {
        let inner = self.inner.clone();
        let config = self.config.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let addr = format!("{}:{}", config.host, config.port);
            let tcp = TcpStream::connect(&addr).map_err(|e| Error::Transport {
                worker: name.clone(),
                message: format!("tcp connect to {addr} failed: {e}"),
            })?;
            tcp.set_nodelay(true).ok();

            let mut session = Session::new().map_err(|e| Error::Transport {
                worker: name.clone(),
                message: format!("session init failed: {e}"),
            })?;
            session.set_tcp_stream(tcp.try_clone().map_err(Error::Io)?);
            session.handshake().map_err(|e| Error::Transport {
                worker: name.clone(),
                message: format!("handshake failed: {e}"),
            })?;

            match &config.auth {
                Auth::Password(password) => {
                    session
                        .userauth_password(&config.user, password)
                        .map_err(|e| Error::Transport {
                            worker: name.clone(),
                            message: format!("authentication failed: {e}"),
                        })?;
                }
                Auth::KeyPath(key_path) => {
                    session
                        .userauth_pubkey_file(&config.user, None, key_path, None)
                        .map_err(|e| Error::Transport {
                            worker: name.clone(),
                            message: format!("authentication failed: {e}"),
                        })?;
                }
            }

            if !session.authenticated() {
                return Err(Error::TransportPermanent {
                    worker: name,
                    message: "authentication did not complete".to_string(),
                });
            }

            let mut guard = inner.lock().map_err(|_| Error::Transport {
                worker: "".to_string(),
                message: "session lock poisoned".to_string(),
            })?;
            guard.tcp = Some(tcp);
            guard.session = Some(session);
            Ok(())
        })
        .await
        .map_err(|e| Error::Transport {
            worker: self.name.clone(),
            message: format!("blocking task panicked: {e}"),
        })??;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = inner.lock() {
                if let Some(session) = guard.session.take() {
                    let _ = session.disconnect(None, "bye", None);
                }
                guard.tcp = None;
            }
        })
        .await
        .ok();
        Ok(())
    }

    async fn exec(&self, cmd: &str) -> Result<(String, String)> {
        let cmd = cmd.to_string();
        self.with_session(move |session| {
            let mut channel = session.channel_session().map_err(|e| Error::Transport {
                worker: String::new(),
                message: format!("channel open failed: {e}"),
            })?;
            channel.exec(&cmd).map_err(|e| Error::Transport {
                worker: String::new(),
                message: format!("exec failed: {e}"),
            })?;
            let mut stdout = String::new();
            channel.read_to_string(&mut stdout).ok();
            let mut stderr = String::new();
            channel.stderr().read_to_string(&mut stderr).ok();
            channel.wait_close().ok();
            Ok((stdout, stderr))
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_session(move |session| {
            let metadata = std::fs::metadata(&local).map_err(Error::Io)?;
            let mut local_file = std::fs::File::open(&local).map_err(Error::Io)?;
            let mut remote_file = session
                .scp_send(Path::new(&remote), 0o644, metadata.len(), None)
                .map_err(|e| Error::Transport {
                    worker: String::new(),
                    message: format!("upload open failed for {remote}: {e}"),
                })?;
            std::io::copy(&mut local_file, &mut remote_file).map_err(|e| Error::Transport {
                worker: String::new(),
                message: format!("upload write failed for {remote}: {e}"),
            })?;
            remote_file.send_eof().ok();
            remote_file.wait_eof().ok();
            remote_file.close().ok();
            remote_file.wait_close().ok();
            Ok(())
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let remote = remote.to_string();
        let local = local.to_path_buf();
        self.with_session(move |session| {
            let (mut remote_file, _stat) =
                session.scp_recv(Path::new(&remote)).map_err(|e| Error::Transport {
                    worker: String::new(),
                    message: format!("download open failed for {remote}: {e}"),
                })?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent).map_err(Error::Io)?;
            }
            let mut local_file = std::fs::File::create(&local).map_err(Error::Io)?;
            std::io::copy(&mut remote_file, &mut local_file).map_err(|e| Error::Transport {
                worker: String::new(),
                message: format!("download write failed for {remote}: {e}"),
            })?;
            local_file.flush().ok();
            Ok(())
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let (stdout, stderr) = self.exec(&format!("mkdir -p \"{path}\"")).await?;
        let _ = stdout;
        if !stderr.trim().is_empty() {
            return Err(self.transport_err(format!("mkdir {path} failed: {stderr}")));
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let cmd = self.kind.remove_dir_cmd(path);
        let (_stdout, _stderr) = self.exec(&cmd).await?;
        Ok(())
    }

    async fn health(&self) -> Result<HealthSample> {
        let mut errors = Vec::new();

        let cpu_percent = match self.exec(self.kind.cpu_probe()).await {
            Ok((out, _)) => self.kind.parse_cpu_sample(&out).unwrap_or_else(|| {
                errors.push(format!("failed to parse cpu probe output: {out:?}"));
                0.0
            }),
            Err(e) => {
                errors.push(format!("cpu probe failed: {e}"));
                0.0
            }
        };

        let mem_percent = match self.exec(self.kind.mem_probe()).await {
            Ok((out, _)) => self.kind.parse_mem_sample(&out).unwrap_or_else(|| {
                errors.push(format!("failed to parse memory probe output: {out:?}"));
                0.0
            }),
            Err(e) => {
                errors.push(format!("memory probe failed: {e}"));
                0.0
            }
        };

        let disk_percent = match self.exec(self.kind.disk_probe()).await {
            Ok((out, _)) => self.kind.parse_disk_sample(&out).unwrap_or_else(|| {
                errors.push(format!("failed to parse disk probe output: {out:?}"));
                0.0
            }),
            Err(e) => {
                errors.push(format!("disk probe failed: {e}"));
                0.0
            }
        };

        let interpreter_version = self.interpreter_version().await.ok();

        Ok(HealthSample {
            cpu_percent,
            mem_percent,
            disk_percent,
            interpreter_version,
            errors,
            sampled_at: Utc::now(),
        })
    }

    async fn interpreter_version(&self) -> Result<String> {
        let (stdout, stderr) = self.exec(self.kind.interpreter_probe()).await?;
        if !stderr.trim().is_empty() {
            return Err(self.transport_err(format!("interpreter probe failed: {stderr}")));
        }
        Ok(stdout.trim().to_string())
    }
}

