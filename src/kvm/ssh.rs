use crate::config::config::SSHConfig;
use crate::kvm::terminal::{RawModeGuard, TerminalSize};
use crate::machine::credential::ResolvedAuth;
use secrecy::ExposeSecret;
use ssh2::{Channel, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit status of a remote shell terminated by the user with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Error, Debug)]
pub enum SSHError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Session failed: {0}")]
    SessionFailed(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("SSH error: {0}")]
    SSH2(#[from] ssh2::Error),
    #[error("Client not initialized")]
    ClientNotInitialized,
    #[error("remote command exited with status {status}: {stderr}")]
    CommandExecutionFailed { status: i32, stderr: String },
    #[error("Timeout error: {0}")]
    TimeoutError(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Where and as whom to log in.
#[derive(Clone, Debug)]
pub struct SSHTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: ResolvedAuth,
}

pub struct SSHManager {
    target: SSHTarget,
    config: SSHConfig,
    session: Option<Session>,
}

impl SSHManager {
    pub fn new(target: SSHTarget, config: SSHConfig) -> Result<Self, SSHError> {
        config.validate()?;
        Ok(SSHManager {
            target,
            config,
            session: None,
        })
    }

    /// Dials the guest, retrying while it boots. Authentication failures are not retried.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), SSHError> {
        info!(
            "Connecting to SSH server at {}:{}",
            self.target.host, self.target.port
        );

        let mut backoff = self.config.initial_backoff;

        for attempt in 0..self.config.max_retries {
            let result = tokio::select! {
                result = self.try_connect() => result,
                _ = cancel.cancelled() => return Err(SSHError::Cancelled),
            };

            match result {
                Ok(session) => {
                    debug!(
                        "Connected to SSH server on attempt {}",
                        attempt + 1
                    );
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e @ SSHError::AuthenticationFailed(_)) => {
                    error!("{}", e);
                    return Err(e);
                }
                Err(e) => {
                    debug!("Connection attempt {} failed: {}", attempt + 1, e);

                    if attempt < self.config.max_retries - 1 {
                        debug!(
                            "Retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 2,
                            self.config.max_retries
                        );
                        tokio::select! {
                            _ = sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(SSHError::Cancelled),
                        }

                        backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
                    } else {
                        return Err(SSHError::ConnectionFailed(format!(
                            "Failed to connect after {} attempts: {}",
                            self.config.max_retries, e,
                        )));
                    }
                }
            }
        }

        Err(SSHError::ConnectionFailed(
            "Max retries reached without a successful connection".to_string(),
        ))
    }

    async fn try_connect(&self) -> Result<Session, SSHError> {
        let target = self.target.clone();
        let timeout = self.config.timeout;
        let compression = self.config.compression;
        let keep_alive = self.config.keep_alive_interval;

        tokio::task::spawn_blocking(move || {
            let addr = (target.host.as_str(), target.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    SSHError::ConnectionFailed(format!("cannot resolve {}", target.host))
                })?;
            let tcp = TcpStream::connect_timeout(&addr, timeout)?;

            let mut session = Session::new()?;
            session.set_compress(compression);
            session.set_timeout(timeout.as_millis() as u32);
            session.set_tcp_stream(tcp);
            session.handshake()?;
            if let Some(interval) = keep_alive {
                session.set_keepalive(true, interval.as_secs() as u32);
            }

            let auth = match &target.auth {
                ResolvedAuth::Password(secret) => {
                    session.userauth_password(&target.user, secret.expose_secret())
                }
                ResolvedAuth::Agent { host } => {
                    debug!("Authenticating through ssh-agent with keys for {}", host);
                    session.userauth_agent(&target.user)
                }
            };
            auth.map_err(|e| {
                SSHError::AuthenticationFailed(format!("{}@{}: {}", target.user, target.host, e))
            })?;
            if !session.authenticated() {
                return Err(SSHError::AuthenticationFailed(format!(
                    "{}@{}: server rejected credentials",
                    target.user, target.host
                )));
            }

            Ok(session)
        })
        .await
        .map_err(|e| SSHError::SessionFailed(format!("connection task failed: {}", e)))?
    }

    /// Runs `cmd` and returns its stdout; a non-zero exit is an error carrying stderr.
    pub async fn execute(&self, cmd: &str) -> Result<String, SSHError> {
        let session = self
            .session
            .clone()
            .ok_or(SSHError::ClientNotInitialized)?;

        debug!("Executing command: {}", cmd);

        let cmd = cmd.to_string();
        let idle_timeout = self.config.timeout;
        let (status, stdout, stderr) = tokio::task::spawn_blocking(move || {
            let mut channel = session.channel_session()?;
            channel.exec(&cmd)?;

            session.set_blocking(false);
            let drained = drain_streams(&mut channel, idle_timeout);
            session.set_blocking(true);
            let (stdout, stderr) = drained?;

            channel.wait_close()?;
            let status = channel.exit_status()?;
            Ok::<_, SSHError>((
                status,
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            ))
        })
        .await
        .map_err(|e| SSHError::SessionFailed(format!("command task failed: {}", e)))??;

        debug!("Command exited with status {}", status);

        if status != 0 {
            return Err(SSHError::CommandExecutionFailed {
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout)
    }

    /// `execute`, retried while the guest's services settle after boot.
    pub async fn execute_with_retry(
        &self,
        cmd: &str,
        retries: usize,
        backoff: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SSHError> {
        let attempts = retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(cmd).await {
                Ok(stdout) => return Ok(stdout),
                Err(e @ SSHError::ClientNotInitialized) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!("Command failed (attempt {}/{}): {}", attempt, attempts, e);
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(SSHError::Cancelled),
                    }
                }
            }
        }
    }

    /// Interactive session on a pseudo-terminal; blocks until the remote side exits.
    pub async fn attach(&self, command: Option<&str>) -> Result<(), SSHError> {
        let session = self
            .session
            .clone()
            .ok_or(SSHError::ClientNotInitialized)?;
        let command = command.map(str::to_string);

        tokio::task::spawn_blocking(move || attach_blocking(session, command))
            .await
            .map_err(|e| SSHError::SessionFailed(format!("terminal task failed: {}", e)))?
    }

    pub async fn disconnect(&mut self) -> Result<(), SSHError> {
        if let Some(session) = self.session.take() {
            debug!("Disconnecting SSH session");
            tokio::task::spawn_blocking(move || session.disconnect(None, "bye", None))
                .await
                .map_err(|e| SSHError::SessionFailed(format!("Failed to close session: {}", e)))??;
        }
        Ok(())
    }
}

fn attach_blocking(session: Session, command: Option<String>) -> Result<(), SSHError> {
    let mut size = TerminalSize::current_or_default();

    session.set_timeout(0);
    let mut channel = session.channel_session()?;
    channel.request_pty(
        "xterm-256color",
        None,
        Some((size.cols as u32, size.rows as u32, 0, 0)),
    )?;
    match &command {
        Some(command) => channel.exec(command)?,
        None => channel.shell()?,
    }

    let _raw = RawModeGuard::new().map_err(|e| SSHError::SessionFailed(e.to_string()))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    session.set_blocking(false);
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut buf = [0u8; 8192];

    let result = (|| -> Result<(), SSHError> {
        loop {
            let mut idle = true;

            if copy_available(&mut channel, 0, &mut buf, &mut stdout)? {
                idle = false;
            }
            if copy_available(&mut channel, 1, &mut buf, &mut stderr)? {
                idle = false;
            }
            while let Ok(data) = rx.try_recv() {
                write_all_nonblocking(&mut channel, &data)?;
                idle = false;
            }

            if channel.eof() {
                return Ok(());
            }

            let current = TerminalSize::current_or_default();
            if current != size {
                // EAGAIN here only delays the resize to the next pass
                if channel
                    .request_pty_size(current.cols as u32, current.rows as u32, None, None)
                    .is_ok()
                {
                    size = current;
                }
            }

            if idle {
                thread::sleep(Duration::from_millis(10));
            }
        }
    })();

    session.set_blocking(true);
    result?;
    channel.wait_close()?;
    classify_exit(channel.exit_status()?)
}

/// Numbered data streams of a session channel: 0 is stdout, 1 is stderr.
trait ChannelStreams {
    fn read_stream(&mut self, id: i32, buf: &mut [u8]) -> io::Result<usize>;
    fn at_eof(&self) -> bool;
}

impl ChannelStreams for Channel {
    fn read_stream(&mut self, id: i32, buf: &mut [u8]) -> io::Result<usize> {
        self.stream(id).read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Collects stdout and stderr of a non-blocking channel side by side until the remote end
/// closes, so a full stderr window cannot stall stdout.
fn drain_streams(
    channel: &mut impl ChannelStreams,
    idle_timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>), SSHError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];
    let mut last_data = Instant::now();

    loop {
        let mut idle = true;
        if copy_available(channel, 0, &mut buf, &mut stdout)? {
            idle = false;
        }
        if copy_available(channel, 1, &mut buf, &mut stderr)? {
            idle = false;
        }

        if !idle {
            last_data = Instant::now();
            continue;
        }
        if channel.at_eof() {
            return Ok((stdout, stderr));
        }
        if last_data.elapsed() > idle_timeout {
            return Err(SSHError::TimeoutError(format!(
                "no output from remote command for {:?}",
                idle_timeout
            )));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn copy_available(
    channel: &mut impl ChannelStreams,
    stream: i32,
    buf: &mut [u8],
    out: &mut impl Write,
) -> Result<bool, SSHError> {
    match channel.read_stream(stream, buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.write_all(&buf[..n])?;
            out.flush()?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn write_all_nonblocking(channel: &mut Channel, mut data: &[u8]) -> Result<(), SSHError> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Maps the exit status of an interactive session; a user interrupt is a normal exit.
pub fn classify_exit(status: i32) -> Result<(), SSHError> {
    match status {
        0 | EXIT_INTERRUPTED => Ok(()),
        status => Err(SSHError::CommandExecutionFailed {
            status,
            stderr: String::new(),
        }),
    }
}

/// Single-quotes `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
