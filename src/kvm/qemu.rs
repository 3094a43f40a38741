use crate::machine::config::{Arch, MachineConfig, NetworkMode};
use crate::machine::port::PortMap;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// 9p tag the guest mounts the shared folder by.
pub const MOUNT_TAG: &str = "host0";

#[derive(Error, Debug)]
pub enum QEMUError {
    #[error("VM startup failed: {0}")]
    VMStartupFailed(String),
    #[error("instance is already {0}")]
    AlreadyRunning(RunStatus),
    #[error("invalid pid file {path}: {content:?}")]
    InvalidPid { path: PathBuf, content: String },
    #[error("process {0} not found, removed stale pid file")]
    ProcessNotFound(i32),
    #[error("failed to send {signal} to process {pid}: {source}")]
    SignalFailed {
        pid: i32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("Disk provisioning failed: {0}")]
    DiskProvisionFailed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Timeout error: {0}")]
    TimeoutError(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl QEMUError {
    /// True when a signal was refused for lack of privilege.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            QEMUError::SignalFailed {
                source: Errno::EPERM,
                ..
            }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Stopped => write!(f, "Stopped"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Paused => write!(f, "Paused"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProcState {
    Alive,
    Suspended,
    Gone,
}

/// Launches the emulator for an instance and provisions its disk.
#[allow(async_fn_in_trait)]
pub trait Emulator {
    /// Starts the emulator detached from this process; returns once it has daemonised
    /// and written the instance pid-file.
    async fn spawn(&self, config: &MachineConfig) -> Result<(), QEMUError>;

    /// Resizes the instance disk image to `config.disk`.
    async fn resize_disk(&self, config: &MachineConfig) -> Result<(), QEMUError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accel {
    Hvf,
    Kvm,
    Tcg,
}

impl Accel {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Accel::Tcg)
    }
}

/// Hardware acceleration when the guest matches the host architecture and the
/// host exposes a hypervisor, software emulation otherwise.
pub fn select_accel(guest: Arch) -> Accel {
    if Arch::host() == Some(guest) {
        if cfg!(target_os = "macos") {
            return Accel::Hvf;
        }
        if cfg!(target_os = "linux") && Path::new("/dev/kvm").exists() {
            return Accel::Kvm;
        }
    }
    Accel::Tcg
}

/// Command line for `qemu-system-<arch>`.
pub fn qemu_args(
    config: &MachineConfig,
    accel: Accel,
    ports: &[PortMap],
    firmware: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |parts: &[&str]| args.extend(parts.iter().map(|p| p.to_string()));

    match config.arch {
        Arch::Aarch64 => {
            let accel_arg = match accel {
                Accel::Hvf => "hvf",
                Accel::Kvm => "kvm",
                Accel::Tcg => "tcg",
            };
            let cpu = if accel.is_hardware() { "host" } else { "cortex-a72" };
            push(&["-M", "virt,highmem=off", "-accel", accel_arg, "-cpu", cpu]);
            push(&["-bios", &firmware.display().to_string()]);
        }
        Arch::X86_64 => {
            let accel_arg = match accel {
                Accel::Hvf => "hvf",
                Accel::Kvm => "kvm",
                Accel::Tcg if cfg!(target_os = "macos") => "tcg,thread=multi,tb-size=512",
                Accel::Tcg => "tcg",
            };
            push(&["-M", "q35", "-accel", accel_arg]);
            if accel.is_hardware() {
                push(&["-cpu", "host"]);
            }
            push(&["-global", "ICH9-LPC.disable_s3=1"]);
        }
    }

    let memory = config.memory.to_string();
    let smp = format!(
        "{cpu},sockets=1,cores={cpu},threads=1",
        cpu = config.cpu
    );
    let drive = format!(
        "if=virtio,file={},format=qcow2",
        config.image_path().display()
    );
    push(&["-name", &config.alias, "-m", &memory, "-smp", &smp, "-drive", &drive]);

    let netdev = match config.network {
        NetworkMode::User => {
            let mut netdev = format!("user,id=net0,{}", PortMap::tcp(config.ssh_port, 22).hostfwd());
            for port in ports {
                netdev.push(',');
                netdev.push_str(&port.hostfwd());
            }
            netdev
        }
        NetworkMode::Bridged => "vmnet-shared,id=net0".to_string(),
    };
    let device = format!("virtio-net-pci,netdev=net0,mac={}", config.mac_address);
    push(&["-netdev", &netdev, "-device", &device]);

    let serial = format!(
        "socket,id=char-serial,path={},server=on,wait=off,logfile={}",
        config.serial_socket().display(),
        config.serial_log().display()
    );
    let qmp = format!(
        "socket,id=char-qmp,path={},server=on,wait=off",
        config.qmp_socket().display()
    );
    push(&[
        "-pidfile",
        &config.pid_file().display().to_string(),
        "-chardev",
        &serial,
        "-serial",
        "chardev:char-serial",
        "-chardev",
        &qmp,
        "-qmp",
        "chardev:char-qmp",
        "-parallel",
        "none",
        "-display",
        "none",
        "-daemonize",
    ]);

    if let Some(mount) = &config.mount {
        let virtfs = format!(
            "local,path={},security_model=none,mount_tag={}",
            mount.display(),
            MOUNT_TAG
        );
        push(&["-virtfs", &virtfs]);
    }

    args
}

/// The system QEMU installation.
#[derive(Clone, Debug)]
pub struct Qemu {
    firmware_name: String,
}

impl Qemu {
    pub fn new(firmware_name: impl Into<String>) -> Self {
        Qemu {
            firmware_name: firmware_name.into(),
        }
    }
}

impl Emulator for Qemu {
    async fn spawn(&self, config: &MachineConfig) -> Result<(), QEMUError> {
        let ports = config
            .port_maps()
            .map_err(|e| QEMUError::ConfigError(e.to_string()))?;
        let accel = select_accel(config.arch);
        if !accel.is_hardware() {
            warn!(
                alias = %config.alias,
                "No hardware acceleration for {} guests on this host, using software emulation; expect degraded performance",
                config.arch
            );
        }

        let binary = config.arch.qemu_binary();
        let args = qemu_args(config, accel, &ports, &config.firmware_path(&self.firmware_name));
        debug!("Executing {} {}", binary, args.join(" "));

        let output = Command::new(&binary)
            .args(&args)
            .current_dir(&config.location)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => QEMUError::VMStartupFailed(format!(
                    "{} is not available on $PATH, ensure qemu is installed",
                    binary
                )),
                _ => QEMUError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QEMUError::VMStartupFailed(format!(
                "{} exited with {:?}: {}",
                binary,
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn resize_disk(&self, config: &MachineConfig) -> Result<(), QEMUError> {
        let output = Command::new("qemu-img")
            .arg("resize")
            .arg(config.image_path())
            .arg(&config.disk)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => QEMUError::DiskProvisionFailed(
                    "qemu-img is not available on $PATH, ensure qemu is installed".to_string(),
                ),
                _ => QEMUError::Io(e),
            })?;

        if !output.status.success() {
            return Err(QEMUError::DiskProvisionFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        info!(alias = %config.alias, "Resized disk to {}", config.disk);
        Ok(())
    }
}

/// Drives the emulator process of an instance through its pid-file.
///
/// Holds no state of its own: every call re-reads the pid-file and asks the OS
/// about the recorded process.
pub struct ProcessSupervisor<E> {
    emulator: E,
    pidfile_timeout: Duration,
}

impl<E: Emulator> ProcessSupervisor<E> {
    pub fn new(emulator: E, pidfile_timeout: Duration) -> Self {
        ProcessSupervisor {
            emulator,
            pidfile_timeout,
        }
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    pub fn status(&self, config: &MachineConfig) -> Result<(RunStatus, Option<i32>), QEMUError> {
        match read_pid(&config.pid_file())? {
            None => Ok((RunStatus::Stopped, None)),
            Some(pid) => match process_state(pid)? {
                ProcState::Suspended => Ok((RunStatus::Paused, Some(pid))),
                ProcState::Alive | ProcState::Gone => Ok((RunStatus::Running, Some(pid))),
            },
        }
    }

    pub async fn start(
        &self,
        config: &MachineConfig,
        cancel: &CancellationToken,
    ) -> Result<i32, QEMUError> {
        let (status, _) = self.status(config)?;
        if status != RunStatus::Stopped {
            return Err(QEMUError::AlreadyRunning(status));
        }
        remove_process_files(config)?;

        info!(alias = %config.alias, "Booting...");
        // spawn always runs to completion: the emulator daemonises on its own and is only
        // reachable through its pid-file afterwards
        let spawned = self.emulator.spawn(config).await;

        let result = match spawned {
            Ok(()) if cancel.is_cancelled() => Err(QEMUError::Cancelled),
            Ok(()) => self.wait_for_pid(config, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(pid) => {
                info!(alias = %config.alias, pid, "Emulator running");
                Ok(pid)
            }
            Err(e) => {
                error!(alias = %config.alias, "Emulator failed to start: {}", e);
                if matches!(e, QEMUError::Cancelled) {
                    // the pid-file may still be on its way
                    if let Err(wait) = self.wait_for_pid(config, &CancellationToken::new()).await {
                        debug!(alias = %config.alias, "No emulator to roll back: {}", wait);
                    }
                }
                if let Err(cleanup) = self.kill(config).await {
                    warn!(alias = %config.alias, "Cleanup after failed start: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn wait_for_pid(
        &self,
        config: &MachineConfig,
        cancel: &CancellationToken,
    ) -> Result<i32, QEMUError> {
        let deadline = Instant::now() + self.pidfile_timeout;
        loop {
            match read_pid(&config.pid_file()) {
                Ok(Some(pid)) => {
                    if process_state(pid)? == ProcState::Gone {
                        return Err(QEMUError::VMStartupFailed(format!(
                            "emulator exited right after starting, see {}",
                            config.serial_log().display()
                        )));
                    }
                    return Ok(pid);
                }
                Ok(None) | Err(QEMUError::InvalidPid { .. }) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(QEMUError::TimeoutError(format!(
                    "pid file {} did not appear within {:?}",
                    config.pid_file().display(),
                    self.pidfile_timeout
                )));
            }

            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(QEMUError::Cancelled),
            }
        }
    }

    /// SIGTERM, then removal of the pid-file and sockets. Stopped is a no-op.
    pub async fn stop(&self, config: &MachineConfig) -> Result<(), QEMUError> {
        let Some(pid) = read_pid(&config.pid_file())? else {
            debug!(alias = %config.alias, "Already stopped");
            return Ok(());
        };

        let state = process_state(pid)?;
        if state == ProcState::Gone {
            remove_process_files(config)?;
            return Err(QEMUError::ProcessNotFound(pid));
        }

        send_signal(pid, Signal::SIGTERM)?;
        if state == ProcState::Suspended {
            send_signal(pid, Signal::SIGCONT)?;
        }

        if !wait_for_exit(pid, STOP_TIMEOUT).await? {
            warn!(alias = %config.alias, pid, "Emulator ignored SIGTERM, sending SIGKILL");
            send_signal(pid, Signal::SIGKILL)?;
            wait_for_exit(pid, KILL_TIMEOUT).await?;
        }

        remove_process_files(config)?;
        info!(alias = %config.alias, "Stopped");
        Ok(())
    }

    /// SIGKILL regardless of state; used to roll back a half-started instance.
    pub async fn kill(&self, config: &MachineConfig) -> Result<(), QEMUError> {
        let pid = match read_pid(&config.pid_file()) {
            Ok(pid) => pid,
            Err(QEMUError::InvalidPid { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(pid) = pid {
            if process_state(pid)? != ProcState::Gone {
                send_signal(pid, Signal::SIGKILL)?;
                wait_for_exit(pid, KILL_TIMEOUT).await?;
            }
        }
        remove_process_files(config)?;
        Ok(())
    }

    /// SIGSTOP when Running. Returns whether the process was suspended.
    pub async fn pause(&self, config: &MachineConfig) -> Result<bool, QEMUError> {
        match self.status(config)? {
            (RunStatus::Running, Some(pid)) => {
                send_signal(pid, Signal::SIGSTOP)?;
                settle(pid, ProcState::Suspended).await?;
                info!(alias = %config.alias, "Paused");
                Ok(true)
            }
            (status, _) => {
                debug!(alias = %config.alias, "Not pausing, instance is {}", status);
                Ok(false)
            }
        }
    }

    /// SIGCONT when Paused. Returns whether the process was continued.
    pub async fn resume(&self, config: &MachineConfig) -> Result<bool, QEMUError> {
        match self.status(config)? {
            (RunStatus::Paused, Some(pid)) => {
                send_signal(pid, Signal::SIGCONT)?;
                settle(pid, ProcState::Alive).await?;
                info!(alias = %config.alias, "Resumed");
                Ok(true)
            }
            (status, _) => {
                debug!(alias = %config.alias, "Not resuming, instance is {}", status);
                Ok(false)
            }
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, QEMUError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(QEMUError::InvalidPid {
            path: path.to_path_buf(),
            content,
        }),
    }
}

fn send_signal(pid: i32, signal: Signal) -> Result<(), QEMUError> {
    debug!(pid, "Sending {}", signal);
    signal::kill(Pid::from_raw(pid), signal).map_err(|source| QEMUError::SignalFailed {
        pid,
        signal,
        source,
    })
}

fn remove_process_files(config: &MachineConfig) -> Result<(), QEMUError> {
    for path in [config.pid_file(), config.serial_socket(), config.qmp_socket()] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> Result<bool, QEMUError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if process_state(pid)? == ProcState::Gone {
            return Ok(true);
        }
        sleep(POLL_INTERVAL).await;
    }
    Ok(process_state(pid)? == ProcState::Gone)
}

async fn settle(pid: i32, expected: ProcState) -> Result<(), QEMUError> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if process_state(pid)? == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    Err(QEMUError::TimeoutError(format!(
        "process {} did not reach {:?}",
        pid, expected
    )))
}

fn classify_state(state: Option<char>) -> ProcState {
    match state {
        None | Some('Z') | Some('X') | Some('x') => ProcState::Gone,
        Some('T') | Some('t') => ProcState::Suspended,
        Some(_) => ProcState::Alive,
    }
}

#[cfg(target_os = "linux")]
fn process_state(pid: i32) -> Result<ProcState, QEMUError> {
    let stat = match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ProcState::Gone),
        Err(e) => return Err(e.into()),
    };
    // the command name may itself contain ')'
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    Ok(classify_state(state))
}

#[cfg(not(target_os = "linux"))]
fn process_state(pid: i32) -> Result<ProcState, QEMUError> {
    if let Err(Errno::ESRCH) = signal::kill(Pid::from_raw(pid), None) {
        return Ok(ProcState::Gone);
    }
    let output = std::process::Command::new("ps")
        .args(["-o", "state=", "-p", &pid.to_string()])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(classify_state(stdout.trim().chars().next()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::machine::config::ConfigStore;
    use crate::machine::config::tests::sample_config;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Stands in for QEMU: daemonises a `sleep` and records its pid.
    #[derive(Default)]
    pub(crate) struct SleepEmulator {
        pub(crate) fail: Cell<bool>,
        /// Time spent before daemonising.
        pub(crate) delay: Duration,
        pub(crate) spawns: Cell<usize>,
    }

    impl SleepEmulator {
        pub(crate) fn failing() -> Self {
            let emulator = SleepEmulator::default();
            emulator.fail.set(true);
            emulator
        }
    }

    impl Emulator for SleepEmulator {
        async fn spawn(&self, config: &MachineConfig) -> Result<(), QEMUError> {
            self.spawns.set(self.spawns.get() + 1);
            if self.fail.get() {
                return Err(QEMUError::VMStartupFailed("emulator refused".to_string()));
            }
            let script = format!(
                "sleep {}; sleep 60 >/dev/null 2>&1 & echo $! > '{}'",
                self.delay.as_secs_f64(),
                config.pid_file().display()
            );
            let status = Command::new("sh").arg("-c").arg(script).status().await?;
            assert!(status.success());
            fs::write(config.serial_socket(), b"")?;
            fs::write(config.qmp_socket(), b"")?;
            Ok(())
        }

        async fn resize_disk(&self, _config: &MachineConfig) -> Result<(), QEMUError> {
            Ok(())
        }
    }

    fn fixture(dir: &TempDir) -> MachineConfig {
        let store = ConfigStore::new(dir.path());
        let config = sample_config(&store, "alpha");
        fs::create_dir_all(&config.location).unwrap();
        config
    }

    fn supervisor() -> ProcessSupervisor<SleepEmulator> {
        ProcessSupervisor::new(SleepEmulator::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_qemu_args_user_network() {
        let dir = TempDir::new().unwrap();
        let mut config = fixture(&dir);
        config.mount = Some(PathBuf::from("/srv/share"));
        let ports = config.port_maps().unwrap();
        let args = qemu_args(&config, Accel::Tcg, &ports, Path::new("/fw.fd"));
        let joined = args.join(" ");

        assert!(joined.contains("-m 1024"));
        assert!(joined.contains("-smp 2,sockets=1,cores=2,threads=1"));
        assert!(joined.contains(
            "user,id=net0,hostfwd=tcp::2222-:22,hostfwd=tcp::8080-:8080,hostfwd=udp::53-:53"
        ));
        assert!(joined.contains("mac=56:12:34:56:78:9a"));
        assert!(joined.contains(&format!("-pidfile {}", config.pid_file().display())));
        assert!(joined.contains("-daemonize"));
        assert!(joined.contains("local,path=/srv/share,security_model=none,mount_tag=host0"));
        assert!(!joined.contains("-bios"));
    }

    #[test]
    fn test_qemu_args_bridged_aarch64() {
        let dir = TempDir::new().unwrap();
        let mut config = fixture(&dir);
        config.arch = Arch::Aarch64;
        config.network = NetworkMode::Bridged;
        let args = qemu_args(&config, Accel::Hvf, &[], Path::new("/fw.fd"));
        let joined = args.join(" ");

        assert!(joined.contains("-accel hvf -cpu host"));
        assert!(joined.contains("-bios /fw.fd"));
        assert!(joined.contains("-netdev vmnet-shared,id=net0"));
        assert!(!joined.contains("hostfwd"));
        assert!(!joined.contains("-virtfs"));
    }

    #[test]
    fn test_classify_state() {
        assert_eq!(classify_state(Some('S')), ProcState::Alive);
        assert_eq!(classify_state(Some('R')), ProcState::Alive);
        assert_eq!(classify_state(Some('T')), ProcState::Suspended);
        assert_eq!(classify_state(Some('Z')), ProcState::Gone);
        assert_eq!(classify_state(None), ProcState::Gone);
    }

    #[test]
    fn test_invalid_pid_file() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        for content in ["abc", "0", "-5", ""] {
            fs::write(config.pid_file(), content).unwrap();
            assert!(matches!(
                supervisor().status(&config),
                Err(QEMUError::InvalidPid { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_start_pause_resume_stop() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        let supervisor = supervisor();
        let cancel = CancellationToken::new();

        assert_eq!(supervisor.status(&config).unwrap(), (RunStatus::Stopped, None));

        let pid = supervisor.start(&config, &cancel).await.unwrap();
        assert_eq!(
            supervisor.status(&config).unwrap(),
            (RunStatus::Running, Some(pid))
        );

        let err = supervisor.start(&config, &cancel).await.unwrap_err();
        assert!(matches!(err, QEMUError::AlreadyRunning(RunStatus::Running)));
        assert_eq!(supervisor.status(&config).unwrap().1, Some(pid));

        assert!(supervisor.pause(&config).await.unwrap());
        assert_eq!(
            supervisor.status(&config).unwrap(),
            (RunStatus::Paused, Some(pid))
        );
        assert!(!supervisor.pause(&config).await.unwrap());

        assert!(supervisor.resume(&config).await.unwrap());
        assert_eq!(
            supervisor.status(&config).unwrap(),
            (RunStatus::Running, Some(pid))
        );
        assert!(!supervisor.resume(&config).await.unwrap());

        supervisor.stop(&config).await.unwrap();
        assert_eq!(supervisor.status(&config).unwrap(), (RunStatus::Stopped, None));
        assert!(!config.pid_file().exists());
        assert!(!config.serial_socket().exists());
        assert!(!config.qmp_socket().exists());

        supervisor.stop(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_paused_process() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        let supervisor = supervisor();

        supervisor.start(&config, &CancellationToken::new()).await.unwrap();
        supervisor.pause(&config).await.unwrap();
        supervisor.stop(&config).await.unwrap();
        assert_eq!(supervisor.status(&config).unwrap().0, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        let supervisor = supervisor();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        fs::write(config.pid_file(), pid.to_string()).unwrap();

        assert_eq!(supervisor.status(&config).unwrap().0, RunStatus::Running);
        let err = supervisor.stop(&config).await.unwrap_err();
        assert!(matches!(err, QEMUError::ProcessNotFound(p) if p == pid));
        assert_eq!(supervisor.status(&config).unwrap().0, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        let supervisor = ProcessSupervisor::new(SleepEmulator::failing(), Duration::from_secs(1));

        let err = supervisor
            .start(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QEMUError::VMStartupFailed(_)));
        assert!(!config.pid_file().exists());
    }

    #[tokio::test]
    async fn test_cancelled_start_kills_late_emulator() {
        let dir = TempDir::new().unwrap();
        let config = fixture(&dir);
        let supervisor = ProcessSupervisor::new(
            SleepEmulator {
                delay: Duration::from_millis(400),
                ..SleepEmulator::default()
            },
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }

        let err = supervisor.start(&config, &cancel).await.unwrap_err();
        assert!(matches!(err, QEMUError::Cancelled));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(supervisor.status(&config).unwrap(), (RunStatus::Stopped, None));
        assert!(!config.pid_file().exists());
    }
}
