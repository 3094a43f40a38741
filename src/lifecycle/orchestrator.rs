use crate::config::config::{SSHConfig, Settings};
use crate::image::download::ensure_cached;
use crate::kvm::dhcp::{DhcpError, wait_for_address};
use crate::kvm::qemu::{Emulator, MOUNT_TAG, ProcessSupervisor, QEMUError, RunStatus};
use crate::kvm::ssh::{SSHError, SSHManager, SSHTarget, shell_quote};
use crate::lifecycle::lock::InstanceLock;
use crate::machine::config::{Arch, ConfigStore, MachineConfig, MachineError, NetworkMode};
use crate::machine::names::{generate_mac, unique_alias};
use crate::machine::port::{check_available, parse_ports};
use crate::machine::validate::{
    validate_cpu, validate_disk, validate_image, validate_machine, validate_memory,
    validate_mount, validate_name, validate_ssh_port, validate_tag,
};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DHCP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLOCK_SYNC_COMMAND: &str = "hwclock -s";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Qemu(#[from] QEMUError),
    #[error(transparent)]
    Ssh(#[from] SSHError),
    #[error(transparent)]
    Dhcp(#[from] DhcpError),
    #[error("failed to provision instance: {0:#}")]
    Provision(anyhow::Error),
    #[error("instance {0} is busy with another command")]
    Busy(String),
    #[error("instance {0} is not running")]
    NotRunning(String),
    #[error("instance {alias} must be stopped to {action}")]
    NotStopped { alias: String, action: &'static str },
    #[error("address of instance {0} is not known yet")]
    AddressUnknown(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LifecycleError {
    fn is_process_not_found(&self) -> bool {
        matches!(self, LifecycleError::Qemu(QEMUError::ProcessNotFound(_)))
    }
}

/// Who a guest command is run for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestCommand {
    /// Typed by the user: runs once as the login user.
    User,
    /// Mount and clock setup: runs as root, retried on failure.
    Setup,
}

/// Runs commands inside a booted guest.
#[allow(async_fn_in_trait)]
pub trait RemoteShell {
    /// One-shot command; returns its stdout.
    async fn run(
        &self,
        config: &MachineConfig,
        command: &str,
        kind: GuestCommand,
        cancel: &CancellationToken,
    ) -> Result<String, LifecycleError>;

    /// Interactive terminal running `command`, or the login shell.
    async fn attach(
        &self,
        config: &MachineConfig,
        command: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError>;
}

/// [`RemoteShell`] over SSH to the guest's forwarded or leased address.
#[derive(Clone, Debug)]
pub struct SshRemote {
    ssh: SSHConfig,
    command_retries: usize,
    command_backoff: Duration,
}

impl SshRemote {
    pub fn new(settings: &Settings) -> Self {
        SshRemote {
            ssh: settings.ssh.clone(),
            command_retries: settings.command_retries,
            command_backoff: settings.command_backoff,
        }
    }

    /// Login target and the command line to send for it.
    fn plan(
        &self,
        config: &MachineConfig,
        command: &str,
        kind: GuestCommand,
    ) -> Result<(SSHTarget, String), LifecycleError> {
        let (host, port) = match config.network {
            NetworkMode::User => ("127.0.0.1".to_string(), config.ssh_port),
            NetworkMode::Bridged if config.machine_ip.is_empty() => {
                return Err(LifecycleError::AddressUnknown(config.alias.clone()));
            }
            NetworkMode::Bridged => (config.machine_ip.clone(), 22),
        };

        let (user, credential, command) = match config.root_credential() {
            _ if kind == GuestCommand::User || config.ssh_user == "root" => {
                (config.ssh_user.clone(), config.credential(), command.to_string())
            }
            Some(root) => ("root".to_string(), root, command.to_string()),
            None => (
                config.ssh_user.clone(),
                config.credential(),
                format!("sudo -n sh -c {}", shell_quote(command)),
            ),
        };

        let target = SSHTarget {
            host,
            port,
            user,
            auth: credential.resolve()?,
        };
        Ok((target, command))
    }

    /// A user command that reached the guest is never replayed.
    fn attempts(&self, kind: GuestCommand) -> usize {
        match kind {
            GuestCommand::User => 1,
            GuestCommand::Setup => self.command_retries,
        }
    }

    async fn connect(
        &self,
        target: SSHTarget,
        cancel: &CancellationToken,
    ) -> Result<SSHManager, LifecycleError> {
        let mut manager = SSHManager::new(target, self.ssh.clone())?;
        manager.connect(cancel).await?;
        Ok(manager)
    }
}

impl RemoteShell for SshRemote {
    async fn run(
        &self,
        config: &MachineConfig,
        command: &str,
        kind: GuestCommand,
        cancel: &CancellationToken,
    ) -> Result<String, LifecycleError> {
        let (target, command) = self.plan(config, command, kind)?;
        let mut manager = self.connect(target, cancel).await?;
        let result = manager
            .execute_with_retry(&command, self.attempts(kind), self.command_backoff, cancel)
            .await;
        if let Err(e) = manager.disconnect().await {
            debug!(alias = %config.alias, "Disconnect failed: {}", e);
        }
        Ok(result?)
    }

    async fn attach(
        &self,
        config: &MachineConfig,
        command: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let (target, _) = self.plan(config, "", GuestCommand::User)?;
        let mut manager = self.connect(target, cancel).await?;
        let result = manager.attach(command).await;
        if let Err(e) = manager.disconnect().await {
            debug!(alias = %config.alias, "Disconnect failed: {}", e);
        }
        Ok(result?)
    }
}

/// Parameters of a new instance.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub name: Option<String>,
    pub image: String,
    pub arch: Arch,
    pub cpu: u32,
    pub memory: u32,
    pub disk: String,
    pub mount: Option<PathBuf>,
    pub ssh_port: u16,
    pub port: String,
    pub network: NetworkMode,
    pub tags: Vec<String>,
}

impl Default for LaunchRequest {
    fn default() -> Self {
        LaunchRequest {
            name: None,
            image: "alpine_3.16.0".to_string(),
            arch: Arch::host().unwrap_or(Arch::X86_64),
            cpu: 4,
            memory: 2048,
            disk: "10G".to_string(),
            mount: None,
            ssh_port: 22,
            port: String::new(),
            network: NetworkMode::User,
            tags: Vec::new(),
        }
    }
}

impl LaunchRequest {
    pub fn validate(&self, settings: &Settings) -> Result<(), MachineError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        validate_image(&self.image, settings)?;
        validate_cpu(self.cpu)?;
        validate_memory(self.memory)?;
        validate_disk(&self.disk)?;
        validate_ssh_port(self.ssh_port)?;
        parse_ports(&self.port)?;
        if let Some(mount) = &self.mount {
            validate_mount(mount)?;
        }
        for tag in &self.tags {
            validate_tag(tag)?;
        }
        Ok(())
    }
}

/// Sequences configuration, process supervision and guest access for every lifecycle command.
pub struct Orchestrator<E, R> {
    settings: Settings,
    store: ConfigStore,
    supervisor: ProcessSupervisor<E>,
    remote: R,
    cancel: CancellationToken,
}

impl<E: Emulator, R: RemoteShell> Orchestrator<E, R> {
    pub fn new(settings: Settings, emulator: E, remote: R, cancel: CancellationToken) -> Self {
        Orchestrator {
            store: ConfigStore::new(settings.root.clone()),
            supervisor: ProcessSupervisor::new(emulator, settings.pidfile_timeout),
            settings,
            remote,
            cancel,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self, config: &MachineConfig) -> Result<(RunStatus, Option<i32>), LifecycleError> {
        Ok(self.supervisor.status(config)?)
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<MachineConfig, LifecycleError> {
        request.validate(&self.settings)?;

        let taken = self.store.list()?;
        let alias = match &request.name {
            Some(name) if taken.contains(name) || self.store.location(name).exists() => {
                return Err(MachineError::AlreadyExists(name.clone()).into());
            }
            Some(name) => name.clone(),
            None => unique_alias(&taken),
        };

        let mut config = MachineConfig {
            image: format!("{}-{}.qcow2", request.image, request.arch),
            arch: request.arch,
            cpu: request.cpu,
            memory: request.memory,
            disk: request.disk,
            mount: request.mount,
            machine_ip: match request.network {
                NetworkMode::User => "localhost".to_string(),
                NetworkMode::Bridged => String::new(),
            },
            port: request.port,
            ssh_port: request.ssh_port,
            mac_address: generate_mac(),
            network: request.network,
            ssh_user: "root".to_string(),
            ssh_password: "raw::root".to_string(),
            root_password: None,
            location: self.store.location(&alias),
            tags: request.tags.into_iter().collect(),
            alias,
        };

        for port in config.host_ports()? {
            check_available(&port)?;
        }

        let image = self.fetch(&config.image).await?;
        let firmware = match config.arch {
            Arch::Aarch64 => Some(self.fetch(&self.settings.firmware_name).await?),
            Arch::X86_64 => None,
        };

        fs::create_dir_all(self.store.root()).await?;
        fs::create_dir(&config.location).await.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => {
                LifecycleError::Machine(MachineError::AlreadyExists(config.alias.clone()))
            }
            _ => LifecycleError::Io(e),
        })?;
        info!(alias = %config.alias, "Launching");

        match self.provision(&mut config, &image, firmware.as_deref()).await {
            Ok(()) => {
                info!(alias = %config.alias, "Launched");
                Ok(config)
            }
            Err(e) => {
                error!(alias = %config.alias, "Launch failed, rolling back: {}", e);
                if let Err(kill) = self.supervisor.kill(&config).await {
                    warn!(alias = %config.alias, "Failed to kill emulator: {}", kill);
                }
                if let Err(remove) = fs::remove_dir_all(&config.location).await {
                    warn!(alias = %config.alias, "Failed to remove {}: {}", config.location.display(), remove);
                }
                Err(e)
            }
        }
    }

    async fn fetch(&self, file_name: &str) -> Result<PathBuf, LifecycleError> {
        tokio::select! {
            result = ensure_cached(&self.settings, file_name) => result.map_err(LifecycleError::Provision),
            _ = self.cancel.cancelled() => Err(LifecycleError::Cancelled),
        }
    }

    async fn provision(
        &self,
        config: &mut MachineConfig,
        image: &Path,
        firmware: Option<&Path>,
    ) -> Result<(), LifecycleError> {
        let _lock = InstanceLock::acquire(config)?;

        fs::copy(image, config.image_path()).await?;
        if let Some(firmware) = firmware {
            fs::copy(firmware, config.firmware_path(&self.settings.firmware_name)).await?;
        }
        self.supervisor.emulator().resize_disk(config).await?;
        self.store.save(config)?;

        self.boot(config).await?;
        Ok(())
    }

    /// Probes ports, starts the emulator, then finishes guest-side setup.
    /// Kills the emulator if anything after the spawn fails.
    async fn boot(&self, config: &mut MachineConfig) -> Result<i32, LifecycleError> {
        for port in config.host_ports()? {
            check_available(&port)?;
        }

        if config.network == NetworkMode::Bridged {
            config.machine_ip.clear();
        }

        let pid = self.supervisor.start(config, &self.cancel).await?;

        if let Err(e) = self.after_boot(config).await {
            error!(alias = %config.alias, "Guest setup failed: {}", e);
            if let Err(kill) = self.supervisor.kill(config).await {
                warn!(alias = %config.alias, "Failed to kill emulator: {}", kill);
            }
            return Err(e);
        }

        self.store.save(config)?;
        Ok(pid)
    }

    async fn after_boot(&self, config: &mut MachineConfig) -> Result<(), LifecycleError> {
        self.resolve_address(config).await?;

        if let Some(mount) = &config.mount {
            let target = guest_mount_point(mount);
            let command = format!(
                "mkdir -p {target} && mount -t 9p -o trans=virtio,version=9p2000.L {tag} {target}",
                target = shell_quote(&target),
                tag = MOUNT_TAG
            );
            self.remote
                .run(config, &command, GuestCommand::Setup, &self.cancel)
                .await?;
            info!(alias = %config.alias, "Mounted {} on {}", mount.display(), target);
        }
        Ok(())
    }

    /// Fills in `machine_ip` for bridged guests from the host's lease table and persists it.
    async fn resolve_address(&self, config: &mut MachineConfig) -> Result<(), LifecycleError> {
        if config.network != NetworkMode::Bridged || !config.machine_ip.is_empty() {
            return Ok(());
        }
        config.machine_ip = wait_for_address(
            &self.settings.dhcp_leases,
            &config.mac_address,
            self.settings.dhcp_timeout,
            DHCP_POLL_INTERVAL,
            &self.cancel,
        )
        .await?;
        self.store.save(config)?;
        Ok(())
    }

    pub async fn start(&self, alias: &str) -> Result<i32, LifecycleError> {
        let mut config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;

        let (status, _) = self.supervisor.status(&config)?;
        if status != RunStatus::Stopped {
            return Err(QEMUError::AlreadyRunning(status).into());
        }
        self.boot(&mut config).await
    }

    pub async fn stop(&self, alias: &str) -> Result<(), LifecycleError> {
        let config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;
        self.stop_instance(&config).await
    }

    async fn stop_instance(&self, config: &MachineConfig) -> Result<(), LifecycleError> {
        if self.supervisor.status(config)?.0 == RunStatus::Paused {
            self.supervisor.resume(config).await?;
        }
        self.supervisor.stop(config).await?;
        Ok(())
    }

    pub async fn restart(&self, alias: &str) -> Result<i32, LifecycleError> {
        let mut config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;

        match self.stop_instance(&config).await {
            Ok(()) => {}
            Err(e) if e.is_process_not_found() => {
                warn!(alias = %config.alias, "{}", e);
            }
            Err(e) => return Err(e),
        }

        sleep(self.settings.restart_delay).await;

        match self.boot(&mut config).await {
            Ok(pid) => Ok(pid),
            Err(e) => {
                if let Err(stop) = self.supervisor.stop(&config).await {
                    debug!(alias = %config.alias, "Cleanup stop after failed restart: {}", stop);
                }
                Err(e)
            }
        }
    }

    /// Returns whether the instance was running and is now paused.
    pub async fn pause(&self, alias: &str) -> Result<bool, LifecycleError> {
        let config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;
        self.pause_instance(&config).await
    }

    pub(crate) async fn pause_instance(&self, config: &MachineConfig) -> Result<bool, LifecycleError> {
        Ok(self.supervisor.pause(config).await?)
    }

    /// Returns whether the instance was paused and is now running.
    pub async fn resume(&self, alias: &str) -> Result<bool, LifecycleError> {
        let config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;
        self.resume_instance(&config).await
    }

    pub(crate) async fn resume_instance(&self, config: &MachineConfig) -> Result<bool, LifecycleError> {
        if !self.supervisor.resume(config).await? {
            return Ok(false);
        }
        // guest clock stood still while suspended
        if let Err(e) = self
            .remote
            .run(config, CLOCK_SYNC_COMMAND, GuestCommand::Setup, &self.cancel)
            .await
        {
            warn!(alias = %config.alias, "Failed to sync guest clock: {}", e);
        }
        Ok(true)
    }

    pub async fn delete(&self, alias: &str) -> Result<(), LifecycleError> {
        let config = self.store.load(alias)?;
        let lock = InstanceLock::acquire(&config)?;

        match self.stop_instance(&config).await {
            Ok(()) => {}
            Err(LifecycleError::Qemu(e)) if e.is_permission_denied() => {
                warn!(alias = %config.alias, "Could not stop emulator, deleting anyway: {}", e);
            }
            Err(e) if e.is_process_not_found() => {
                debug!(alias = %config.alias, "{}", e);
            }
            Err(e) => return Err(e),
        }

        fs::remove_dir_all(&config.location).await?;
        drop(lock);
        info!(alias = %config.alias, "Deleted");
        Ok(())
    }

    pub async fn rename(&self, alias: &str, new_alias: &str) -> Result<MachineConfig, LifecycleError> {
        validate_name(new_alias)?;
        let mut config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;

        let target = self.store.location(new_alias);
        if alias == new_alias || target.exists() {
            return Err(MachineError::AlreadyExists(new_alias.to_string()).into());
        }
        if self.supervisor.status(&config)?.0 != RunStatus::Stopped {
            return Err(LifecycleError::NotStopped {
                alias: alias.to_string(),
                action: "rename",
            });
        }

        let source = config.location.clone();
        fs::rename(&source, &target).await?;
        config.alias = new_alias.to_string();
        config.location = target.clone();

        if let Err(e) = self.store.save(&config) {
            if let Err(undo) = fs::rename(&target, &source).await {
                error!(alias, "Failed to restore {}: {}", source.display(), undo);
            }
            return Err(e.into());
        }

        info!(alias, "Renamed to {}", new_alias);
        Ok(config)
    }

    /// Adds, or with `remove` drops, labels. Already present or absent labels are no-ops.
    pub fn tag(&self, alias: &str, tags: &[String], remove: bool) -> Result<MachineConfig, LifecycleError> {
        for tag in tags {
            validate_tag(tag)?;
        }
        let mut config = self.store.load(alias)?;
        let _lock = InstanceLock::acquire(&config)?;

        let before = config.tags.clone();
        for tag in tags {
            if remove {
                config.tags.remove(tag);
            } else {
                config.tags.insert(tag.clone());
            }
        }
        if config.tags != before {
            self.store.save(&config)?;
        }
        Ok(config)
    }

    pub async fn exec(&self, alias: &str, command: &str) -> Result<String, LifecycleError> {
        let config = self.running_config(alias).await?;
        self.remote
            .run(&config, command, GuestCommand::User, &self.cancel)
            .await
    }

    pub async fn shell(&self, alias: &str, command: Option<&str>) -> Result<(), LifecycleError> {
        let config = self.running_config(alias).await?;
        self.remote.attach(&config, command, &self.cancel).await
    }

    async fn running_config(&self, alias: &str) -> Result<MachineConfig, LifecycleError> {
        let mut config = self.store.load(alias)?;
        if self.supervisor.status(&config)?.0 != RunStatus::Running {
            return Err(LifecycleError::NotRunning(alias.to_string()));
        }
        self.resolve_address(&mut config).await?;
        Ok(config)
    }

    /// Re-validates a hand-edited document, restoring `previous` when it is unusable.
    pub fn check_edit(&self, previous: &MachineConfig) -> Result<MachineConfig, LifecycleError> {
        let checked = self
            .store
            .load(&previous.alias)
            .and_then(|edited| validate_machine(&edited, previous, &self.settings).map(|()| edited));

        match checked {
            Ok(edited) => Ok(edited),
            Err(e) => {
                warn!(alias = %previous.alias, "Invalid edit, restoring previous configuration: {}", e);
                self.store.save(previous)?;
                Err(e.into())
            }
        }
    }
}

/// Guest directory a host folder is mounted on, `/mnt/<basename>`.
pub fn guest_mount_point(mount: &Path) -> String {
    let name = mount
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "host".to_string());
    format!("/mnt/{}", name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kvm::qemu::tests::SleepEmulator;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use tempfile::TempDir;

    /// Records commands instead of reaching a guest.
    #[derive(Default)]
    pub(crate) struct RecordingRemote {
        pub(crate) commands: RefCell<Vec<(String, String, GuestCommand)>>,
        pub(crate) fail: bool,
    }

    impl RemoteShell for RecordingRemote {
        async fn run(
            &self,
            config: &MachineConfig,
            command: &str,
            kind: GuestCommand,
            _cancel: &CancellationToken,
        ) -> Result<String, LifecycleError> {
            self.commands
                .borrow_mut()
                .push((config.alias.clone(), command.to_string(), kind));
            if self.fail {
                return Err(SSHError::ConnectionFailed("guest unreachable".to_string()).into());
            }
            Ok(String::new())
        }

        async fn attach(
            &self,
            config: &MachineConfig,
            command: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<(), LifecycleError> {
            self.commands.borrow_mut().push((
                config.alias.clone(),
                command.unwrap_or("<shell>").to_string(),
                GuestCommand::User,
            ));
            Ok(())
        }
    }

    pub(crate) type TestOrchestrator = Orchestrator<SleepEmulator, RecordingRemote>;

    pub(crate) fn test_settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.root = dir.path().to_path_buf();
        settings.image_base_url = "http://127.0.0.1:9/".to_string();
        settings.pidfile_timeout = Duration::from_secs(5);
        settings.restart_delay = Duration::ZERO;
        std::fs::create_dir_all(settings.cache_dir()).unwrap();
        std::fs::write(
            settings.cache_dir().join("alpine_3.16.0-x86_64.qcow2"),
            b"qcow2 image",
        )
        .unwrap();
        settings
    }

    pub(crate) fn orchestrator(dir: &TempDir) -> TestOrchestrator {
        Orchestrator::new(
            test_settings(dir),
            SleepEmulator::default(),
            RecordingRemote::default(),
            CancellationToken::new(),
        )
    }

    pub(crate) fn free_port() -> u16 {
        TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    pub(crate) fn request(name: &str) -> LaunchRequest {
        LaunchRequest {
            name: Some(name.to_string()),
            arch: Arch::X86_64,
            cpu: 1,
            memory: 512,
            disk: "1G".to_string(),
            ssh_port: free_port(),
            ..LaunchRequest::default()
        }
    }

    #[tokio::test]
    async fn test_launch_is_running_at_root_alias() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);

        let config = orch.launch(request("alpha")).await.unwrap();
        assert_eq!(config.location, dir.path().join("alpha"));
        assert_eq!(orch.status(&config).unwrap().0, RunStatus::Running);
        assert!(config.image_path().is_file());

        let stored = orch.store().load("alpha").unwrap();
        assert_eq!(stored, config);

        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_generates_alias() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);

        let config = orch
            .launch(LaunchRequest {
                name: None,
                ..request("unused")
            })
            .await
            .unwrap();
        assert!(config.alias.contains('-'));
        assert_eq!(config.location, dir.path().join(&config.alias));
        orch.stop(&config.alias).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_launch_removes_directory() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            test_settings(&dir),
            SleepEmulator::failing(),
            RecordingRemote::default(),
            CancellationToken::new(),
        );

        assert!(orch.launch(request("alpha")).await.is_err());
        assert!(!dir.path().join("alpha").exists());
        assert!(matches!(
            orch.store().load("alpha"),
            Err(MachineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_mount_kills_emulator() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            test_settings(&dir),
            SleepEmulator::default(),
            RecordingRemote {
                fail: true,
                ..RecordingRemote::default()
            },
            CancellationToken::new(),
        );
        let share = TempDir::new().unwrap();

        let result = orch
            .launch(LaunchRequest {
                mount: Some(share.path().to_path_buf()),
                ..request("alpha")
            })
            .await;
        assert!(matches!(result, Err(LifecycleError::Ssh(_))));
        assert!(!dir.path().join("alpha").exists());
    }

    #[tokio::test]
    async fn test_launch_rejects_existing_name() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        orch.launch(request("alpha")).await.unwrap();
        orch.stop("alpha").await.unwrap();

        let err = orch.launch(request("alpha")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Machine(MachineError::AlreadyExists(_))));
        assert!(orch.store().load("alpha").is_ok());
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_parameters() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);

        for bad in [
            LaunchRequest { memory: 100, ..request("alpha") },
            LaunchRequest { disk: "10T".to_string(), ..request("alpha") },
            LaunchRequest { port: "70000".to_string(), ..request("alpha") },
            LaunchRequest { name: Some("cache".to_string()), ..request("alpha") },
            LaunchRequest { mount: Some(dir.path().join("missing")), ..request("alpha") },
        ] {
            assert!(orch.launch(bad).await.is_err());
        }
        assert!(!dir.path().join("alpha").exists());
    }

    #[tokio::test]
    async fn test_start_twice_keeps_pid() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        let (_, pid) = orch.status(&config).unwrap();

        let err = orch.start("alpha").await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Qemu(QEMUError::AlreadyRunning(RunStatus::Running))
        ));
        assert_eq!(orch.status(&config).unwrap().1, pid);
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_then_status_is_stopped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();

        orch.stop("alpha").await.unwrap();
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Stopped, None));
        assert!(!config.pid_file().exists());
        assert!(!config.serial_socket().exists());
        assert!(!config.qmp_socket().exists());

        orch.stop("alpha").await.unwrap();
        let pid = orch.start("alpha").await.unwrap();
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Running, Some(pid)));
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_pid_and_syncs_clock() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        let (_, pid) = orch.status(&config).unwrap();

        assert!(orch.pause("alpha").await.unwrap());
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Paused, pid));
        assert!(orch.resume("alpha").await.unwrap());
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Running, pid));
        assert!(!orch.resume("alpha").await.unwrap());

        let commands = orch.remote().commands.borrow().clone();
        assert_eq!(
            commands,
            vec![(
                "alpha".to_string(),
                "hwclock -s".to_string(),
                GuestCommand::Setup
            )]
        );
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_paused_instance() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();

        orch.pause("alpha").await.unwrap();
        orch.stop("alpha").await.unwrap();
        assert_eq!(orch.status(&config).unwrap().0, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        let (_, before) = orch.status(&config).unwrap();

        let pid = orch.restart("alpha").await.unwrap();
        assert_ne!(Some(pid), before);
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Running, Some(pid)));
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_mount_runs_in_guest() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let share = TempDir::new().unwrap();

        orch.launch(LaunchRequest {
            mount: Some(share.path().to_path_buf()),
            ..request("alpha")
        })
        .await
        .unwrap();

        let commands = orch.remote().commands.borrow().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].1.contains("mount -t 9p"));
        assert!(commands[0].1.contains(&guest_mount_point(share.path())));
        assert_eq!(commands[0].2, GuestCommand::Setup);
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_running_instance() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();

        orch.delete("alpha").await.unwrap();
        assert!(!config.location.exists());
        assert!(matches!(orch.store().load("alpha"), Err(MachineError::NotFound(_))));
        assert!(orch.store().list().unwrap().is_empty());
    }

    #[test]
    fn test_tag_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = crate::machine::config::tests::sample_config(orch.store(), "alpha");
        std::fs::create_dir_all(&config.location).unwrap();
        orch.store().save(&config).unwrap();

        let tagged = orch.tag("alpha", &["web".to_string()], false).unwrap();
        assert_eq!(tagged.tags, config.tags);

        let tagged = orch.tag("alpha", &["db".to_string(), "db".to_string()], false).unwrap();
        assert_eq!(tagged.tags.len(), 3);

        let untagged = orch.tag("alpha", &["absent".to_string()], true).unwrap();
        assert_eq!(untagged.tags, tagged.tags);

        assert!(orch.tag("alpha", &["bad tag".to_string()], false).is_err());
        assert_eq!(orch.store().load("alpha").unwrap().tags, tagged.tags);
    }

    #[tokio::test]
    async fn test_rename_moves_instance() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        orch.launch(request("alpha")).await.unwrap();
        orch.stop("alpha").await.unwrap();

        let renamed = orch.rename("alpha", "beta").await.unwrap();
        assert_eq!(renamed.location, dir.path().join("beta"));
        assert!(matches!(orch.store().load("alpha"), Err(MachineError::NotFound(_))));
        let loaded = orch.store().load("beta").unwrap();
        assert_eq!(loaded.alias, "beta");
        assert_eq!(loaded.location, dir.path().join("beta"));
    }

    #[tokio::test]
    async fn test_rename_collision_leaves_original() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        for name in ["alpha", "beta"] {
            orch.launch(request(name)).await.unwrap();
            orch.stop(name).await.unwrap();
        }

        assert!(orch.rename("alpha", "beta").await.is_err());
        assert!(orch.rename("alpha", "cache").await.is_err());
        assert!(orch.rename("alpha", ".hidden").await.is_err());
        let original = orch.store().load("alpha").unwrap();
        assert_eq!(original.location, dir.path().join("alpha"));
    }

    #[tokio::test]
    async fn test_rename_requires_stopped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        orch.launch(request("alpha")).await.unwrap();

        assert!(matches!(
            orch.rename("alpha", "beta").await,
            Err(LifecycleError::NotStopped { .. })
        ));
        orch.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        orch.launch(request("alpha")).await.unwrap();

        orch.exec("alpha", "uname -a").await.unwrap();
        assert_eq!(
            orch.remote().commands.borrow()[0],
            ("alpha".to_string(), "uname -a".to_string(), GuestCommand::User)
        );
        orch.stop("alpha").await.unwrap();
        assert!(matches!(
            orch.exec("alpha", "uname -a").await,
            Err(LifecycleError::NotRunning(_))
        ));
    }

    #[test]
    fn test_check_edit_restores_invalid_document() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let previous = crate::machine::config::tests::sample_config(orch.store(), "alpha");
        std::fs::create_dir_all(&previous.location).unwrap();
        orch.store().save(&previous).unwrap();

        std::fs::write(previous.config_file(), "alias = [").unwrap();
        assert!(orch.check_edit(&previous).is_err());
        assert_eq!(orch.store().load("alpha").unwrap(), previous);

        let mut edited = previous.clone();
        edited.memory = 4096;
        orch.store().save(&edited).unwrap();
        assert_eq!(orch.check_edit(&previous).unwrap().memory, 4096);
    }

    #[test]
    fn test_plan_uses_sudo_for_unprivileged_user() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let remote = SshRemote::new(&Settings::default());
        let mut config = crate::machine::config::tests::sample_config(&store, "alpha");

        let (target, command) = remote.plan(&config, "hwclock -s", GuestCommand::Setup).unwrap();
        assert_eq!((target.host.as_str(), target.port), ("127.0.0.1", 2222));
        assert_eq!(command, "hwclock -s");

        config.ssh_user = "alpine".to_string();
        let (target, command) = remote.plan(&config, "hwclock -s", GuestCommand::Setup).unwrap();
        assert_eq!(target.user, "alpine");
        assert_eq!(command, "sudo -n sh -c 'hwclock -s'");

        config.root_password = Some("raw::toor".to_string());
        let (target, _) = remote.plan(&config, "hwclock -s", GuestCommand::Setup).unwrap();
        assert_eq!(target.user, "root");

        config.network = NetworkMode::Bridged;
        config.machine_ip.clear();
        assert!(matches!(
            remote.plan(&config, "true", GuestCommand::User),
            Err(LifecycleError::AddressUnknown(_))
        ));
        config.machine_ip = "192.168.64.2".to_string();
        let (target, _) = remote.plan(&config, "true", GuestCommand::User).unwrap();
        assert_eq!((target.host.as_str(), target.port), ("192.168.64.2", 22));
    }

    #[test]
    fn test_user_commands_run_once() {
        let mut settings = Settings::default();
        settings.command_retries = 5;
        let remote = SshRemote::new(&settings);
        assert_eq!(remote.attempts(GuestCommand::User), 1);
        assert_eq!(remote.attempts(GuestCommand::Setup), 5);
    }

    #[tokio::test]
    async fn test_launch_rejects_busy_port_before_spawning() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let request = request("alpha");
        let _held = TcpListener::bind(("0.0.0.0", request.ssh_port)).unwrap();

        let err = orch.launch(request.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Machine(MachineError::PortInUse(port)) if port == request.ssh_port
        ));
        assert!(!dir.path().join("alpha").exists());
        assert_eq!(orch.supervisor.emulator().spawns.get(), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_busy_port_before_spawning() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        orch.stop("alpha").await.unwrap();
        let spawns = orch.supervisor.emulator().spawns.get();
        let _held = TcpListener::bind(("0.0.0.0", config.ssh_port)).unwrap();

        let err = orch.start("alpha").await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Machine(MachineError::PortInUse(port)) if port == config.ssh_port
        ));
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Stopped, None));
        assert_eq!(orch.supervisor.emulator().spawns.get(), spawns);
    }

    #[tokio::test]
    async fn test_failed_restart_leaves_instance_stopped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        orch.supervisor.emulator().fail.set(true);

        assert!(orch.restart("alpha").await.is_err());
        assert_eq!(orch.status(&config).unwrap(), (RunStatus::Stopped, None));
        assert!(!config.pid_file().exists());
        assert!(orch.store().load("alpha").is_ok());
    }

    #[tokio::test]
    async fn test_delete_with_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let config = orch.launch(request("alpha")).await.unwrap();
        orch.stop("alpha").await.unwrap();

        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let pid = exited.id();
        exited.wait().unwrap();
        std::fs::write(config.pid_file(), pid.to_string()).unwrap();

        orch.delete("alpha").await.unwrap();
        assert!(!config.location.exists());
        assert!(matches!(orch.store().load("alpha"), Err(MachineError::NotFound(_))));
    }
}
