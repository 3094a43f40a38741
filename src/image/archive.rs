//! Instance archives: publish an instance directory as `<alias>.tar.gz` (optionally age
//! encrypted) and import such archives as new instances.

use crate::image::download::{download_file, http_client, is_url};
use crate::kvm::qemu::{Emulator, RunStatus};
use crate::lifecycle::lock::InstanceLock;
use crate::lifecycle::orchestrator::{GuestCommand, Orchestrator, RemoteShell};
use crate::machine::config::{CONFIG_FILE, MachineConfig, NetworkMode, RUNTIME_FILES};
use crate::machine::names::generate_mac;
use crate::machine::validate::validate_name;
use anyhow::{Context, Result, anyhow, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use secrecy::{ExposeSecret, SecretString};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const ARCHIVE_EXTENSION: &str = ".tar.gz";
pub const ENCRYPTED_EXTENSION: &str = ".age";

/// How a published archive is encrypted.
pub enum Encryption {
    None,
    Passphrase(SecretString),
    /// `age1...` or `ssh-...` public key.
    Recipient(String),
    /// File holding an ssh public key.
    SshKeyFile(PathBuf),
}

/// How an encrypted archive is opened.
pub enum Decryption {
    None,
    Passphrase(SecretString),
    /// age identity file or unencrypted ssh private key.
    IdentityFile(PathBuf),
}

pub struct PublishOptions {
    pub encryption: Encryption,
    pub output_dir: PathBuf,
}

#[derive(Default)]
pub struct ImportOptions {
    pub name: Option<String>,
}

/// Archives an instance. A running instance is synced and paused for the copy and resumed after,
/// whether or not archiving succeeds.
pub async fn publish<E: Emulator, R: RemoteShell>(
    orch: &Orchestrator<E, R>,
    alias: &str,
    options: &PublishOptions,
) -> Result<PathBuf> {
    let config = orch.store().load(alias)?;
    let _lock = InstanceLock::acquire(&config)?;

    let was_running = orch.status(&config)?.0 == RunStatus::Running;
    if was_running {
        if let Err(e) = orch
            .remote()
            .run(&config, "sync", GuestCommand::Setup, orch.cancel_token())
            .await
        {
            warn!(alias, "Failed to flush guest filesystems: {}", e);
        }
        orch.pause_instance(&config).await?;
    }

    let result = write_archive(&config, options).await;

    if was_running {
        if let Err(e) = orch.resume_instance(&config).await {
            error!(alias, "Failed to resume after publishing: {}", e);
            if result.is_ok() {
                return Err(e.into());
            }
        }
    }

    let target = result?;
    info!(alias, "Published {}", target.display());
    Ok(target)
}

async fn write_archive(config: &MachineConfig, options: &PublishOptions) -> Result<PathBuf> {
    let files = archive_members(&config.location)?;
    let encrypted = !matches!(options.encryption, Encryption::None);
    let mut file_name = format!("{}{}", config.alias, ARCHIVE_EXTENSION);
    if encrypted {
        file_name.push_str(ENCRYPTED_EXTENSION);
    }

    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!("Failed to create directory: {}", options.output_dir.display())
    })?;
    let target = options.output_dir.join(&file_name);
    let partial = options.output_dir.join(format!(".{}.tmp", file_name));

    let encryptor = encryptor(&options.encryption)?;
    let partial_path = partial.clone();
    let written = tokio::task::spawn_blocking(move || -> Result<()> {
        let file = BufWriter::new(
            File::create(&partial_path)
                .with_context(|| format!("Failed to create {}", partial_path.display()))?,
        );
        let file = match encryptor {
            Some(encryptor) => {
                let writer = encryptor
                    .wrap_output(file)
                    .context("Failed to start encryption")?;
                tar_gz(&files, writer)?
                    .finish()
                    .context("Failed to finish encryption")?
            }
            None => tar_gz(&files, file)?,
        };
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })
    .await?;

    if let Err(e) = written.and_then(|()| {
        fs::rename(&partial, &target)
            .with_context(|| format!("Failed to move archive to {}", target.display()))
    }) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    Ok(target)
}

/// Files of the instance directory worth archiving, without runtime artifacts.
fn archive_members(location: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(location)
        .with_context(|| format!("Failed to read {}", location.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if RUNTIME_FILES.contains(&name.as_ref()) || name.ends_with(".tmp") {
            continue;
        }
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn tar_gz<W: Write>(files: &[PathBuf], writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| anyhow!("invalid archive member {}", file.display()))?;
        debug!("Adding {}", file.display());
        builder
            .append_path_with_name(file, name)
            .with_context(|| format!("Failed to add {} to archive", file.display()))?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn encryptor(encryption: &Encryption) -> Result<Option<age::Encryptor>> {
    let recipient: Box<dyn age::Recipient + Send> = match encryption {
        Encryption::None => return Ok(None),
        Encryption::Passphrase(passphrase) => {
            return Ok(Some(age::Encryptor::with_user_passphrase(
                SecretString::from(passphrase.expose_secret().to_string()),
            )));
        }
        Encryption::Recipient(key) => parse_recipient(key.trim())?,
        Encryption::SshKeyFile(path) => {
            let key = fs::read_to_string(path)
                .with_context(|| format!("Failed to read public key {}", path.display()))?;
            parse_recipient(key.trim())?
        }
    };

    let encryptor = age::Encryptor::with_recipients(std::iter::once(
        recipient.as_ref() as &dyn age::Recipient
    ))
    .map_err(|e| anyhow!("Failed to set up encryption: {}", e))?;
    Ok(Some(encryptor))
}

fn parse_recipient(key: &str) -> Result<Box<dyn age::Recipient + Send>> {
    if key.starts_with("ssh-") {
        let recipient: age::ssh::Recipient = key
            .parse()
            .map_err(|e| anyhow!("invalid ssh public key: {:?}", e))?;
        Ok(Box::new(recipient))
    } else {
        let recipient: age::x25519::Recipient = key
            .parse()
            .map_err(|e| anyhow!("invalid age recipient: {}", e))?;
        Ok(Box::new(recipient))
    }
}

/// True if `source` names an age-encrypted archive.
pub fn is_encrypted(source: &str) -> bool {
    source.ends_with(ENCRYPTED_EXTENSION)
}

/// Instance name an archive imports as by default: its file name without extensions.
pub fn archive_stem(source: &str) -> String {
    let name = source.rsplit('/').next().unwrap_or(source);
    let name = name.strip_suffix(ENCRYPTED_EXTENSION).unwrap_or(name);
    let name = name
        .strip_suffix(ARCHIVE_EXTENSION)
        .or_else(|| name.strip_suffix(".tgz"))
        .unwrap_or(name);
    name.to_string()
}

/// Registers an archive as a new instance. `source` is a path or an http(s) URL.
pub async fn import<E: Emulator, R: RemoteShell>(
    orch: &Orchestrator<E, R>,
    source: &str,
    decryption: Decryption,
    options: &ImportOptions,
) -> Result<MachineConfig> {
    let store = orch.store();
    let requested = options.name.clone().unwrap_or_else(|| archive_stem(source));
    validate_name(&requested)?;
    let taken = store.list()?;
    let alias = free_name(&requested, |name| {
        taken.iter().any(|t| t == name) || store.location(name).exists()
    });
    if alias != requested {
        info!("{} is taken, importing as {}", requested, alias);
    }

    fs::create_dir_all(store.root())?;
    let (archive, downloaded) = if is_url(source) {
        let file_name = source.rsplit('/').next().unwrap_or("archive");
        let target = store.root().join(format!(".download-{}", file_name));
        let _ = fs::remove_file(&target);
        let client = http_client(orch.settings().proxy.as_deref())?;
        download_file(&client, source, &target)
            .await
            .map_err(|e| anyhow!("Failed to download {}: {}", source, e))?;
        (target, true)
    } else {
        (PathBuf::from(source), false)
    };

    let staging = store.root().join(format!(".{}.partial", alias));
    let result = unpack_and_register(orch, &archive, is_encrypted(source), decryption, &staging, &alias).await;

    if downloaded {
        let _ = fs::remove_file(&archive);
    }
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }

    let config = result?;
    info!(alias = %config.alias, "Imported {}", source);
    Ok(config)
}

async fn unpack_and_register<E: Emulator, R: RemoteShell>(
    orch: &Orchestrator<E, R>,
    archive: &Path,
    encrypted: bool,
    decryption: Decryption,
    staging: &Path,
    alias: &str,
) -> Result<MachineConfig> {
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)?;

    let archive_path = archive.to_path_buf();
    let staging_path = staging.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&archive_path)
            .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
        let reader: Box<dyn Read> = if encrypted {
            decrypting_reader(file, &decryption)?
        } else {
            Box::new(BufReader::new(file))
        };
        unpack(reader, &staging_path)
    })
    .await??;

    let document = staging.join(CONFIG_FILE);
    let content = fs::read_to_string(&document)
        .with_context(|| format!("archive has no {}", CONFIG_FILE))?;
    let mut config: MachineConfig =
        toml::from_str(&content).with_context(|| format!("malformed {} in archive", CONFIG_FILE))?;

    let store = orch.store();
    let macs: Vec<String> = store
        .list()?
        .iter()
        .filter_map(|name| store.load(name).ok())
        .map(|existing| existing.mac_address.to_lowercase())
        .collect();
    if macs.contains(&config.mac_address.to_lowercase()) {
        debug!("MAC address {} is in use, generating a new one", config.mac_address);
        config.mac_address = generate_mac();
    }
    if config.network == NetworkMode::Bridged {
        config.machine_ip.clear();
    }
    config.alias = alias.to_string();
    config.location = store.location(alias);

    fs::rename(staging, &config.location).with_context(|| {
        format!("Failed to move instance into {}", config.location.display())
    })?;
    if let Err(e) = store.save(&config) {
        let _ = fs::remove_dir_all(&config.location);
        return Err(e.into());
    }
    Ok(config)
}

fn decrypting_reader(file: File, decryption: &Decryption) -> Result<Box<dyn Read>> {
    let decryptor =
        age::Decryptor::new(BufReader::new(file)).context("Failed to read encrypted archive")?;

    let reader = match decryption {
        Decryption::None => bail!("archive is encrypted, a passphrase or identity is required"),
        Decryption::Passphrase(passphrase) => {
            let identity = age::scrypt::Identity::new(SecretString::from(
                passphrase.expose_secret().to_string(),
            ));
            decryptor
                .decrypt(std::iter::once(&identity as &dyn age::Identity))
                .context("Failed to decrypt archive")?
        }
        Decryption::IdentityFile(path) => {
            let identities = load_identities(path)?;
            decryptor
                .decrypt(identities.iter().map(|identity| identity.as_ref()))
                .context("Failed to decrypt archive")?
        }
    };
    Ok(Box::new(reader))
}

fn load_identities(path: &Path) -> Result<Vec<Box<dyn age::Identity>>> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read identity {}", path.display()))?;

    if let Ok(file) = age::IdentityFile::from_buffer(&content[..]) {
        let identities: Vec<Box<dyn age::Identity>> = file
            .into_identities()
            .map_err(|e| anyhow!("invalid identity file {}: {}", path.display(), e))?
            .into_iter()
            .map(|identity| identity as Box<dyn age::Identity>)
            .collect();
        if !identities.is_empty() {
            return Ok(identities);
        }
    }

    let identity = age::ssh::Identity::from_buffer(&content[..], Some(path.display().to_string()))
        .with_context(|| format!("{} is neither an age nor an ssh identity", path.display()))?;
    Ok(vec![Box::new(identity) as Box<dyn age::Identity>])
}

/// Unpacks a gzip'd tar, refusing absolute paths and parent-directory components.
fn unpack(reader: impl Read, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("refusing archive entry {}", path.display());
        }
        entry
            .unpack_in(target)
            .with_context(|| format!("Failed to unpack {}", path.display()))?;
    }
    Ok(())
}

/// `base`, or `base-1`, `base-2`, ... whichever is not `taken`.
fn free_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}-{}", base, n))
        .find(|name| !taken(name))
        .unwrap_or_else(|| base.to_string())
}
