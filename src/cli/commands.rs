use crate::cli::render::{ListRow, info_json, info_text, list_table};
use crate::cli::{
    Commands, ExecArgs, ImportArgs, InfoArgs, LaunchArgs, PublishArgs, RenameArgs, SshArgs,
    TagArgs, Targets,
};
use crate::config::config::{Settings, default_root};
use crate::image::archive::{
    Decryption, Encryption, ImportOptions, PublishOptions, import, is_encrypted, publish,
};
use crate::kvm::qemu::Qemu;
use crate::kvm::terminal::read_secret;
use crate::lifecycle::batch::{BatchError, expand_targets, run_batch};
use crate::lifecycle::orchestrator::{LaunchRequest, Orchestrator, SshRemote};
use crate::machine::config::{Arch, NetworkMode};
use crate::machine::names::generate_passphrase;
use anyhow::{Context, Result, bail};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FALLBACK_EDITORS: [&str; 2] = ["vim", "nano"];
const GENERATED_PASSPHRASE_WORDS: usize = 10;

type Orch = Orchestrator<Qemu, SshRemote>;

fn orchestrator(cancel: CancellationToken) -> Result<Orch> {
    let settings = Settings::load(default_root()?);
    let emulator = Qemu::new(settings.firmware_name.clone());
    let remote = SshRemote::new(&settings);
    Ok(Orchestrator::new(settings, emulator, remote, cancel))
}

/// Executes one parsed command.
pub async fn run(command: Commands, cancel: CancellationToken) -> Result<()> {
    if let Commands::Completion(args) = command {
        use clap::CommandFactory;
        let mut cmd = crate::cli::Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "pinevm", &mut std::io::stdout());
        return Ok(());
    }

    let orch = orchestrator(cancel)?;
    match command {
        Commands::Launch(args) => launch(&orch, args).await,
        Commands::Start(targets) => start(&orch, targets).await,
        Commands::Stop(targets) => stop(&orch, targets).await,
        Commands::Pause(targets) => pause(&orch, targets).await,
        Commands::Resume(targets) => resume(&orch, targets).await,
        Commands::Restart(targets) => restart(&orch, targets).await,
        Commands::Delete(targets) => delete(&orch, targets).await,
        Commands::List => list(&orch),
        Commands::Info(args) => show_info(&orch, args),
        Commands::Exec(args) => exec(&orch, args).await,
        Commands::Ssh(args) => ssh(&orch, args).await,
        Commands::Edit(targets) => edit(&orch, targets).await,
        Commands::Rename(args) => rename(&orch, args).await,
        Commands::Tag(args) => tag(&orch, args),
        Commands::Publish(args) => publish_all(&orch, args).await,
        Commands::Import(args) => import_archive(&orch, args).await,
        Commands::Completion(_) => Ok(()),
    }
}

async fn launch(orch: &Orch, args: LaunchArgs) -> Result<()> {
    let arch = match args.arch {
        Some(arch) => arch,
        None => Arch::host().context("unsupported host architecture, pass --arch")?,
    };
    let request = LaunchRequest {
        name: args.name,
        image: args.image,
        arch,
        cpu: args.cpu,
        memory: args.memory,
        disk: args.disk,
        mount: args.mount,
        ssh_port: args.ssh_port,
        port: args.port,
        network: if args.shared {
            NetworkMode::Bridged
        } else {
            NetworkMode::User
        },
        tags: args.tags,
    };

    let config = orch.launch(request).await?;
    println!("Launched {}", config.alias);
    Ok(())
}

async fn start(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("starting", &targets, |name| async move {
        let pid = orch.start(name).await?;
        info!(alias = %name, pid, "Started");
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

async fn stop(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("stopping", &targets, |name| async move {
        orch.stop(name).await?;
        info!(alias = %name, "Stopped");
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

async fn pause(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("pausing", &targets, |name| async move {
        if orch.pause(name).await? {
            info!(alias = %name, "Paused");
        } else {
            info!(alias = %name, "Already paused");
        }
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

async fn resume(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("resuming", &targets, |name| async move {
        if orch.resume(name).await? {
            info!(alias = %name, "Resumed");
        } else {
            info!(alias = %name, "Not paused");
        }
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

async fn restart(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("restarting", &targets, |name| async move {
        let pid = orch.restart(name).await?;
        info!(alias = %name, pid, "Restarted");
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

async fn delete(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    run_batch("deleting", &targets, |name| async move {
        orch.delete(name).await?;
        info!(alias = %name, "Deleted");
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

fn list(orch: &Orch) -> Result<()> {
    let store = orch.store();
    let mut rows = Vec::new();
    for name in store.list()? {
        let loaded = store.load(&name).map_err(anyhow::Error::from).and_then(|config| {
            let (status, pid) = orch.status(&config)?;
            Ok(ListRow::new(&config, status, pid))
        });
        match loaded {
            Ok(row) => rows.push(row),
            Err(e) => {
                warn!(alias = %name, "{:#}", e);
                rows.push(ListRow::broken(&name));
            }
        }
    }
    print!("{}", list_table(&rows));
    Ok(())
}

fn show_info(orch: &Orch, args: InfoArgs) -> Result<()> {
    let targets = expand_targets(orch.store(), &args.instances)?;
    let mut documents = Vec::new();
    let mut failures = Vec::new();

    for name in &targets {
        let described = orch
            .store()
            .load(name)
            .map_err(anyhow::Error::from)
            .and_then(|config| {
                let (status, pid) = orch.status(&config)?;
                Ok((config, status, pid))
            });
        match described {
            Ok((config, status, pid)) if args.json => documents.push(info_json(&config, status, pid)?),
            Ok((config, status, pid)) => println!("{}", info_text(&config, status, pid)),
            Err(e) => {
                tracing::error!(alias = %name, "failed: {:#}", e);
                failures.push((name.clone(), e));
            }
        }
    }

    if args.json {
        let output = if documents.len() == 1 {
            serde_json::to_string_pretty(&documents[0])?
        } else {
            serde_json::to_string_pretty(&documents)?
        };
        println!("{}", output);
    }
    batch_result("describing", failures)
}

async fn exec(orch: &Orch, args: ExecArgs) -> Result<()> {
    let output = orch.exec(&args.instance, &args.command.join(" ")).await?;
    print!("{}", output);
    Ok(())
}

async fn ssh(orch: &Orch, args: SshArgs) -> Result<()> {
    let command = (!args.command.is_empty()).then(|| args.command.join(" "));
    orch.shell(&args.instance, command.as_deref()).await?;
    Ok(())
}

/// `$EDITOR`, or the first of the fallback editors found on `$PATH`.
fn editor() -> Result<String> {
    if let Ok(editor) = std::env::var("EDITOR") {
        if !editor.trim().is_empty() {
            return Ok(editor);
        }
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    FALLBACK_EDITORS
        .iter()
        .find(|candidate| std::env::split_paths(&path).any(|dir| dir.join(candidate).is_file()))
        .map(|editor| editor.to_string())
        .context("no editor found, set $EDITOR")
}

async fn edit(orch: &Orch, targets: Targets) -> Result<()> {
    let targets = expand_targets(orch.store(), &targets.instances)?;
    let editor = editor()?;
    let mut failures = Vec::new();

    // one at a time: the editor owns the terminal
    for name in &targets {
        if let Err(e) = edit_one(orch, &editor, name).await {
            tracing::error!(alias = %name, "failed: {:#}", e);
            failures.push((name.clone(), e));
        }
    }
    batch_result("editing", failures)
}

async fn edit_one(orch: &Orch, editor: &str, name: &str) -> Result<()> {
    let previous = orch.store().load(name)?;
    let mut parts = editor.split_whitespace();
    let program = parts.next().context("empty $EDITOR")?;
    let status = Command::new(program)
        .args(parts)
        .arg(previous.config_file())
        .status()
        .await
        .with_context(|| format!("Failed to run editor {}", editor))?;
    if !status.success() {
        bail!("editor exited with {}", status);
    }
    orch.check_edit(&previous)?;
    Ok(())
}

async fn rename(orch: &Orch, args: RenameArgs) -> Result<()> {
    orch.rename(&args.instance, &args.new_name).await?;
    println!("Renamed {} to {}", args.instance, args.new_name);
    Ok(())
}

fn tag(orch: &Orch, args: TagArgs) -> Result<()> {
    let config = orch.tag(&args.instance, &args.tags, args.remove)?;
    let tags: Vec<&str> = config.tags.iter().map(String::as_str).collect();
    println!("{} tags: {}", config.alias, tags.join(", "));
    Ok(())
}

fn publish_encryption(args: &PublishArgs) -> Result<Encryption> {
    if args.encrypt {
        let passphrase = read_secret("Passphrase (leave empty to generate one): ")?;
        if passphrase.expose_secret().is_empty() {
            let generated = generate_passphrase(GENERATED_PASSPHRASE_WORDS);
            eprintln!("Using autogenerated passphrase: {}", generated);
            return Ok(Encryption::Passphrase(SecretString::from(generated)));
        }
        let confirmation = read_secret("Confirm passphrase: ")?;
        if confirmation.expose_secret() != passphrase.expose_secret() {
            bail!("passphrases do not match");
        }
        return Ok(Encryption::Passphrase(passphrase));
    }
    if let Some(passphrase) = &args.passphrase {
        return Ok(Encryption::Passphrase(SecretString::from(passphrase.clone())));
    }
    if let Some(key) = &args.key {
        return Ok(Encryption::Recipient(key.clone()));
    }
    if let Some(path) = &args.ssh_key {
        return Ok(Encryption::SshKeyFile(path.clone()));
    }
    Ok(Encryption::None)
}

async fn publish_all(orch: &Orch, args: PublishArgs) -> Result<()> {
    let targets = expand_targets(orch.store(), &args.instances)?;
    let options = PublishOptions {
        encryption: publish_encryption(&args)?,
        output_dir: args.output_dir.clone(),
    };
    let options = &options;

    run_batch("publishing", &targets, |name| async move {
        let path = publish(orch, name, options).await?;
        println!("Published {} to {}", name, path.display());
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    Ok(())
}

fn import_decryption(archive: &str, identity: Option<PathBuf>) -> Result<Decryption> {
    match identity {
        Some(path) => Ok(Decryption::IdentityFile(path)),
        None if is_encrypted(archive) => Ok(Decryption::Passphrase(read_secret("Passphrase: ")?)),
        None => Ok(Decryption::None),
    }
}

async fn import_archive(orch: &Orch, args: ImportArgs) -> Result<()> {
    let decryption = import_decryption(&args.archive, args.identity)?;
    let options = ImportOptions { name: args.name };
    let config = import(orch, &args.archive, decryption, &options).await?;
    println!(
        "Imported {} as {}",
        Path::new(&args.archive)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| args.archive.clone()),
        config.alias
    );
    Ok(())
}

fn batch_result(action: &str, failures: Vec<(String, anyhow::Error)>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BatchError {
            action: action.to_string(),
            failures,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_decryption_choice() {
        assert!(matches!(
            import_decryption("alpha.tar.gz", None).unwrap(),
            Decryption::None
        ));
        assert!(matches!(
            import_decryption("alpha.tar.gz.age", Some(PathBuf::from("key.txt"))).unwrap(),
            Decryption::IdentityFile(p) if p == Path::new("key.txt")
        ));
    }

    #[test]
    fn test_batch_result() {
        assert!(batch_result("editing", Vec::new()).is_ok());
        let err = batch_result("editing", vec![("a".to_string(), anyhow::anyhow!("bad"))])
            .unwrap_err();
        assert_eq!(err.to_string(), "error editing instance(s): a");
    }

    #[test]
    fn test_publish_encryption_from_flags() {
        let args = PublishArgs {
            instances: vec!["alpha".to_string()],
            encrypt: false,
            passphrase: None,
            key: Some("age1example".to_string()),
            ssh_key: None,
            output_dir: PathBuf::from("."),
        };
        assert!(matches!(
            publish_encryption(&args).unwrap(),
            Encryption::Recipient(k) if k == "age1example"
        ));
    }
}
