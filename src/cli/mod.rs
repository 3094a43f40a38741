//! Command-line surface.

use crate::machine::config::Arch;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

pub mod commands;
pub mod render;

/// Create, run and connect to lightweight QEMU virtual machines
#[derive(Parser)]
#[command(name = "pinevm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and start a new instance
    Launch(LaunchArgs),

    /// Start instances
    Start(Targets),

    /// Stop instances
    Stop(Targets),

    /// Suspend instances
    Pause(Targets),

    /// Resume suspended instances
    Resume(Targets),

    /// Stop and start instances
    Restart(Targets),

    /// Delete instances and their disks
    #[command(visible_alias = "rm")]
    Delete(Targets),

    /// List instances
    #[command(visible_alias = "ls")]
    List,

    /// Show the configuration of instances
    Info(InfoArgs),

    /// Run a command inside an instance
    Exec(ExecArgs),

    /// Open a shell on an instance
    #[command(visible_alias = "shell")]
    Ssh(SshArgs),

    /// Edit instance configurations in $EDITOR
    #[command(visible_aliases = ["conf", "config", "configure"])]
    Edit(Targets),

    /// Rename a stopped instance
    #[command(visible_aliases = ["mv", "move"])]
    Rename(RenameArgs),

    /// Add or remove instance tags
    Tag(TagArgs),

    /// Package instances as archives
    Publish(PublishArgs),

    /// Register an instance from an archive
    Import(ImportArgs),

    /// Generate a shell completion script
    Completion(CompletionArgs),
}

/// Instance names; `+tag` selects every instance carrying the tag.
#[derive(Args)]
pub struct Targets {
    #[arg(required = true, value_name = "INSTANCE")]
    pub instances: Vec<String>,
}

#[derive(Args)]
pub struct LaunchArgs {
    /// Image to launch
    #[arg(short, long, default_value = "alpine_3.16.0")]
    pub image: String,

    /// Machine architecture, defaults to the host's
    #[arg(short, long)]
    pub arch: Option<Arch>,

    /// Number of CPUs
    #[arg(short, long, default_value_t = 4)]
    pub cpu: u32,

    /// Memory in MB
    #[arg(short, long, default_value_t = 2048)]
    pub memory: u32,

    /// Disk size with a K, M or G suffix
    #[arg(short, long, default_value = "10G")]
    pub disk: String,

    /// Host directory to share with the guest
    #[arg(long)]
    pub mount: Option<PathBuf>,

    /// Host port forwarded to the guest's SSH port
    #[arg(short, long = "ssh", default_value_t = 22)]
    pub ssh_port: u16,

    /// Forwarded ports, e.g. `8080,53u,2222:22`
    #[arg(short, long, default_value = "")]
    pub port: String,

    /// Instance name, generated when omitted
    #[arg(short, long)]
    pub name: Option<String>,

    /// Attach to the host network instead of forwarding ports
    #[arg(long)]
    pub shared: bool,

    /// Tags for the new instance
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args)]
pub struct InfoArgs {
    #[arg(required = true, value_name = "INSTANCE")]
    pub instances: Vec<String>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ExecArgs {
    pub instance: String,

    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct SshArgs {
    pub instance: String,

    /// Command to run on a terminal instead of the login shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct RenameArgs {
    pub instance: String,
    pub new_name: String,
}

#[derive(Args)]
pub struct TagArgs {
    /// Remove the tags instead of adding them
    #[arg(short, long)]
    pub remove: bool,

    pub instance: String,

    #[arg(required = true)]
    pub tags: Vec<String>,
}

#[derive(Args)]
pub struct PublishArgs {
    #[arg(required = true, value_name = "INSTANCE")]
    pub instances: Vec<String>,

    /// Encrypt with a passphrase read from the terminal
    #[arg(short, long, conflicts_with_all = ["passphrase", "key", "ssh_key"])]
    pub encrypt: bool,

    /// Encrypt with this passphrase
    #[arg(short, long, conflicts_with_all = ["key", "ssh_key"])]
    pub passphrase: Option<String>,

    /// Encrypt to an age or ssh public key
    #[arg(short, long, conflicts_with = "ssh_key")]
    pub key: Option<String>,

    /// Encrypt to the ssh public key in this file
    #[arg(short = 's', long = "ssh-key")]
    pub ssh_key: Option<PathBuf>,

    /// Directory to write archives to
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

#[derive(Args)]
pub struct ImportArgs {
    /// Archive path or http(s) URL
    pub archive: String,

    /// Decrypt with this age identity or ssh private key
    #[arg(short = 's', long = "identity")]
    pub identity: Option<PathBuf>,

    /// Name for the imported instance
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct CompletionArgs {
    pub shell: Shell,
}
