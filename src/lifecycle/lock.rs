use crate::lifecycle::orchestrator::LifecycleError;
use crate::machine::config::MachineConfig;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use tracing::{debug, warn};

/// Advisory exclusive lock on an instance directory, released on drop.
///
/// Serialises mutating commands from concurrent invocations on the same instance.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    alias: String,
}

impl InstanceLock {
    /// Fails fast when another invocation holds the lock.
    pub fn acquire(config: &MachineConfig) -> Result<Self, LifecycleError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(config.lock_file())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    LifecycleError::Machine(crate::machine::config::MachineError::NotFound(
                        config.alias.clone(),
                    ))
                }
                _ => LifecycleError::Io(e),
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(alias = %config.alias, "Acquired instance lock");
                Ok(InstanceLock {
                    file,
                    alias: config.alias.clone(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LifecycleError::Busy(config.alias.clone()))
            }
            Err(e) => Err(LifecycleError::Io(e)),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(alias = %self.alias, "Failed to release instance lock: {}", e);
        }
    }
}
