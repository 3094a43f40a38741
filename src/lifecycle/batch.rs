//! Commands over several instances at once.

use crate::machine::config::{ConfigStore, MachineError};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tracing::{error, warn};

/// Prefix selecting every instance carrying a tag, e.g. `+web`.
pub const TAG_PREFIX: char = '+';

/// Per-target failures of a batch command.
#[derive(Debug)]
pub struct BatchError {
    pub action: String,
    pub failures: Vec<(String, anyhow::Error)>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.failures.iter().map(|(name, _)| name.as_str()).collect();
        write!(f, "error {} instance(s): {}", self.action, names.join(", "))
    }
}

impl std::error::Error for BatchError {}

/// Expands `+tag` arguments into the instances carrying that tag and drops repeats,
/// keeping first-seen order.
pub fn expand_targets(store: &ConfigStore, args: &[String]) -> Result<Vec<String>, MachineError> {
    let mut tagged: Option<BTreeMap<String, Vec<String>>> = None;
    let mut targets: Vec<String> = Vec::new();

    for arg in args {
        let expanded = match arg.strip_prefix(TAG_PREFIX) {
            Some(tag) => {
                if tagged.is_none() {
                    tagged = Some(tag_index(store)?);
                }
                tagged
                    .as_ref()
                    .and_then(|index| index.get(tag))
                    .cloned()
                    .ok_or_else(|| {
                        MachineError::InvalidParameter(format!("no instance is tagged {}", tag))
                    })?
            }
            None => vec![arg.clone()],
        };

        for name in expanded {
            if !targets.contains(&name) {
                targets.push(name);
            }
        }
    }

    Ok(targets)
}

fn tag_index(store: &ConfigStore) -> Result<BTreeMap<String, Vec<String>>, MachineError> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in store.list()? {
        match store.load(&name) {
            Ok(config) => {
                for tag in config.tags {
                    index.entry(tag).or_default().push(name.clone());
                }
            }
            Err(e) => warn!(alias = %name, "Skipping while expanding tags: {}", e),
        }
    }
    Ok(index)
}

/// Runs `op` for every target concurrently, reporting each failure and collecting them all.
pub async fn run_batch<'a, F, Fut, T>(
    action: &str,
    targets: &'a [String],
    op: F,
) -> Result<Vec<(String, T)>, BatchError>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let results = join_all(targets.iter().map(|target| op(target))).await;

    let mut done = Vec::new();
    let mut failures = Vec::new();
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(value) => done.push((target.clone(), value)),
            Err(e) => {
                error!(alias = %target, "failed: {:#}", e);
                failures.push((target.clone(), e));
            }
        }
    }

    if failures.is_empty() {
        Ok(done)
    } else {
        Err(BatchError {
            action: action.to_string(),
            failures,
        })
    }
}
