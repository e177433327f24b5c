//! Pinned-project restore set.
//!
//! The pool keeps the union of uris pinned anywhere as its truth set:
//! every worker spawned or recycled replays the set (and any staged engine
//! config) before it is handed out again, so a freshly respawned child
//! converges to the same cache content as its siblings.

use std::collections::BTreeSet;
use std::io::{self, BufRead};

use crate::worker::Worker;
use maplet_core::Result;
use maplet_core::frames::JsonValue;

/// Cache synchronization event.
#[derive(Debug, Clone)]
pub enum State {
    /// Pin a project; workers pull it on their next sync.
    Pull(String),
    /// Unpin a project.
    Remove(String),
    /// Drop the whole pinned set.
    Clear,
    /// Force a re-pull of the current set on every worker.
    Update,
}

/// The restore set and its revision counter.
///
/// Workers carry the revision they last applied; [`Restore::sync`] is a
/// no-op for up-to-date workers.
#[derive(Debug, Default)]
pub struct Restore {
    pinned: BTreeSet<String>,
    config: Option<JsonValue>,
    revision: u64,
}

impl Restore {
    pub fn with_projects<I>(projects: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            pinned: projects.into_iter().collect(),
            config: None,
            revision: 1,
        }
    }

    /// Uris currently pinned anywhere.
    pub fn pinned(&self) -> impl Iterator<Item = &str> {
        self.pinned.iter().map(String::as_str)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply a cache synchronization event.
    pub fn update_cache(&mut self, state: State) {
        match state {
            State::Pull(uri) => {
                self.pinned.insert(uri);
            }
            State::Remove(uri) => {
                self.pinned.remove(&uri);
            }
            State::Clear => self.pinned.clear(),
            State::Update => {}
        }
        self.revision += 1;
    }

    /// Stage an engine config patch, applied to workers on their next sync.
    pub fn update_config(&mut self, config: JsonValue) {
        self.config = Some(match self.config.take() {
            Some(mut current) => {
                json_merge(&mut current, &config);
                current
            }
            None => config,
        });
        self.revision += 1;
    }

    /// Bring one worker up to date with the truth set.
    pub async fn sync(&self, worker: &mut Worker) -> Result<()> {
        if worker.last_update == self.revision {
            return Ok(());
        }
        if let Some(config) = &self.config {
            worker.put_config(config).await?;
        }
        for uri in &self.pinned {
            let info = worker.checkout_project(uri, true).await?;
            tracing::trace!(
                "restore: pulled '{uri}' into {} (status {:?})",
                worker.cache_id(),
                info.status,
            );
        }
        worker.last_update = self.revision;
        Ok(())
    }
}

/// Merge `patch` into `doc`, object fields recursively, everything else by
/// replacement.
pub(crate) fn json_merge(doc: &mut JsonValue, patch: &JsonValue) {
    match (doc, patch) {
        (JsonValue::Object(doc), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                json_merge(doc.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

/// Load a restore list.
///
/// `spec` is `file:<path>` or `cmd:<command>`; a bare value is read as a
/// file path. The format is newline-delimited uris, `#` starts a comment.
pub fn load_restore_list(spec: &str) -> io::Result<Vec<String>> {
    let content = match spec.split_once(':') {
        Some(("file", path)) => std::fs::read_to_string(path)?,
        Some(("cmd", command)) => {
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()?;
            if !output.status.success() {
                return Err(io::Error::other(format!(
                    "restore command exited with {}",
                    output.status
                )));
            }
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        _ => std::fs::read_to_string(spec)?,
    };

    Ok(content
        .as_bytes()
        .lines()
        .map_while(io::Result::ok)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_maintain_the_union() {
        let mut restore = Restore::with_projects(["a".to_string()]);
        restore.update_cache(State::Pull("b".to_string()));
        restore.update_cache(State::Pull("a".to_string()));
        assert_eq!(restore.pinned().collect::<Vec<_>>(), ["a", "b"]);

        restore.update_cache(State::Remove("a".to_string()));
        assert_eq!(restore.pinned().collect::<Vec<_>>(), ["b"]);

        restore.update_cache(State::Clear);
        assert_eq!(restore.pinned().count(), 0);
    }

    #[test]
    fn every_event_bumps_the_revision() {
        let mut restore = Restore::default();
        let r0 = restore.revision();
        restore.update_cache(State::Update);
        restore.update_config(json!({"max_projects": 10}));
        assert_eq!(restore.revision(), r0 + 2);
    }

    #[test]
    fn config_patches_accumulate() {
        let mut restore = Restore::default();
        restore.update_config(json!({"max_projects": 10, "nested": {"a": 1}}));
        restore.update_config(json!({"nested": {"b": 2}}));
        assert_eq!(
            restore.config,
            Some(json!({"max_projects": 10, "nested": {"a": 1, "b": 2}}))
        );
    }

    #[test]
    fn restore_list_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore.list");
        std::fs::write(&path, "# pinned projects\n/france/parcels\n\n  /spain/madrid\n").unwrap();

        let spec = format!("file:{}", path.display());
        assert_eq!(
            load_restore_list(&spec).unwrap(),
            ["/france/parcels", "/spain/madrid"]
        );

        let listed = load_restore_list(&format!("cmd:cat {}", path.display())).unwrap();
        assert_eq!(listed, ["/france/parcels", "/spain/madrid"]);
    }
}
