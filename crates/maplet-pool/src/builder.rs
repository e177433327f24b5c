//! Worker builder.
//!
//! Holds the worker program path and the [`WorkerOptions`] every child is
//! spawned from. Config patches go through [`Builder::patch`]: hot pool
//! fields take effect on the spot, the engine sub-block is picked up by
//! children spawned afterwards.

use std::path::{Path, PathBuf};

use maplet_core::Result;
use maplet_core::codec::DEFAULT_MAX_FRAME_SIZE;

use crate::config::{JsonValue, WorkerOptions};
use crate::restore::json_merge;
use crate::worker::{Worker, WorkerLauncher};

/// Builds workers from a program path and shared options.
pub struct Builder {
    program: PathBuf,
    args: Vec<String>,
    opts: WorkerOptions,
}

impl Builder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::from_options(program, WorkerOptions::default())
    }

    pub fn from_options(program: impl Into<PathBuf>, opts: WorkerOptions) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            opts,
        }
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn launcher(&self) -> WorkerLauncher {
        // Leave headroom over the configured chunk size for the frame
        // envelope.
        let max_frame_size =
            DEFAULT_MAX_FRAME_SIZE.max(self.opts.max_chunk_size() + 64 * 1024);
        WorkerLauncher {
            name: self.opts.name.clone(),
            program: self.program.clone(),
            args: self.args.clone(),
            start_timeout: self.opts.process_start_timeout,
            cancel_timeout: self.opts.cancel_timeout,
            max_frame_size,
            engine_config: self.opts.engine.to_string(),
        }
    }

    /// Spawn a single worker with the current options.
    pub async fn start(&self) -> Result<Worker> {
        self.launcher().spawn().await
    }

    /// Apply a json merge-patch to the `worker` section.
    pub fn patch(&mut self, patch: &JsonValue) -> Result<()> {
        if let Some(patch) = patch.get("worker") {
            let mut doc = serde_json::to_value(&self.opts).map_err(|err| {
                maplet_core::Error::InvalidConfig(err.to_string())
            })?;
            json_merge(&mut doc, patch);
            let opts: WorkerOptions = serde_json::from_value(doc)
                .map_err(|err| maplet_core::Error::InvalidConfig(err.to_string()))?;
            opts.validate()?;
            self.opts = opts;
        }
        Ok(())
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.opts
    }

    pub fn options_mut(&mut self) -> &mut WorkerOptions {
        &mut self.opts
    }

    pub fn name(&mut self, value: &str) -> &mut Self {
        self.opts.name = value.to_string();
        self
    }

    pub fn num_processes(&mut self, value: usize) -> Result<&mut Self> {
        self.opts.num_processes = value.try_into()?;
        Ok(self)
    }

    pub fn max_waiting_requests(&mut self, value: usize) -> &mut Self {
        self.opts.max_waiting_requests = value;
        self
    }

    pub fn process_start_timeout(&mut self, value: u64) -> &mut Self {
        self.opts.process_start_timeout = value;
        self
    }

    pub fn cancel_timeout(&mut self, value: u64) -> &mut Self {
        self.opts.cancel_timeout = value;
        self
    }

    pub fn engine_config(&mut self, value: JsonValue) -> &mut Self {
        self.opts.engine = value;
        self
    }
}

/// Default worker program: `maplet-worker` next to the current executable,
/// overridable with `MAPLET_WORKER_EXEC`.
pub fn default_worker_program() -> PathBuf {
    if let Some(path) = std::env::var_os("MAPLET_WORKER_EXEC") {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map(|dir| dir.join("maplet-worker"))
        .unwrap_or_else(|| PathBuf::from("maplet-worker"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_merges_worker_section() {
        let mut builder = Builder::new("/usr/libexec/maplet-worker");
        builder.name("test").num_processes(1).unwrap();

        builder
            .patch(&json!({
                "worker": {
                    "num_processes": 3,
                    "engine": { "max_projects": 25 }
                }
            }))
            .unwrap();

        assert_eq!(builder.options().num_processes(), 3);
        assert_eq!(builder.options().engine["max_projects"], 25);
        // Untouched engine keys survive the merge.
        assert!(builder.options().engine["max_chunk_size"].is_number());
    }

    #[test]
    fn patch_rejects_invalid_values() {
        let mut builder = Builder::new("/usr/libexec/maplet-worker");
        let err = builder
            .patch(&json!({"worker": {"num_processes": 0}}))
            .unwrap_err();
        assert!(matches!(err, maplet_core::Error::InvalidConfig(_)));
    }
}
