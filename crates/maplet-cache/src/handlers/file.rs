//! Local filesystem storage.
//!
//! Projects are json documents with a `.mproj` suffix (`.mpz` for the
//! packed form). Urls without a suffix are probed against the known
//! suffixes, so `/srv/projects/town` finds `/srv/projects/town.mproj`.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use url::Url;

use crate::errors::{CacheError, Result};
use crate::project::Project;
use crate::storage::{ProjectMetadata, SourceRef, StorageHandler};

/// Suffixes recognized as project documents.
pub const PROJECT_SUFFIXES: &[&str] = &["mproj", "mpz"];

#[derive(Debug, Default)]
pub struct FileHandler;

impl FileHandler {
    pub fn from_config(_config: &serde_json::Value) -> Result<Self> {
        Ok(Self)
    }

    /// Probe the path against the project suffixes when none is present.
    ///
    /// Falls back to the primary suffix so that a removed project keeps
    /// resolving to the same canonical uri it was cached under.
    fn check_path(path: &Path) -> PathBuf {
        if path
            .extension()
            .is_some_and(|ext| PROJECT_SUFFIXES.iter().any(|sfx| ext == *sfx))
        {
            return path.to_path_buf();
        }
        for sfx in PROJECT_SUFFIXES {
            let candidate = path.with_extension(sfx);
            if candidate.is_file() {
                return candidate;
            }
        }
        path.with_extension(PROJECT_SUFFIXES[0])
    }

    fn metadata(path: &Path) -> Result<ProjectMetadata> {
        let stat = path
            .metadata()
            .map_err(|_| CacheError::NotFound(path.display().to_string()))?;
        let last_modified = stat
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(ProjectMetadata {
            uri: path.display().to_string(),
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            scheme: "file".to_string(),
            storage: "file".to_string(),
            last_modified,
        })
    }
}

impl StorageHandler for FileHandler {
    fn storage(&self) -> &'static str {
        "file"
    }

    fn resolve(&self, url: &Url) -> Result<SourceRef> {
        let path = PathBuf::from(url.path());
        if !path.is_absolute() {
            return Err(CacheError::NotAllowed(url.to_string()));
        }
        Ok(SourceRef {
            uri: Self::check_path(&path).display().to_string(),
            scheme: "file".to_string(),
        })
    }

    fn stat(&self, source: &SourceRef) -> Result<ProjectMetadata> {
        Self::metadata(Path::new(&source.uri))
    }

    fn open(&self, source: &SourceRef) -> Result<Project> {
        let raw = std::fs::read(&source.uri)
            .map_err(|_| CacheError::NotFound(source.uri.clone()))?;
        Project::from_json(&source.uri, &raw).map_err(|err| CacheError::Unreadable {
            uri: source.uri.clone(),
            reason: err.to_string(),
        })
    }

    fn enumerate(&self, root: &Url) -> Result<Vec<ProjectMetadata>> {
        let path = PathBuf::from(root.path());
        if !path.exists() {
            tracing::warn!("search path root {} does not exist", path.display());
            return Ok(Vec::new());
        }
        if path.is_file() {
            return Ok(vec![Self::metadata(&path)?]);
        }

        let mut found = Vec::new();
        collect(&path, &mut found)?;
        Ok(found)
    }

    fn validate_root(&self, root: &Url) -> Result<()> {
        let path = PathBuf::from(root.path());
        if path.exists() {
            Ok(())
        } else {
            Err(CacheError::RootNotFound(path))
        }
    }
}

fn collect(dir: &Path, found: &mut Vec<ProjectMetadata>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, found)?;
        } else if path
            .extension()
            .is_some_and(|ext| PROJECT_SUFFIXES.iter().any(|sfx| ext == *sfx))
        {
            found.push(FileHandler::metadata(&path)?);
        }
    }
    Ok(())
}
