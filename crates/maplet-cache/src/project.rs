//! Project documents.
//!
//! A maplet project is a json document (`.mproj`, or `.mpz` for the packed
//! form) describing the layer tree served by the rendering engine. The
//! cache holds projects as opaque values; nothing outside the child ever
//! sees layer internals, only the metadata records derived here.

use serde::{Deserialize, Serialize};

/// Layer declaration inside a project document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDoc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub crs: String,
    /// Geometry kind; absent for non-spatial layers (tables, joins).
    #[serde(default)]
    pub geometry: Option<String>,
    /// Set by authoring tools when the layer source is known broken.
    #[serde(default)]
    pub broken: bool,
}

impl LayerDoc {
    pub fn is_valid(&self) -> bool {
        !self.broken && !self.source.is_empty()
    }

    pub fn is_spatial(&self) -> bool {
        self.geometry.is_some()
    }
}

/// Parsed project document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub title: String,
    #[serde(default)]
    pub crs: String,
    /// Version of the authoring tool that saved the document.
    #[serde(default)]
    pub saved_version: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerDoc>,
}

/// A loaded project, owned by the child's cache.
#[derive(Debug, Clone)]
pub struct Project {
    pub doc: ProjectDoc,
    /// Storage-level name of the document (path for file storage).
    pub filename: String,
}

impl Project {
    pub fn from_json(filename: impl Into<String>, raw: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            doc: serde_json::from_slice(raw)?,
            filename: filename.into(),
        })
    }

    pub fn has_bad_layers(&self) -> bool {
        self.doc.layers.iter().any(|l| !l.is_valid())
    }
}
