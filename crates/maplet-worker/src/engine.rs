//! Rendering engine seam.
//!
//! The embedded engine is an opaque blocking callable: it receives a
//! loaded project and request parameters, and produces a complete
//! response. Deployments embed their own engine behind the [`Engine`]
//! trait; the strategy is chosen once at worker startup and never changes
//! for the lifetime of the child.
//!
//! [`BuiltinEngine`] is the stock implementation used by the standalone
//! worker binary. It serves capability and feature documents derived from
//! the project description; map rendering proper is delegated to engine
//! plugins in real deployments.

use maplet_core::frames::{ApiParams, OgcEndpoints, OwsParams, PluginInfo};
use serde_json::json;

use maplet_cache::Project;

/// Complete response produced by one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl EngineResponse {
    pub fn json(status: u16, doc: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(doc).unwrap_or_default(),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &json!({ "error": message }))
    }
}

/// The embedded rendering engine.
pub trait Engine: Send {
    /// Engine version advertised in the startup banner.
    fn version(&self) -> &str;

    /// OGC endpoint capabilities advertised for collections.
    fn endpoints(&self) -> OgcEndpoints {
        OgcEndpoints::MAP | OgcEndpoints::FEATURES
    }

    /// Engine plugins loaded in this child.
    fn plugins(&self) -> Vec<PluginInfo> {
        Vec::new()
    }

    /// Handle an OWS request against a loaded project.
    fn handle_ows(&mut self, project: &Project, params: &OwsParams) -> EngineResponse;

    /// Handle an api request, optionally targeted at a project.
    fn handle_api(&mut self, project: Option<&Project>, params: &ApiParams) -> EngineResponse;
}

/// Stock engine of the standalone worker binary.
#[derive(Debug, Default)]
pub struct BuiltinEngine;

impl BuiltinEngine {
    fn capabilities(project: &Project, params: &OwsParams) -> serde_json::Value {
        json!({
            "service": params.service,
            "version": params.version.as_deref().unwrap_or("1.3.0"),
            "title": project.doc.title,
            "crs": project.doc.crs,
            "advertised_url": params.url,
            "layers": project
                .doc
                .layers
                .iter()
                .map(|layer| {
                    json!({
                        "id": layer.id,
                        "name": layer.name,
                        "crs": layer.crs,
                        "spatial": layer.is_spatial(),
                        "valid": layer.is_valid(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    fn features(project: &Project, layer_name: &str) -> Option<serde_json::Value> {
        project
            .doc
            .layers
            .iter()
            .find(|layer| layer.name == layer_name && layer.is_spatial())
            .map(|layer| {
                json!({
                    "type": "FeatureCollection",
                    "layer": layer.name,
                    "source": layer.source,
                    "features": [],
                })
            })
    }
}

impl Engine for BuiltinEngine {
    fn version(&self) -> &str {
        concat!("builtin/", env!("CARGO_PKG_VERSION"))
    }

    fn handle_ows(&mut self, project: &Project, params: &OwsParams) -> EngineResponse {
        match params.request.to_ascii_uppercase().as_str() {
            "GETCAPABILITIES" => {
                EngineResponse::json(200, &Self::capabilities(project, params))
            }
            "GETFEATURE" => {
                let layer = params.options.as_deref().unwrap_or_default();
                match Self::features(project, layer) {
                    Some(doc) => EngineResponse::json(200, &doc),
                    None => EngineResponse::error(400, &format!("unknown layer: {layer}")),
                }
            }
            other => EngineResponse::error(
                400,
                &format!("unsupported {} request: {other}", params.service),
            ),
        }
    }

    fn handle_api(&mut self, project: Option<&Project>, params: &ApiParams) -> EngineResponse {
        match project {
            Some(project) => EngineResponse::json(
                200,
                &json!({
                    "api": params.name,
                    "path": params.path,
                    "project": project.doc.title,
                    "layers": project.doc.layers.len(),
                }),
            ),
            None => EngineResponse::json(
                200,
                &json!({ "api": params.name, "path": params.path }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplet_cache::{LayerDoc, ProjectDoc};

    fn project() -> Project {
        Project {
            doc: ProjectDoc {
                title: "town".to_string(),
                crs: "EPSG:4326".to_string(),
                saved_version: None,
                layers: vec![LayerDoc {
                    id: "l0".to_string(),
                    name: "parcels".to_string(),
                    source: "parcels.gpkg".to_string(),
                    crs: "EPSG:4326".to_string(),
                    geometry: Some("polygon".to_string()),
                    broken: false,
                }],
            },
            filename: "/srv/town.mproj".to_string(),
        }
    }

    #[test]
    fn capabilities_lists_layers() {
        let mut engine = BuiltinEngine;
        let response = engine.handle_ows(
            &project(),
            &OwsParams {
                service: "WMS".to_string(),
                request: "GetCapabilities".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(response.status, 200);
        let doc: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(doc["title"], "town");
        assert_eq!(doc["layers"][0]["name"], "parcels");
    }

    #[test]
    fn unsupported_requests_are_rejected() {
        let mut engine = BuiltinEngine;
        let response = engine.handle_ows(
            &project(),
            &OwsParams {
                service: "WMS".to_string(),
                request: "GetPrint".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(response.status, 400);
    }
}
