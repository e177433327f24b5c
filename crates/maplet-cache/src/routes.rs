//! Search-path routing.
//!
//! The search-path table maps mount prefixes onto storage root urls. A
//! prefix may contain `{var}` placeholders binding exactly one path
//! segment; at lookup time the longest matching prefix wins and the root
//! url is instantiated with the same bindings.
//!
//! The instantiated url receives the remaining path either through a
//! `{path}` template in its query string or, absent one, by appending it to
//! the url path. The table is immutable between two reloads and identical
//! across all children of a pool.

use std::collections::BTreeMap;

use url::Url;

use crate::errors::{CacheError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone)]
struct Route {
    mount: String,
    segments: Vec<Segment>,
    // The url template is kept raw: placeholders would be percent-encoded
    // away by eager parsing.
    root_raw: String,
}

impl Route {
    fn parse(mount: &str, root: &str) -> Result<Self> {
        if !mount.starts_with('/') {
            return Err(CacheError::InvalidRoute(
                mount.to_string(),
                "mount prefix must be absolute".to_string(),
            ));
        }
        let segments = split(mount)
            .map(|seg| {
                if let Some(var) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    if var.is_empty() {
                        return Err(CacheError::InvalidRoute(
                            mount.to_string(),
                            "empty placeholder".to_string(),
                        ));
                    }
                    Ok(Segment::Var(var.to_string()))
                } else {
                    Ok(Segment::Literal(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let route = Self {
            mount: mount.trim_end_matches('/').to_string(),
            segments,
            root_raw: root.to_string(),
        };
        if !route.is_dynamic() {
            // Static templates must parse as-is.
            parse_url(root)?;
        }
        Ok(route)
    }

    fn root_url(&self) -> Result<Url> {
        parse_url(&self.root_raw)
    }

    fn is_dynamic(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Var(_)))
    }

    /// Match `path` segments against the mount prefix, binding placeholders.
    fn matches<'a>(&'a self, path: &[&'a str]) -> Option<Match<'a>> {
        if path.len() < self.segments.len() {
            return None;
        }
        let mut bindings = Vec::new();
        for (seg, part) in self.segments.iter().zip(path) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Var(name) => bindings.push((name.as_str(), *part)),
            }
        }
        Some(Match {
            depth: self.segments.len(),
            bindings,
            rest: path[self.segments.len()..].to_vec(),
        })
    }

    /// Instantiate the root url with the bindings of a successful match.
    fn instantiate(&self, m: &Match<'_>) -> Result<Resolved> {
        let mut raw = self.root_raw.clone();
        let mut location = self.mount.clone();
        for (name, value) in &m.bindings {
            let pattern = format!("{{{name}}}");
            raw = raw.replace(&pattern, value);
            location = location.replace(&pattern, value);
        }

        let rest = m.rest.join("/");
        let mut url = parse_url(&raw)?;
        if let Some(query) = url.query() {
            if query.contains("{path}") {
                let query = query.replace("{path}", &rest);
                url.set_query(Some(&query));
                return Ok(Resolved { location, url });
            }
        }
        if !rest.is_empty() {
            let path = format!("{}/{}", url.path().trim_end_matches('/'), rest);
            url.set_path(&path);
        }
        Ok(Resolved { location, url })
    }
}

struct Match<'a> {
    depth: usize,
    bindings: Vec<(&'a str, &'a str)>,
    rest: Vec<&'a str>,
}

/// Outcome of a successful search-path resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// The concrete mount location the path matched (bindings applied).
    pub location: String,
    /// The storage url for the handler of `url.scheme()`.
    pub url: Url,
}

/// Ordered search-path table.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    routes: Vec<Route>,
}

impl Routes {
    pub fn from_table(table: &BTreeMap<String, String>) -> Result<Self> {
        let routes = table
            .iter()
            .map(|(mount, root)| Route::parse(mount, root))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { routes })
    }

    /// Resolve a request path into a storage url.
    ///
    /// Among matching routes the longest prefix (most segments) wins.
    pub fn resolve(&self, path: &str) -> Result<Option<Resolved>> {
        let parts: Vec<&str> = split(path).collect();
        let best = self
            .routes
            .iter()
            .filter_map(|r| r.matches(&parts).map(|m| (r, m)))
            .max_by_key(|(_, m)| m.depth);

        match best {
            Some((route, m)) => route.instantiate(&m).map(Some),
            None => Ok(None),
        }
    }

    /// Enumerable (location, root url) pairs.
    ///
    /// Without a filter only static routes are returned; dynamic routes
    /// need a concrete location to bind their placeholders.
    pub fn locations(&self, filter: Option<&str>) -> Result<Vec<(String, Url)>> {
        match filter {
            None => self
                .routes
                .iter()
                .filter(|r| !r.is_dynamic())
                .map(|r| Ok((r.mount.clone(), r.root_url()?)))
                .collect(),
            Some(location) => Ok(self
                .resolve(location)?
                .into_iter()
                .map(|r| (location.trim_end_matches('/').to_string(), r.url))
                .collect()),
        }
    }

    /// Static route roots, for startup validation. Dynamic roots cannot be
    /// validated until a request binds their placeholders.
    pub(crate) fn static_roots(&self) -> Result<Vec<Url>> {
        self.routes
            .iter()
            .filter(|r| !r.is_dynamic())
            .map(|r| r.root_url())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Parse a root url, defaulting bare absolute paths to the `file` scheme.
pub fn parse_url(raw: &str) -> Result<Url> {
    let parsed = if raw.starts_with('/') {
        Url::parse(&format!("file://{raw}"))
    } else {
        Url::parse(raw)
    };
    parsed.map_err(|err| CacheError::InvalidRootUrl(raw.to_string(), err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> Routes {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Routes::from_table(&map).unwrap()
    }

    #[test]
    fn literal_prefix_appends_rest() {
        let routes = table(&[("/france", "file:///srv/projects/france")]);
        let resolved = routes.resolve("/france/33/parcels").unwrap().unwrap();
        assert_eq!(resolved.location, "/france");
        assert_eq!(resolved.url.as_str(), "file:///srv/projects/france/33/parcels");
    }

    #[test]
    fn longest_prefix_wins() {
        let routes = table(&[
            ("/france", "file:///srv/projects/france"),
            ("/france/33", "file:///srv/gironde"),
        ]);
        let resolved = routes.resolve("/france/33/parcels").unwrap().unwrap();
        assert_eq!(resolved.location, "/france/33");
        assert_eq!(resolved.url.path(), "/srv/gironde/parcels");
    }

    #[test]
    fn placeholders_bind_one_segment() {
        let routes = table(&[("/tenants/{tenant}", "file:///srv/{tenant}/projects")]);
        let resolved = routes.resolve("/tenants/acme/town").unwrap().unwrap();
        assert_eq!(resolved.location, "/tenants/acme");
        assert_eq!(resolved.url.path(), "/srv/acme/projects/town");

        assert!(routes.resolve("/tenants").unwrap().is_none());
    }

    #[test]
    fn path_template_in_query() {
        let routes = table(&[("/db", "mem://store?project={path}")]);
        let resolved = routes.resolve("/db/town/center").unwrap().unwrap();
        assert_eq!(resolved.url.query(), Some("project=town/center"));
    }

    #[test]
    fn unmatched_path_resolves_to_none() {
        let routes = table(&[("/france", "file:///srv/projects")]);
        assert!(routes.resolve("/spain/madrid").unwrap().is_none());
    }

    #[test]
    fn bare_paths_default_to_file_scheme() {
        let url = parse_url("/srv/projects").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.path(), "/srv/projects");
    }

    #[test]
    fn dynamic_routes_are_skipped_without_filter() {
        let routes = table(&[
            ("/public", "file:///srv/public"),
            ("/tenants/{tenant}", "file:///srv/{tenant}"),
        ]);
        let locations = routes.locations(None).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].0, "/public");

        let locations = routes.locations(Some("/tenants/acme")).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].1.path(), "/srv/acme");
    }
}
