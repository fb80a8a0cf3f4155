use axum::http::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

use crate::error::{GatewayError, Result};

/// How the matched prefix is treated when forwarding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    /// Remove the prefix; an empty remainder becomes `/`
    #[default]
    StripPrefix,
    /// Forward the path untouched
    Passthrough,
}

/// Route as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub upstream: String,
    pub prefix: String,
    #[serde(default)]
    pub rewrite: RewriteRule,
}

impl RouteConfig {
    pub fn new(name: &str, upstream: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            upstream: upstream.to_string(),
            prefix: prefix.to_string(),
            rewrite: RewriteRule::StripPrefix,
        }
    }

    pub fn with_rewrite(mut self, rewrite: RewriteRule) -> Self {
        self.rewrite = rewrite;
        self
    }
}

/// Validated route, immutable once the table is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub name: String,
    /// Upstream base as configured, without a trailing slash
    pub upstream: String,
    /// `host[:port]` of the upstream
    pub authority: String,
    /// Path component of the upstream base, empty when there is none
    pub base_path: String,
    pub prefix: String,
    pub rewrite: RewriteRule,
}

impl RouteEntry {
    fn compile(config: RouteConfig) -> Result<Self> {
        let invalid = |reason: &str| GatewayError::InvalidUpstream {
            service: config.name.clone(),
            reason: reason.to_string(),
        };

        let uri: Uri = config
            .upstream
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| invalid(&e.to_string()))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {}", other))),
            None => return Err(invalid("missing scheme")),
        }

        let authority = uri
            .authority()
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        if uri.query().is_some() {
            return Err(invalid("query strings are not allowed in upstream addresses"));
        }

        let base_path = uri.path().trim_end_matches('/').to_string();
        let prefix = normalize_prefix(&config.name, &config.prefix)?;

        Ok(Self {
            upstream: format!("http://{}{}", authority, base_path),
            name: config.name,
            authority,
            base_path,
            prefix,
            rewrite: config.rewrite,
        })
    }

    /// Whether `path` falls under this route's prefix
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }

        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Apply the rewrite rule to a path this route matches
    pub fn rewrite_path(&self, path: &str) -> String {
        if self.rewrite == RewriteRule::Passthrough || self.prefix == "/" {
            return path.to_string();
        }

        match path.strip_prefix(self.prefix.as_str()) {
            Some("") | None => "/".to_string(),
            Some(rest) => rest.to_string(),
        }
    }

    /// Absolute URI on the upstream for a rewritten path and optional query
    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> Result<Uri> {
        let mut target = format!("http://{}{}{}", self.authority, self.base_path, path);
        if let Some(query) = query {
            target.push('?');
            target.push_str(query);
        }

        target
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| GatewayError::RequestBuild(e.to_string()))
    }
}

fn normalize_prefix(service: &str, prefix: &str) -> Result<String> {
    if !prefix.starts_with('/') {
        return Err(GatewayError::Config(format!(
            "route prefix for {} must start with '/': {:?}",
            service, prefix
        )));
    }

    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// A resolved route plus the path to send upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a RouteEntry,
    pub path: String,
}

/// Prefix routing table, checked longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    /// Validate routes and order them so no prefix shadows a longer one
    pub fn compile(configs: Vec<RouteConfig>) -> Result<Self> {
        let mut routes = Vec::with_capacity(configs.len());
        let mut seen = HashSet::new();

        for config in configs {
            let route = RouteEntry::compile(config)?;
            if !seen.insert(route.prefix.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate route prefix {} ({})",
                    route.prefix, route.name
                )));
            }
            routes.push(route);
        }

        // Stable, so equal lengths keep registration order
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        for route in &routes {
            info!(
                service = %route.name,
                prefix = %route.prefix,
                upstream = %route.upstream,
                rewrite = ?route.rewrite,
                "Registered route"
            );
        }

        Ok(Self { routes })
    }

    /// Find the route for `path` and compute the forwarded path
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .map(|route| RouteMatch {
                route,
                path: route.rewrite_path(path),
            })
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
