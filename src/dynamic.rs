//! Data model for the proxy's hot-reloaded routing documents
//!
//! Only the fields the reconciler reads or writes are modelled. Everything else an
//! operator adds to a document is captured in the `extra` maps and written back
//! unchanged.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Middleware that redirects plaintext requests to HTTPS
pub const REDIRECT_TO_HTTPS: &str = "redirect-to-https";

/// Entry point for plaintext traffic
pub const WEB_ENTRYPOINT: &str = "web";

/// Entry point for TLS-terminated traffic
pub const WEBSECURE_ENTRYPOINT: &str = "websecure";

/// A routing document: one namespace file in the dynamic directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSection>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    /// Middleware definitions are opaque to the reconciler
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Value>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Router {
    /// Match expression, passed through verbatim
    pub rule: String,

    pub service: String,

    #[serde(rename = "entryPoints", default)]
    pub entry_points: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middlewares: Option<Vec<String>>,

    /// Present iff the router terminates TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTls {
    #[serde(rename = "certResolver", default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "loadBalancer", default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancer>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(rename = "passHostHeader", default, skip_serializing_if = "Option::is_none")]
    pub pass_host_header: Option<bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Router and service names derived from the managed application's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteNames {
    pub router: String,
    pub secure_router: String,
    pub service: String,
}

impl RouteNames {
    pub fn for_app(app_name: &str) -> Self {
        Self {
            router: format!("{}-router-app", app_name),
            secure_router: format!("{}-router-app-secure", app_name),
            service: format!("{}-service-app", app_name),
        }
    }
}

/// Match rule binding a router to `host` on every path
pub fn host_rule(host: &str) -> String {
    format!("Host(`{}`) && PathPrefix(`/`)", host)
}

impl RoutingDocument {
    /// The single-router, single-service document for a freshly installed application
    pub fn default_for_app(app_name: &str, upstream_url: &str) -> Self {
        let names = RouteNames::for_app(app_name);

        let router = Router {
            rule: host_rule(&format!("{}.docker.localhost", app_name)),
            service: names.service.clone(),
            entry_points: vec![WEB_ENTRYPOINT.to_string()],
            ..Default::default()
        };

        let service = Service {
            load_balancer: Some(LoadBalancer {
                servers: vec![Server {
                    url: upstream_url.to_string(),
                    extra: BTreeMap::new(),
                }],
                pass_host_header: Some(true),
                extra: BTreeMap::new(),
            }),
            extra: BTreeMap::new(),
        };

        let mut http = HttpSection::default();
        http.routers.insert(names.router, router);
        http.services.insert(names.service, service);

        Self {
            http: Some(http),
            extra: BTreeMap::new(),
        }
    }

    /// The shared middlewares namespace holding the HTTPS redirect
    pub fn default_middlewares() -> Self {
        let mut redirect = Mapping::new();
        redirect.insert("scheme".into(), "https".into());
        redirect.insert("permanent".into(), true.into());

        let mut middleware = Mapping::new();
        middleware.insert("redirectScheme".into(), Value::Mapping(redirect));

        let mut http = HttpSection::default();
        http.middlewares
            .insert(REDIRECT_TO_HTTPS.to_string(), Value::Mapping(middleware));

        Self {
            http: Some(http),
            extra: BTreeMap::new(),
        }
    }

    pub fn router(&self, name: &str) -> Option<&Router> {
        self.http.as_ref().and_then(|h| h.routers.get(name))
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.http.as_ref().and_then(|h| h.services.get(name))
    }

    /// Mutable access to the http section, creating it if missing
    pub fn http_mut(&mut self) -> &mut HttpSection {
        self.http.get_or_insert_with(HttpSection::default)
    }

    /// Routers whose `service` names no service in this document, as (router, service)
    pub fn dangling_references(&self) -> Vec<(&str, &str)> {
        let Some(http) = self.http.as_ref() else {
            return Vec::new();
        };
        http.routers
            .iter()
            .filter(|(_, r)| !http.services.contains_key(&r.service))
            .map(|(name, r)| (name.as_str(), r.service.as_str()))
            .collect()
    }
}

impl Router {
    pub fn has_middleware(&self, name: &str) -> bool {
        self.middlewares
            .as_ref()
            .is_some_and(|m| m.iter().any(|entry| entry == name))
    }
}
