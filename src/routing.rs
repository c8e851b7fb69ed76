//! Reconciles the managed application's routing document with administrator settings

use crate::dynamic::{
    host_rule, RouteNames, Router, RouterTls, RoutingDocument, REDIRECT_TO_HTTPS,
    WEBSECURE_ENTRYPOINT,
};
use crate::error::Result;
use crate::store::ConfigStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Certificate mode chosen by the administrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    /// Plaintext only
    #[default]
    None,
    /// TLS with certificates issued by Let's Encrypt
    LetsEncrypt,
}

impl CertificateType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(CertificateType::None),
            "letsencrypt" => Some(CertificateType::LetsEncrypt),
            _ => None,
        }
    }

    pub fn enables_tls(&self) -> bool {
        !matches!(self, CertificateType::None)
    }
}

/// Administrator settings that drive routing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminState {
    pub host: Option<String>,
    #[serde(default)]
    pub certificate_type: CertificateType,
    pub lets_encrypt_email: Option<String>,
}

/// Computes and persists the next routing document for the managed application
#[derive(Debug, Clone)]
pub struct RoutingReconciler {
    namespace: String,
    names: RouteNames,
    cert_resolver: String,
}

impl RoutingReconciler {
    pub fn new(app_name: &str, cert_resolver: &str) -> Self {
        Self {
            namespace: app_name.to_string(),
            names: RouteNames::for_app(app_name),
            cert_resolver: cert_resolver.to_string(),
        }
    }

    /// Compute the document that reflects `admin` with `host` as the public hostname.
    ///
    /// Pure: the same inputs always give the same output, and applying the result
    /// again changes nothing.
    pub fn apply(
        &self,
        mut doc: RoutingDocument,
        admin: &AdminState,
        host: Option<&str>,
    ) -> RoutingDocument {
        let Some(host) = host else {
            debug!("No public host configured, routing left unchanged");
            return doc;
        };

        let http = doc.http_mut();
        let Some(primary) = http.routers.get_mut(&self.names.router) else {
            warn!(
                router = %self.names.router,
                "Primary router missing from routing document, leaving it unchanged"
            );
            return doc;
        };

        primary.rule = host_rule(host);

        if !admin.certificate_type.enables_tls() {
            remove_middleware(primary, REDIRECT_TO_HTTPS);
            if http.routers.remove(&self.names.secure_router).is_some() {
                info!(router = %self.names.secure_router, "Removed secure router");
            }
            return doc;
        }

        ensure_middleware_once(primary, REDIRECT_TO_HTTPS);
        let rule = primary.rule.clone();
        let service = primary.service.clone();

        let cert_resolver = admin
            .lets_encrypt_email
            .as_deref()
            .filter(|email| !email.trim().is_empty())
            .map(|_| self.cert_resolver.clone());

        let secure = http
            .routers
            .entry(self.names.secure_router.clone())
            .or_default();
        secure.rule = rule;
        secure.service = service;
        secure.entry_points = vec![WEBSECURE_ENTRYPOINT.to_string()];
        // Redirecting on the TLS router would loop
        remove_middleware(secure, REDIRECT_TO_HTTPS);
        secure
            .tls
            .get_or_insert_with(RouterTls::default)
            .cert_resolver = cert_resolver;

        doc
    }

    /// Load the application's document, apply `admin`, and persist the result
    pub fn update_server(
        &self,
        store: &ConfigStore,
        admin: &AdminState,
        host: Option<&str>,
    ) -> Result<RoutingDocument> {
        let update = self.prepare(store, admin, host)?;
        self.commit(store, update)
    }

    /// Read the current document and compute the next one without writing anything.
    ///
    /// A missing document is replaced by the default application document.
    pub fn prepare(
        &self,
        store: &ConfigStore,
        admin: &AdminState,
        host: Option<&str>,
    ) -> Result<RoutingUpdate> {
        let current = store.read(&self.namespace)?;
        let base = match &current {
            Some(doc) => doc.clone(),
            None => store.default_document(&self.namespace),
        };
        let next = self.apply(base, admin, host);
        Ok(RoutingUpdate {
            current,
            next,
            host: host.map(str::to_string),
            certificate_type: admin.certificate_type,
        })
    }

    /// Persist a prepared document if it differs from what was read
    pub fn commit(&self, store: &ConfigStore, update: RoutingUpdate) -> Result<RoutingDocument> {
        if !update.changes_anything() {
            debug!(namespace = %self.namespace, "Routing document already up to date");
            return Ok(update.next);
        }

        store.write(&self.namespace, &update.next)?;
        info!(
            namespace = %self.namespace,
            host = update.host.as_deref().unwrap_or_default(),
            certificate = ?update.certificate_type,
            created = update.current.is_none(),
            "Routing document updated"
        );
        Ok(update.next)
    }
}

/// A computed routing document waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingUpdate {
    current: Option<RoutingDocument>,
    next: RoutingDocument,
    host: Option<String>,
    certificate_type: CertificateType,
}

impl RoutingUpdate {
    pub fn next(&self) -> &RoutingDocument {
        &self.next
    }

    pub fn changes_anything(&self) -> bool {
        self.current.as_ref() != Some(&self.next)
    }
}

/// Remove every occurrence of `name`, dropping the list if that empties it
fn remove_middleware(router: &mut Router, name: &str) {
    if let Some(list) = router.middlewares.as_mut() {
        let before = list.len();
        list.retain(|m| m != name);
        if list.is_empty() && before > 0 {
            router.middlewares = None;
        }
    }
}

/// Keep the first occurrence of `name` (appending it if absent) and drop duplicates
fn ensure_middleware_once(router: &mut Router, name: &str) {
    let list = router.middlewares.get_or_insert_with(Vec::new);
    let mut seen = false;
    list.retain(|m| {
        if m != name {
            return true;
        }
        let keep = !seen;
        seen = true;
        keep
    });
    if !seen {
        list.push(name.to_string());
    }
}
