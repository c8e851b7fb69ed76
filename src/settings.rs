//! Administrative operations over the proxy
//!
//! Each operation composes the engines in this crate. None of them decides
//! anything on its own: routing, main-config and service state all come from the
//! engine that owns them.

use crate::config::Settings;
use crate::dynamic::RoutingDocument;
use crate::error::{Error, Result};
use crate::jobs::{JobRegistry, Schedule, DOCKER_CLEANUP_JOB};
use crate::routing::{AdminState, CertificateType, RoutingReconciler};
use crate::service::{
    parse_env_block, ImagePolicy, ProxyOptions, ProxyTemplate, Reconciled, ServiceReconciler,
    SharedOrchestrator,
};
use crate::static_config::{Bootstrap, StaticConfig};
use crate::store::{ConfigStore, MIDDLEWARES_NAMESPACE};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What `bootstrap` did
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub server_config_created: bool,
    pub middlewares_created: bool,
    pub main_config: Bootstrap,
    pub service: Reconciled,
}

/// Entry point for administrator actions
pub struct ProxyAdmin {
    app_name: String,
    app_url: String,
    store: ConfigStore,
    routing: RoutingReconciler,
    main_config: StaticConfig,
    service: ServiceReconciler,
    orchestrator: SharedOrchestrator,
    jobs: Arc<JobRegistry>,
}

impl ProxyAdmin {
    pub fn new(settings: &Settings, orchestrator: SharedOrchestrator, jobs: Arc<JobRegistry>) -> Self {
        Self {
            app_name: settings.app_name.clone(),
            app_url: settings.app_url(),
            store: ConfigStore::new(&settings.dynamic_dir, settings.app_port),
            routing: RoutingReconciler::new(&settings.app_name, &settings.cert_resolver),
            main_config: StaticConfig::new(settings),
            service: ServiceReconciler::new(
                orchestrator.clone(),
                ProxyTemplate::from_settings(settings),
            ),
            orchestrator,
            jobs,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn main_config(&self) -> &StaticConfig {
        &self.main_config
    }

    pub fn service(&self) -> &ServiceReconciler {
        &self.service
    }

    /// Write any missing configuration, then bring the proxy service up.
    ///
    /// Existing files are left as they are. An existing service keeps its
    /// dashboard setting. The service is inspected before any file is written,
    /// and a failed image pull is only tolerated when the service is created.
    pub async fn bootstrap(&self, enable_http3: bool) -> Result<BootstrapReport> {
        let prepared = self.service.prepare(ImagePolicy::BestEffort).await?;
        let options = ProxyOptions {
            enable_dashboard: self.service.options_of(&prepared).enable_dashboard,
            enable_http3,
            env: None,
        };

        let server_config_created = self.create_default_server_config()?;
        let middlewares_created = self.create_default_middlewares()?;
        let main_config = self.main_config.bootstrap(enable_http3)?;

        let desired = self.service.template().desired_spec(&options);
        let service = self.service.commit(prepared, desired).await?;

        Ok(BootstrapReport {
            server_config_created,
            middlewares_created,
            main_config,
            service,
        })
    }

    /// Create the managed application's routing document if it is missing
    pub fn create_default_server_config(&self) -> Result<bool> {
        let doc = RoutingDocument::default_for_app(&self.app_name, &self.app_url);
        self.store.create_if_absent(&self.app_name, &doc)
    }

    /// Create the shared middlewares document if it is missing
    pub fn create_default_middlewares(&self) -> Result<bool> {
        self.store
            .create_if_absent(MIDDLEWARES_NAMESPACE, &RoutingDocument::default_middlewares())
    }

    /// Point the managed application at `admin.host` with the chosen certificate mode.
    ///
    /// The routing document is computed before the ACME email is touched. If
    /// writing it fails, the main config is put back.
    pub fn assign_domain(&self, admin: &AdminState) -> Result<RoutingDocument> {
        let update = self
            .routing
            .prepare(&self.store, admin, admin.host.as_deref())?;

        if admin.certificate_type != CertificateType::LetsEncrypt {
            return self.routing.commit(&self.store, update);
        }

        let snapshot = self.main_config.read_raw()?;
        self.main_config
            .update_lets_encrypt_email(admin.lets_encrypt_email.as_deref())?;
        self.routing
            .commit(&self.store, update)
            .inspect_err(|e| self.restore_main_config(snapshot.as_deref(), e))
    }

    /// Switch HTTP/3 in the main config and on the service, keeping the dashboard as is.
    ///
    /// The main config is only edited once the service is inspected and the
    /// image is present. A clean service failure puts the main config back.
    pub async fn toggle_http3(&self, enabled: bool) -> Result<Reconciled> {
        self.main_config.http3_enabled()?;
        let prepared = self.service.prepare(ImagePolicy::Required).await?;
        let options = ProxyOptions {
            enable_http3: enabled,
            env: None,
            ..self.service.options_of(&prepared)
        };

        let snapshot = self.main_config.read_raw()?;
        self.main_config.set_http3(enabled)?;
        let desired = self.service.template().desired_spec(&options);
        let outcome = self
            .service
            .commit(prepared, desired)
            .await
            .inspect_err(|e| self.restore_main_config(snapshot.as_deref(), e))?;
        info!(enabled, "HTTP/3 toggled");
        Ok(outcome)
    }

    /// Publish or withdraw the dashboard port, keeping HTTP/3 as is
    pub async fn toggle_dashboard(&self, enabled: bool) -> Result<Reconciled> {
        let prepared = self.service.prepare(ImagePolicy::Required).await?;
        let options = ProxyOptions {
            enable_dashboard: enabled,
            env: None,
            ..self.service.options_of(&prepared)
        };
        let desired = self.service.template().desired_spec(&options);
        let outcome = self.service.commit(prepared, desired).await?;
        info!(enabled, "Dashboard toggled");
        Ok(outcome)
    }

    /// Replace the proxy container's environment with the entries in `text`.
    ///
    /// A block with no entries leaves the live environment unchanged.
    pub async fn write_proxy_env(&self, text: &str) -> Result<Reconciled> {
        let env = parse_env_block(text);
        let prepared = self.service.prepare(ImagePolicy::Required).await?;
        let options = ProxyOptions {
            env: Some(env),
            ..self.service.options_of(&prepared)
        };
        let desired = self.service.template().desired_spec(&options);
        self.service.commit(prepared, desired).await
    }

    /// The running proxy's environment, one `KEY=VALUE` per line
    pub async fn read_proxy_env(&self) -> Result<Option<String>> {
        Ok(self.service.live_env().await?.map(|env| env.join("\n")))
    }

    /// Register or cancel the daily Docker cleanup
    pub fn set_docker_cleanup(&self, enabled: bool) {
        if !enabled {
            self.jobs.cancel(DOCKER_CLEANUP_JOB);
            return;
        }

        let orchestrator = self.orchestrator.clone();
        self.jobs
            .register(DOCKER_CLEANUP_JOB, Schedule::daily_midnight(), move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = orchestrator.prune_unused().await {
                        error!(error = %e, "Docker cleanup failed");
                    }
                }
            });
    }

    pub fn docker_cleanup_enabled(&self) -> bool {
        self.jobs.is_registered(DOCKER_CLEANUP_JOB)
    }

    pub fn set_access_log(&self, enabled: bool) -> Result<()> {
        self.main_config.set_access_log(enabled)
    }

    /// Switches on the running service, or `None` if it has not been created
    pub async fn proxy_status(&self) -> Result<Option<ProxyOptions>> {
        self.service.current_options().await
    }

    /// Put the main config back as it was before a failed operation.
    ///
    /// When the service write may have landed, the edit is kept so the file
    /// matches what was attempted.
    fn restore_main_config(&self, snapshot: Option<&str>, cause: &Error) {
        if cause.state_unknown() {
            warn!(error = %cause, "Service state unknown, keeping the main config edit");
            return;
        }
        let Some(snapshot) = snapshot else {
            return;
        };
        match self.main_config.restore(snapshot) {
            Ok(()) => info!(error = %cause, "Main config restored after failed operation"),
            Err(e) => error!(error = %e, cause = %cause, "Failed to restore main config"),
        }
    }
}
