//! Reconciliation of the proxy's orchestrator service
//!
//! The desired service spec is recomputed on every call and the live service is
//! inspected fresh each time. An absent service is created from the desired spec as
//! is. A present one is updated against the version it was inspected at, with the
//! desired spec merged onto the live one so fields this crate does not own survive.

use crate::config::Settings;
use crate::error::Result;
use async_trait::async_trait;
use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointPortConfigPublishModeEnum,
    EndpointSpec, Mount, MountTypeEnum, NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Port the proxy listens on for TLS inside its container
const CONTAINER_TLS_PORT: i64 = 443;

/// Port the proxy listens on for plaintext inside its container
const CONTAINER_HTTP_PORT: i64 = 80;

/// A service as currently known to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct LiveService {
    /// Version index to send back with an update
    pub version: u64,
    pub spec: ServiceSpec,
}

/// Operations this crate consumes from the orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Whether `image` is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// `Ok(None)` when no service has this name; connectivity failures are errors
    async fn inspect_service(&self, name: &str) -> Result<Option<LiveService>>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()>;

    /// Replace the service spec. Fails with `VersionConflict` if `version` is stale.
    async fn update_service(&self, name: &str, version: u64, spec: &ServiceSpec) -> Result<()>;

    /// Remove stopped containers and dangling images. Returns bytes reclaimed.
    async fn prune_unused(&self) -> Result<u64>;
}

/// Wrapper to share an orchestrator across tasks
pub type SharedOrchestrator = Arc<dyn Orchestrator>;

/// What to do when the proxy image is missing and cannot be pulled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePolicy {
    /// A failed pull aborts reconciliation
    Required,
    /// A failed pull is logged and a missing service is still created. Only used
    /// when bootstrapping at process start, where the orchestrator pulls the image
    /// itself when it schedules the task. Updates always require the image.
    BestEffort,
}

/// Switches that shape the proxy service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    pub enable_dashboard: bool,
    pub enable_http3: bool,
    /// Environment for the proxy container. `None` or empty keeps the live one.
    pub env: Option<Vec<String>>,
}

/// Observed state of the service, decided by inspection
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceState {
    Absent,
    Present(LiveService),
}

/// Outcome of a reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Created(ServiceSpec),
    Updated { version: u64, spec: ServiceSpec },
}

/// A service inspected and cleared to be written to.
///
/// Holds the state observed at inspection. The required image is already present,
/// except for a first creation under `ImagePolicy::BestEffort`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    state: ServiceState,
}

impl Prepared {
    pub fn state(&self) -> &ServiceState {
        &self.state
    }
}

/// Static description of the proxy service, derived from settings
#[derive(Debug, Clone)]
pub struct ProxyTemplate {
    pub service_name: String,
    pub image: String,
    pub main_config_path: String,
    pub dynamic_dir: String,
    pub container_dynamic_dir: String,
    pub docker_socket: String,
    pub network: String,
    pub placement_constraint: String,
    pub http_port: u16,
    pub https_port: u16,
    pub dashboard_port: u16,
}

impl ProxyTemplate {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service_name: settings.proxy.service_name.clone(),
            image: settings.proxy.image.clone(),
            main_config_path: settings.main_config_path().display().to_string(),
            dynamic_dir: settings.dynamic_dir.display().to_string(),
            container_dynamic_dir: settings.container_dynamic_dir.clone(),
            docker_socket: settings.proxy.docker_socket.clone(),
            network: settings.proxy.network.clone(),
            placement_constraint: settings.proxy.placement_constraint.clone(),
            http_port: settings.http_port,
            https_port: settings.https_port,
            dashboard_port: settings.proxy.dashboard_port,
        }
    }

    /// The service spec for `options`
    pub fn desired_spec(&self, options: &ProxyOptions) -> ServiceSpec {
        let mounts = vec![
            bind_mount(&self.main_config_path, "/etc/traefik/traefik.yml"),
            bind_mount(&self.dynamic_dir, &self.container_dynamic_dir),
            bind_mount(&self.docker_socket, "/var/run/docker.sock"),
        ];

        let mut ports = Vec::new();
        if options.enable_http3 {
            ports.push(host_port(
                CONTAINER_TLS_PORT,
                self.https_port,
                EndpointPortConfigProtocolEnum::UDP,
            ));
        }
        ports.push(host_port(
            CONTAINER_TLS_PORT,
            self.https_port,
            EndpointPortConfigProtocolEnum::TCP,
        ));
        ports.push(host_port(
            CONTAINER_HTTP_PORT,
            self.http_port,
            EndpointPortConfigProtocolEnum::TCP,
        ));
        if options.enable_dashboard {
            ports.push(host_port(
                i64::from(self.dashboard_port),
                self.dashboard_port,
                EndpointPortConfigProtocolEnum::TCP,
            ));
        }

        ServiceSpec {
            name: Some(self.service_name.clone()),
            labels: Some(HashMap::from([(
                "traefik.enable".to_string(),
                "true".to_string(),
            )])),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(self.image.clone()),
                    env: options.env.clone(),
                    mounts: Some(mounts),
                    ..Default::default()
                }),
                networks: Some(vec![NetworkAttachmentConfig {
                    target: Some(self.network.clone()),
                    ..Default::default()
                }]),
                placement: Some(TaskSpecPlacement {
                    constraints: Some(vec![self.placement_constraint.clone()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated {
                    replicas: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            endpoint_spec: Some(EndpointSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Recover the dashboard and HTTP/3 switches from a live spec
    pub fn options_from_spec(&self, spec: &ServiceSpec) -> ProxyOptions {
        let ports = spec
            .endpoint_spec
            .as_ref()
            .and_then(|e| e.ports.as_deref())
            .unwrap_or_default();

        let enable_dashboard = ports
            .iter()
            .any(|p| p.published_port == Some(i64::from(self.dashboard_port)));
        let enable_http3 = ports.iter().any(|p| {
            p.protocol == Some(EndpointPortConfigProtocolEnum::UDP)
                && p.target_port == Some(CONTAINER_TLS_PORT)
        });

        ProxyOptions {
            enable_dashboard,
            enable_http3,
            env: None,
        }
    }
}

fn bind_mount(source: &str, target: &str) -> Mount {
    Mount {
        source: Some(source.to_string()),
        target: Some(target.to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(false),
        ..Default::default()
    }
}

fn host_port(
    target: i64,
    published: u16,
    protocol: EndpointPortConfigProtocolEnum,
) -> EndpointPortConfig {
    EndpointPortConfig {
        target_port: Some(target),
        published_port: Some(i64::from(published)),
        publish_mode: Some(EndpointPortConfigPublishModeEnum::HOST),
        protocol: Some(protocol),
        ..Default::default()
    }
}

/// Merge `desired` onto `live`.
///
/// Ports, mounts, networks, placement constraints, image, replicas and name come from
/// `desired`. Desired labels are added over the live ones. The live environment is
/// kept unless `desired` carries a non-empty one, which then replaces it outright.
/// Everything else is taken from `live`.
pub fn merge_spec(live: &ServiceSpec, desired: &ServiceSpec) -> ServiceSpec {
    let mut merged = live.clone();

    merged.name = desired.name.clone().or(merged.name);
    merged.mode = desired.mode.clone();
    merged.networks = desired.networks.clone();

    if let Some(labels) = desired.labels.as_ref() {
        merged
            .labels
            .get_or_insert_with(HashMap::new)
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let desired_ports = desired
        .endpoint_spec
        .as_ref()
        .and_then(|e| e.ports.clone());
    merged
        .endpoint_spec
        .get_or_insert_with(EndpointSpec::default)
        .ports = desired_ports;

    let desired_task = desired.task_template.clone().unwrap_or_default();
    let task = merged.task_template.get_or_insert_with(TaskSpec::default);
    task.networks = desired_task.networks;

    let desired_constraints = desired_task.placement.and_then(|p| p.constraints);
    task.placement
        .get_or_insert_with(TaskSpecPlacement::default)
        .constraints = desired_constraints;

    let desired_container = desired_task.container_spec.unwrap_or_default();
    let container = task
        .container_spec
        .get_or_insert_with(TaskSpecContainerSpec::default);
    container.image = desired_container.image;
    container.mounts = desired_container.mounts;
    if let Some(env) = desired_container.env.filter(|env| !env.is_empty()) {
        container.env = Some(env);
    }

    merged
}

/// Drives the proxy service towards its desired spec
pub struct ServiceReconciler {
    orchestrator: SharedOrchestrator,
    template: ProxyTemplate,
}

impl ServiceReconciler {
    pub fn new(orchestrator: SharedOrchestrator, template: ProxyTemplate) -> Self {
        Self {
            orchestrator,
            template,
        }
    }

    pub fn template(&self) -> &ProxyTemplate {
        &self.template
    }

    pub async fn state(&self) -> Result<ServiceState> {
        Ok(
            match self
                .orchestrator
                .inspect_service(&self.template.service_name)
                .await?
            {
                Some(live) => ServiceState::Present(live),
                None => ServiceState::Absent,
            },
        )
    }

    /// Create the service from `desired`, or merge `desired` into the running one
    pub async fn reconcile(&self, desired: ServiceSpec, policy: ImagePolicy) -> Result<Reconciled> {
        let prepared = self.prepare(policy).await?;
        self.commit(prepared, desired).await
    }

    /// Inspect the service and make sure the image is available.
    ///
    /// Nothing is written. A pull failure is only tolerated under `BestEffort`
    /// when the service does not exist yet.
    pub async fn prepare(&self, policy: ImagePolicy) -> Result<Prepared> {
        let state = self.state().await?;
        let policy = match state {
            ServiceState::Absent => policy,
            ServiceState::Present(_) => ImagePolicy::Required,
        };
        self.ensure_image(policy).await?;
        Ok(Prepared { state })
    }

    /// Switches in effect on a prepared service. An absent service has them all off.
    pub fn options_of(&self, prepared: &Prepared) -> ProxyOptions {
        match &prepared.state {
            ServiceState::Present(live) => self.template.options_from_spec(&live.spec),
            ServiceState::Absent => ProxyOptions::default(),
        }
    }

    /// Write `desired` against the state observed by `prepare`
    pub async fn commit(&self, prepared: Prepared, desired: ServiceSpec) -> Result<Reconciled> {
        let name = &self.template.service_name;
        match prepared.state {
            ServiceState::Absent => {
                self.orchestrator.create_service(&desired).await?;
                info!(service = %name, "Service not found, created");
                Ok(Reconciled::Created(desired))
            }
            ServiceState::Present(live) => {
                let merged = merge_spec(&live.spec, &desired);
                self.orchestrator
                    .update_service(name, live.version, &merged)
                    .await
                    .inspect_err(|e| {
                        warn!(service = %name, version = live.version, error = %e, "Service update failed");
                    })?;
                info!(service = %name, version = live.version, "Service updated");
                Ok(Reconciled::Updated {
                    version: live.version,
                    spec: merged,
                })
            }
        }
    }

    /// Switches currently in effect, or `None` if the service does not exist
    pub async fn current_options(&self) -> Result<Option<ProxyOptions>> {
        Ok(match self.state().await? {
            ServiceState::Present(live) => Some(self.template.options_from_spec(&live.spec)),
            ServiceState::Absent => None,
        })
    }

    /// Environment of the running proxy container
    pub async fn live_env(&self) -> Result<Option<Vec<String>>> {
        Ok(match self.state().await? {
            ServiceState::Present(live) => live
                .spec
                .task_template
                .and_then(|t| t.container_spec)
                .and_then(|c| c.env),
            ServiceState::Absent => None,
        })
    }

    async fn ensure_image(&self, policy: ImagePolicy) -> Result<()> {
        let image = &self.template.image;
        if self.orchestrator.image_exists(image).await? {
            debug!(image = %image, "Image exists locally, skipping pull");
            return Ok(());
        }

        match self.orchestrator.pull_image(image).await {
            Ok(()) => Ok(()),
            Err(e) if policy == ImagePolicy::BestEffort => {
                warn!(image = %image, error = %e, "Image pull failed, creating the service anyway");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Split an administrator-supplied block into `KEY=VALUE` entries.
///
/// Blank lines and `#` comments are dropped; surrounding whitespace is trimmed.
pub fn parse_env_block(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ProxyTemplate {
        ProxyTemplate::from_settings(&Settings::default())
    }

    fn ports(spec: &ServiceSpec) -> Vec<EndpointPortConfig> {
        spec.endpoint_spec.clone().unwrap().ports.unwrap()
    }

    fn container(spec: &ServiceSpec) -> TaskSpecContainerSpec {
        spec.task_template.clone().unwrap().container_spec.unwrap()
    }

    fn with_env(mut spec: ServiceSpec, env: &[&str]) -> ServiceSpec {
        let task = spec.task_template.get_or_insert_with(TaskSpec::default);
        let c = task.container_spec.get_or_insert_with(TaskSpecContainerSpec::default);
        c.env = Some(env.iter().map(|e| e.to_string()).collect());
        spec
    }

    #[test]
    fn test_desired_spec_defaults() {
        let spec = template().desired_spec(&ProxyOptions::default());
        assert_eq!(spec.name.as_deref(), Some("dokploy-traefik"));
        assert_eq!(
            spec.labels.as_ref().unwrap().get("traefik.enable").map(String::as_str),
            Some("true")
        );

        let c = container(&spec);
        assert_eq!(c.image.as_deref(), Some("traefik:v3.1.2"));
        assert!(c.env.is_none());
        let mounts = c.mounts.unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].source.as_deref(), Some("/etc/dokploy/traefik/traefik.yml"));
        assert_eq!(mounts[0].target.as_deref(), Some("/etc/traefik/traefik.yml"));
        assert!(mounts.iter().all(|m| m.typ == Some(MountTypeEnum::BIND)));

        let task = spec.task_template.clone().unwrap();
        assert_eq!(
            task.networks.unwrap()[0].target.as_deref(),
            Some("dokploy-network")
        );
        assert_eq!(
            task.placement.unwrap().constraints.unwrap(),
            vec!["node.role==manager"]
        );
        assert_eq!(
            spec.mode.as_ref().unwrap().replicated.as_ref().unwrap().replicas,
            Some(1)
        );

        let ports = ports(&spec);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].target_port, Some(443));
        assert_eq!(ports[0].protocol, Some(EndpointPortConfigProtocolEnum::TCP));
        assert_eq!(ports[1].target_port, Some(80));
        assert!(ports
            .iter()
            .all(|p| p.publish_mode == Some(EndpointPortConfigPublishModeEnum::HOST)));
    }

    #[test]
    fn test_desired_spec_http3_and_dashboard() {
        let spec = template().desired_spec(&ProxyOptions {
            enable_dashboard: true,
            enable_http3: true,
            env: None,
        });
        let ports = ports(&spec);
        assert_eq!(ports.len(), 4);
        assert_eq!(ports[0].protocol, Some(EndpointPortConfigProtocolEnum::UDP));
        assert_eq!(ports[0].published_port, Some(443));
        assert_eq!(ports[3].published_port, Some(8080));
    }

    #[test]
    fn test_options_roundtrip_through_spec() {
        let t = template();
        for (dashboard, http3) in [(false, false), (true, false), (false, true), (true, true)] {
            let options = ProxyOptions {
                enable_dashboard: dashboard,
                enable_http3: http3,
                env: None,
            };
            assert_eq!(t.options_from_spec(&t.desired_spec(&options)), options);
        }
    }

    #[test]
    fn test_merge_keeps_live_env_when_desired_has_none() {
        let t = template();
        let live = with_env(t.desired_spec(&ProxyOptions::default()), &["A=1"]);
        let desired = t.desired_spec(&ProxyOptions::default());

        let merged = merge_spec(&live, &desired);
        assert_eq!(container(&merged).env, Some(vec!["A=1".to_string()]));
    }

    #[test]
    fn test_merge_keeps_live_env_when_desired_is_empty() {
        let t = template();
        let live = with_env(t.desired_spec(&ProxyOptions::default()), &["A=1"]);
        let desired = with_env(t.desired_spec(&ProxyOptions::default()), &[]);

        let merged = merge_spec(&live, &desired);
        assert_eq!(container(&merged).env, Some(vec!["A=1".to_string()]));
    }

    #[test]
    fn test_merge_desired_env_replaces_outright() {
        let t = template();
        let live = with_env(t.desired_spec(&ProxyOptions::default()), &["A=1"]);
        let desired = with_env(t.desired_spec(&ProxyOptions::default()), &["B=2"]);

        let merged = merge_spec(&live, &desired);
        assert_eq!(container(&merged).env, Some(vec!["B=2".to_string()]));
    }

    #[test]
    fn test_merge_replaces_owned_fields_wholesale() {
        let t = template();
        let mut live = t.desired_spec(&ProxyOptions {
            enable_dashboard: true,
            enable_http3: true,
            env: None,
        });
        {
            let task = live.task_template.as_mut().unwrap();
            task.placement.as_mut().unwrap().constraints =
                Some(vec!["node.labels.edge==true".to_string()]);
            task.networks = Some(vec![NetworkAttachmentConfig {
                target: Some("legacy".to_string()),
                ..Default::default()
            }]);
            task.container_spec.as_mut().unwrap().image = Some("traefik:v2.10".to_string());
        }

        let desired = t.desired_spec(&ProxyOptions::default());
        let merged = merge_spec(&live, &desired);

        assert_eq!(ports(&merged), ports(&desired));
        let task = merged.task_template.clone().unwrap();
        assert_eq!(task.networks, desired.task_template.clone().unwrap().networks);
        assert_eq!(
            task.placement.unwrap().constraints,
            Some(vec!["node.role==manager".to_string()])
        );
        assert_eq!(container(&merged).image.as_deref(), Some("traefik:v3.1.2"));
        assert_eq!(container(&merged).mounts, container(&desired).mounts);
    }

    #[test]
    fn test_merge_preserves_unowned_fields() {
        let t = template();
        let mut live = t.desired_spec(&ProxyOptions::default());
        {
            let c = live
                .task_template
                .as_mut()
                .unwrap()
                .container_spec
                .as_mut()
                .unwrap();
            c.args = Some(vec!["--log.level=DEBUG".to_string()]);
            live.labels
                .as_mut()
                .unwrap()
                .insert("owner".to_string(), "ops".to_string());
        }

        let merged = merge_spec(&live, &t.desired_spec(&ProxyOptions::default()));
        assert_eq!(
            container(&merged).args,
            Some(vec!["--log.level=DEBUG".to_string()])
        );
        let labels = merged.labels.unwrap();
        assert_eq!(labels.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(labels.get("traefik.enable").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_merge_onto_bare_live_spec() {
        let t = template();
        let desired = with_env(t.desired_spec(&ProxyOptions::default()), &["X=1"]);
        let merged = merge_spec(&ServiceSpec::default(), &desired);
        assert_eq!(ports(&merged), ports(&desired));
        assert_eq!(container(&merged).env, Some(vec!["X=1".to_string()]));
        assert_eq!(merged.name, desired.name);
    }

    #[test]
    fn test_parse_env_block() {
        let text = "\n# proxy settings\nCF_API_EMAIL=ops@example.com\n  CF_DNS_API_TOKEN=abc  \n\n";
        assert_eq!(
            parse_env_block(text),
            vec!["CF_API_EMAIL=ops@example.com", "CF_DNS_API_TOKEN=abc"]
        );
        assert!(parse_env_block("").is_empty());
    }
}
