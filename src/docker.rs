//! Docker Swarm orchestrator backed by the Docker Engine API

use crate::error::{Error, Result};
use crate::service::{LiveService, Orchestrator};
use async_trait::async_trait;
use bollard::container::PruneContainersOptions;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{Service, ServiceSpec};
use bollard::service::UpdateServiceOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

/// Swarm's error text when an update is sent against a stale version
const OUT_OF_SEQUENCE: &str = "out of sequence";

/// Seconds to wait on a daemon request before giving up
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Where to reach the Docker daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket(String),
    Http(String),
}

impl Endpoint {
    /// Pick the daemon endpoint: an explicit host wins over `DOCKER_HOST`, and
    /// the configured socket is used when neither is set.
    pub fn resolve(explicit: Option<&str>, from_env: Option<&str>, socket: &str) -> Result<Self> {
        match explicit.or(from_env).filter(|host| !host.is_empty()) {
            Some(host) => Self::parse(host),
            None => Ok(Endpoint::Socket(socket.to_string())),
        }
    }

    fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(Endpoint::Socket(path.to_string()));
        }
        if host.starts_with("tcp://") || host.starts_with("http://") {
            return Ok(Endpoint::Http(host.to_string()));
        }
        Err(Error::OrchestratorUnavailable(format!(
            "unsupported docker host '{}', use unix:// or tcp://",
            host
        )))
    }

    fn connect(&self) -> Result<Docker> {
        let connected = match self {
            Endpoint::Socket(path) => {
                Docker::connect_with_socket(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Endpoint::Http(url) => {
                Docker::connect_with_http(url, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        };
        connected.map_err(|e| Error::OrchestratorUnavailable(format!("{}: {}", self, e)))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Socket(path) => write!(f, "unix://{}", path),
            Endpoint::Http(url) => f.write_str(url),
        }
    }
}

/// Talks to the Docker daemon for image and service operations
pub struct DockerOrchestrator {
    client: Docker,
}

impl DockerOrchestrator {
    /// Connect to `endpoint` and check that the daemon answers
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let client = endpoint.connect()?;
        client.ping().await.map_err(|e| {
            Error::OrchestratorUnavailable(format!("daemon at {} is not responding: {}", endpoint, e))
        })?;
        debug!(%endpoint, "Connected to Docker daemon");
        Ok(Self { client })
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::OrchestratorUnavailable(format!(
                "failed to inspect image '{}': {}",
                image, e
            ))),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = progress.error {
                        return Err(Error::ImagePullFailure {
                            image: image.to_string(),
                            reason: error,
                        });
                    }
                }
                Err(e) => {
                    return Err(Error::ImagePullFailure {
                        image: image.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<LiveService>> {
        let service = match self.client.inspect_service(name, None).await {
            Ok(service) => service,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(service = name, "Service not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::OrchestratorUnavailable(format!(
                    "failed to inspect service '{}': {}",
                    name, e
                )))
            }
        };

        live_service(name, service).map(Some)
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()> {
        let name = spec.name.clone().unwrap_or_default();
        let response = self
            .client
            .create_service(spec.clone(), None)
            .await
            .map_err(|e| classify_write_error(&name, None, e))?;
        debug!(service = %name, id = ?response.id, "Service created");
        Ok(())
    }

    async fn update_service(&self, name: &str, version: u64, spec: &ServiceSpec) -> Result<()> {
        let options = UpdateServiceOptions {
            version,
            ..Default::default()
        };
        let response = self
            .client
            .update_service(name, spec.clone(), options, None)
            .await
            .map_err(|e| classify_write_error(name, Some(version), e))?;
        if let Some(warnings) = response.warnings {
            for warning in warnings {
                tracing::warn!(service = name, warning, "Service update warning");
            }
        }
        Ok(())
    }

    async fn prune_unused(&self) -> Result<u64> {
        let containers = self
            .client
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .map_err(|e| Error::OrchestratorUnavailable(format!("container prune failed: {}", e)))?;
        let images = self
            .client
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(|e| Error::OrchestratorUnavailable(format!("image prune failed: {}", e)))?;

        let reclaimed: u64 = [containers.space_reclaimed, images.space_reclaimed]
            .into_iter()
            .flatten()
            .map(|bytes| bytes.max(0) as u64)
            .sum();
        info!(reclaimed_bytes = reclaimed, "Docker cleanup finished");
        Ok(reclaimed)
    }
}

/// Keep the version and spec of an inspected service. Swarm always reports a
/// version, so a missing one means the daemon answered with something unusable.
fn live_service(name: &str, service: Service) -> Result<LiveService> {
    let version = service.version.and_then(|v| v.index).ok_or_else(|| {
        Error::OrchestratorUnavailable(format!("service '{}' reported no version", name))
    })?;
    Ok(LiveService {
        version,
        spec: service.spec.unwrap_or_default(),
    })
}

/// Sort a failed create or update into clean rejections and unknown outcomes.
///
/// A response from the daemon means the request was processed and refused. Any
/// other failure happened on the wire, so the write may or may not have landed.
fn classify_write_error(service: &str, version: Option<u64>, e: bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match version {
            Some(version) if status_code == 409 || message.contains(OUT_OF_SEQUENCE) => {
                Error::VersionConflict {
                    service: service.to_string(),
                    version,
                }
            }
            _ => Error::UpdateRejected {
                service: service.to_string(),
                reason: format!("{} ({})", message, status_code),
            },
        },
        other => Error::UpdateIndeterminate {
            service: service.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ObjectVersion;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_stale_version_is_conflict() {
        let err = classify_write_error(
            "dokploy-traefik",
            Some(41),
            server_error(500, "rpc error: code = Unknown desc = update out of sequence"),
        );
        match err {
            Error::VersionConflict { service, version } => {
                assert_eq!(service, "dokploy-traefik");
                assert_eq!(version, 41);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_server_error_is_clean_rejection() {
        let err = classify_write_error("svc", Some(3), server_error(400, "invalid mount config"));
        assert!(matches!(err, Error::UpdateRejected { .. }));
        assert!(!err.state_unknown());
    }

    #[test]
    fn test_create_conflict_is_rejection() {
        // Without a version there is nothing to conflict with
        let err = classify_write_error("svc", None, server_error(409, "name conflicts"));
        assert!(matches!(err, Error::UpdateRejected { .. }));
    }

    #[test]
    fn test_transport_error_is_indeterminate() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = classify_write_error("svc", Some(3), bollard::errors::Error::from(io));
        assert!(matches!(err, Error::UpdateIndeterminate { .. }));
        assert!(err.state_unknown());
    }

    #[test]
    fn test_explicit_host_wins() {
        let endpoint = Endpoint::resolve(
            Some("tcp://10.0.0.5:2375"),
            Some("unix:///run/other.sock"),
            "/var/run/docker.sock",
        )
        .unwrap();
        assert_eq!(endpoint, Endpoint::Http("tcp://10.0.0.5:2375".into()));
    }

    #[test]
    fn test_docker_host_env_before_socket() {
        let endpoint =
            Endpoint::resolve(None, Some("unix:///run/user/1000/docker.sock"), "/var/run/docker.sock")
                .unwrap();
        assert_eq!(endpoint, Endpoint::Socket("/run/user/1000/docker.sock".into()));
        assert_eq!(endpoint.to_string(), "unix:///run/user/1000/docker.sock");
    }

    #[test]
    fn test_configured_socket_is_fallback() {
        let endpoint = Endpoint::resolve(None, Some(""), "/srv/docker.sock").unwrap();
        assert_eq!(endpoint, Endpoint::Socket("/srv/docker.sock".into()));
    }

    #[test]
    fn test_unknown_scheme_is_unavailable() {
        let err = Endpoint::resolve(Some("ssh://host"), None, "/var/run/docker.sock").unwrap_err();
        assert!(matches!(err, Error::OrchestratorUnavailable(_)));
        assert!(!err.state_unknown());
    }

    #[test]
    fn test_inspected_service_keeps_version() {
        let service = Service {
            version: Some(ObjectVersion { index: Some(17) }),
            spec: Some(ServiceSpec {
                name: Some("dokploy-traefik".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let live = live_service("dokploy-traefik", service).unwrap();
        assert_eq!(live.version, 17);
        assert_eq!(live.spec.name.as_deref(), Some("dokploy-traefik"));
    }

    #[test]
    fn test_missing_version_is_unavailable() {
        let err = live_service("dokploy-traefik", Service::default()).unwrap_err();
        assert!(matches!(err, Error::OrchestratorUnavailable(_)));
    }
}
