use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Deployment environment, decides the shape of the proxy's static configuration
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: plain docker provider with a generated default rule
    Development,
    /// Swarm deployment with ACME certificates (default)
    #[default]
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// Runtime settings for the reconcilers
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Deployment environment (default: production)
    #[serde(default)]
    pub environment: Environment,

    /// Name of the managed application, used to derive router and service names
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Port the managed application listens on (default: 3000)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Plaintext port published by the proxy (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port published by the proxy (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Host directory holding the proxy's main configuration
    #[serde(default = "default_main_dir")]
    pub main_dir: PathBuf,

    /// Host directory holding the hot-reloaded routing documents
    #[serde(default = "default_dynamic_dir")]
    pub dynamic_dir: PathBuf,

    /// Where the dynamic directory is mounted inside the proxy container
    #[serde(default = "default_container_dynamic_dir")]
    pub container_dynamic_dir: String,

    /// Name of the certificate resolver declared in the main configuration
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,

    /// Placeholder ACME contact written at bootstrap
    #[serde(default = "default_acme_email")]
    pub acme_email: String,

    /// Register the nightly docker cleanup job when running
    #[serde(default)]
    pub docker_cleanup: bool,

    /// Proxy service settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Settings for the proxy service run by the orchestrator
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Service name (default: dokploy-traefik)
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Proxy image (default: traefik:v3.1.2)
    #[serde(default = "default_image")]
    pub image: String,

    /// Overlay network the service attaches to
    #[serde(default = "default_network")]
    pub network: String,

    /// Docker socket bind-mounted into the proxy
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// Placement constraint for the proxy task
    #[serde(default = "default_placement")]
    pub placement_constraint: String,

    /// Port the dashboard is published on when enabled
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            image: default_image(),
            network: default_network(),
            docker_socket: default_docker_socket(),
            placement_constraint: default_placement(),
            dashboard_port: default_dashboard_port(),
            docker_host: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            app_name: default_app_name(),
            app_port: default_app_port(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            main_dir: default_main_dir(),
            dynamic_dir: default_dynamic_dir(),
            container_dynamic_dir: default_container_dynamic_dir(),
            cert_resolver: default_cert_resolver(),
            acme_email: default_acme_email(),
            docker_cleanup: false,
            proxy: ProxyConfig::default(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "dokploy".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_main_dir() -> PathBuf {
    PathBuf::from("/etc/dokploy/traefik")
}

fn default_dynamic_dir() -> PathBuf {
    PathBuf::from("/etc/dokploy/traefik/dynamic")
}

fn default_container_dynamic_dir() -> String {
    "/etc/dokploy/traefik/dynamic".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_acme_email() -> String {
    "test@localhost.com".to_string()
}

fn default_service_name() -> String {
    "dokploy-traefik".to_string()
}

fn default_image() -> String {
    "traefik:v3.1.2".to_string()
}

fn default_network() -> String {
    "dokploy-network".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_placement() -> String {
    "node.role==manager".to_string()
}

fn default_dashboard_port() -> u16 {
    8080
}

impl Settings {
    /// Load settings from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        let settings = settings.with_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for running without a settings file
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = Settings::default().with_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `TRAEFIK_PORT`, `TRAEFIK_SSL_PORT`, `PORT` and `ROUTEKEEPER_ENV`.
    ///
    /// Values that do not parse (or parse to 0) leave the current value alone.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u16>().ok())
                .filter(|p| *p > 0)
        };

        if let Some(p) = port("TRAEFIK_PORT") {
            self.http_port = p;
        }
        if let Some(p) = port("TRAEFIK_SSL_PORT") {
            self.https_port = p;
        }
        if let Some(p) = port("PORT") {
            self.app_port = p;
        }
        if let Some(env) = lookup("ROUTEKEEPER_ENV").and_then(|v| Environment::parse(&v)) {
            self.environment = env;
        }
        self
    }

    /// Validate all settings
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.app_name.trim().is_empty() {
            errors.push("'app_name' must not be empty".to_string());
        }
        if self.proxy.service_name.trim().is_empty() {
            errors.push("'proxy.service_name' must not be empty".to_string());
        }
        if self.proxy.image.trim().is_empty() {
            errors.push("'proxy.image' must not be empty".to_string());
        }
        for (name, port) in [
            ("app_port", self.app_port),
            ("http_port", self.http_port),
            ("https_port", self.https_port),
            ("proxy.dashboard_port", self.proxy.dashboard_port),
        ] {
            if port == 0 {
                errors.push(format!("'{}' must be greater than 0", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Path of the proxy's main configuration file on the host
    pub fn main_config_path(&self) -> PathBuf {
        self.main_dir.join("traefik.yml")
    }

    /// Path of the ACME certificate store on the host
    pub fn acme_storage_path(&self) -> PathBuf {
        self.dynamic_dir.join("acme.json")
    }

    /// Upstream URL of the managed application
    pub fn app_url(&self) -> String {
        format!("http://{}:{}", self.app_name, self.app_port)
    }
}
