//! Generation and surgical editing of the proxy's main (static) configuration
//!
//! The document is generated once from typed structs. After that it belongs to the
//! operator: every later change edits a single key of the parsed YAML tree and leaves
//! everything else, including keys this crate does not model, as it was.

use crate::config::{Environment, Settings};
use crate::dynamic::{WEBSECURE_ENTRYPOINT, WEB_ENTRYPOINT};
use crate::error::{Error, Result};
use crate::store::{read_optional, write_atomic};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainConfig {
    pub providers: Providers,

    #[serde(rename = "entryPoints")]
    pub entry_points: EntryPoints,

    pub api: ApiConfig,

    #[serde(
        rename = "certificatesResolvers",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificates_resolvers: Option<BTreeMap<String, CertificateResolver>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Providers {
    #[serde(flatten)]
    pub runtime: RuntimeProviders,
    pub file: FileProvider,
}

/// Container discovery, shaped by the deployment environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeProviders {
    Production {
        swarm: SwarmProvider,
        docker: DockerProvider,
    },
    Development {
        docker: DevDockerProvider,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmProvider {
    pub exposed_by_default: bool,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerProvider {
    pub exposed_by_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevDockerProvider {
    pub default_rule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProvider {
    pub directory: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub web: EntryPoint,
    pub websecure: EntryPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: String,

    /// Present iff HTTP/3 is enabled. The proxy treats the key itself as the switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http3: Option<Http3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<EntryPointHttp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Http3 {
    pub advertised_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointHttp {
    pub tls: EntryPointTls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPointTls {
    pub cert_resolver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateResolver {
    pub acme: AcmeResolver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeResolver {
    pub email: String,
    pub storage: String,
    pub http_challenge: HttpChallenge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpChallenge {
    pub entry_point: String,
}

/// Builds the main configuration for one environment
#[derive(Debug, Clone)]
pub struct MainConfigBuilder {
    environment: Environment,
    http_port: u16,
    https_port: u16,
    container_dynamic_dir: String,
    cert_resolver: String,
    acme_email: String,
    http3: bool,
}

impl MainConfigBuilder {
    pub fn new(settings: &Settings) -> Self {
        Self {
            environment: settings.environment,
            http_port: settings.http_port,
            https_port: settings.https_port,
            container_dynamic_dir: settings.container_dynamic_dir.clone(),
            cert_resolver: settings.cert_resolver.clone(),
            acme_email: settings.acme_email.clone(),
            http3: false,
        }
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn http3(mut self, enabled: bool) -> Self {
        self.http3 = enabled;
        self
    }

    pub fn build(self) -> MainConfig {
        let (runtime, tls, resolvers) = match self.environment {
            Environment::Development => (
                RuntimeProviders::Development {
                    docker: DevDockerProvider {
                        default_rule: "Host(`{{ trimPrefix `/` .Name }}.docker.localhost`)"
                            .to_string(),
                    },
                },
                None,
                None,
            ),
            Environment::Production => {
                let resolver = CertificateResolver {
                    acme: AcmeResolver {
                        email: self.acme_email.clone(),
                        storage: format!("{}/acme.json", self.container_dynamic_dir),
                        http_challenge: HttpChallenge {
                            entry_point: WEB_ENTRYPOINT.to_string(),
                        },
                    },
                };
                (
                    RuntimeProviders::Production {
                        swarm: SwarmProvider {
                            exposed_by_default: false,
                            watch: false,
                        },
                        docker: DockerProvider {
                            exposed_by_default: false,
                        },
                    },
                    Some(EntryPointHttp {
                        tls: EntryPointTls {
                            cert_resolver: self.cert_resolver.clone(),
                        },
                    }),
                    Some(BTreeMap::from([(self.cert_resolver.clone(), resolver)])),
                )
            }
        };

        MainConfig {
            providers: Providers {
                runtime,
                file: FileProvider {
                    directory: self.container_dynamic_dir.clone(),
                    watch: true,
                },
            },
            entry_points: EntryPoints {
                web: EntryPoint {
                    address: format!(":{}", self.http_port),
                    http3: None,
                    http: None,
                },
                websecure: EntryPoint {
                    address: format!(":{}", self.https_port),
                    http3: self.http3.then_some(Http3 {
                        advertised_port: self.https_port,
                    }),
                    http: tls,
                },
            },
            api: ApiConfig { insecure: true },
            certificates_resolvers: resolvers,
        }
    }
}

/// Outcome of a bootstrap attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Bootstrap {
    /// No main configuration existed; this one was written
    Created(MainConfig),
    /// A main configuration already existed and was left untouched
    AlreadyExists,
}

/// Owns the main configuration file
#[derive(Debug, Clone)]
pub struct StaticConfig {
    path: PathBuf,
    acme_storage: PathBuf,
    builder: MainConfigBuilder,
    https_port: u16,
    cert_resolver: String,
    access_log_path: String,
}

impl StaticConfig {
    pub fn new(settings: &Settings) -> Self {
        Self {
            path: settings.main_config_path(),
            acme_storage: settings.acme_storage_path(),
            builder: MainConfigBuilder::new(settings),
            https_port: settings.https_port,
            cert_resolver: settings.cert_resolver.clone(),
            access_log_path: format!("{}/access.log", settings.container_dynamic_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the main configuration unless one already exists
    pub fn bootstrap(&self, enable_http3: bool) -> Result<Bootstrap> {
        restrict_acme_storage(&self.acme_storage)?;

        if self.exists() {
            info!(path = %self.path.display(), "Main config already exists");
            return Ok(Bootstrap::AlreadyExists);
        }

        let config = self.builder.clone().http3(enable_http3).build();
        write_atomic(&self.path, &serde_yaml::to_string(&config)?)?;
        info!(path = %self.path.display(), http3 = enable_http3, "Main config created");
        Ok(Bootstrap::Created(config))
    }

    /// Insert or delete `entryPoints.websecure.http3`
    pub fn set_http3(&self, enabled: bool) -> Result<()> {
        let mut doc = self.load()?;
        let websecure = entry_point_mut(&mut doc, WEBSECURE_ENTRYPOINT).ok_or_else(|| {
            Error::precondition(format!(
                "{} has no '{}' entry point",
                self.path.display(),
                WEBSECURE_ENTRYPOINT
            ))
        })?;

        if enabled {
            let mut http3 = Mapping::new();
            http3.insert("advertisedPort".into(), Value::from(self.https_port));
            websecure.insert("http3".into(), Value::Mapping(http3));
        } else {
            websecure.shift_remove("http3");
        }

        self.save(&doc)?;
        info!(enabled, "HTTP/3 toggled in main config");
        Ok(())
    }

    pub fn http3_enabled(&self) -> Result<bool> {
        let mut doc = self.load()?;
        Ok(entry_point_mut(&mut doc, WEBSECURE_ENTRYPOINT)
            .is_some_and(|ep| ep.contains_key("http3")))
    }

    /// Insert or delete the `accessLog` section
    pub fn set_access_log(&self, enabled: bool) -> Result<()> {
        let mut doc = self.load()?;
        let root = root_mapping(&mut doc, &self.path)?;

        if enabled {
            root.insert("accessLog".into(), self.access_log_section());
        } else {
            root.shift_remove("accessLog");
        }

        self.save(&doc)?;
        info!(enabled, "Access log toggled in main config");
        Ok(())
    }

    pub fn access_log_enabled(&self) -> Result<bool> {
        let doc = self.load()?;
        Ok(doc
            .get("accessLog")
            .and_then(|log| log.get("filePath"))
            .is_some())
    }

    /// Set the ACME contact on the configured resolver.
    ///
    /// No-op when `email` is absent or the document declares no such resolver.
    pub fn update_lets_encrypt_email(&self, email: Option<&str>) -> Result<()> {
        let Some(email) = email.filter(|e| !e.trim().is_empty()) else {
            return Ok(());
        };

        let mut doc = self.load()?;
        let acme = doc
            .get_mut("certificatesResolvers")
            .and_then(|r| r.get_mut(self.cert_resolver.as_str()))
            .and_then(|r| r.get_mut("acme"))
            .and_then(Value::as_mapping_mut);

        let Some(acme) = acme else {
            debug!(resolver = %self.cert_resolver, "No ACME resolver in main config, email not updated");
            return Ok(());
        };

        acme.insert("email".into(), Value::from(email));
        self.save(&doc)?;
        info!(resolver = %self.cert_resolver, "ACME email updated");
        Ok(())
    }

    pub fn read_raw(&self) -> Result<Option<String>> {
        read_optional(&self.path)
    }

    /// Replace the main configuration with operator-supplied text, which must parse
    pub fn write_raw(&self, text: &str) -> Result<()> {
        serde_yaml::from_str::<Value>(text).map_err(|source| Error::InvalidDocument {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, text)?;
        info!(path = %self.path.display(), "Main config replaced by operator");
        Ok(())
    }

    /// Put back text captured by `read_raw` after a later step failed
    pub fn restore(&self, snapshot: &str) -> Result<()> {
        write_atomic(&self.path, snapshot)?;
        debug!(path = %self.path.display(), "Main config restored");
        Ok(())
    }

    fn load(&self) -> Result<Value> {
        let text = read_optional(&self.path)?.ok_or_else(|| {
            Error::precondition(format!(
                "main config {} does not exist yet, bootstrap must run first",
                self.path.display()
            ))
        })?;
        serde_yaml::from_str(&text).map_err(|source| Error::CorruptConfig {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, doc: &Value) -> Result<()> {
        write_atomic(&self.path, &serde_yaml::to_string(doc)?)
    }

    fn access_log_section(&self) -> Value {
        let mut filters = Mapping::new();
        filters.insert("retryAttempts".into(), true.into());
        filters.insert("minDuration".into(), "10ms".into());

        let mut section = Mapping::new();
        section.insert("filePath".into(), self.access_log_path.as_str().into());
        section.insert("format".into(), "json".into());
        section.insert("bufferingSize".into(), 100.into());
        section.insert("filters".into(), Value::Mapping(filters));
        Value::Mapping(section)
    }
}

fn root_mapping<'a>(doc: &'a mut Value, path: &Path) -> Result<&'a mut Mapping> {
    doc.as_mapping_mut().ok_or_else(|| {
        Error::precondition(format!("{} is not a mapping at the top level", path.display()))
    })
}

fn entry_point_mut<'a>(doc: &'a mut Value, name: &str) -> Option<&'a mut Mapping> {
    doc.get_mut("entryPoints")
        .and_then(|eps| eps.get_mut(name))
        .and_then(Value::as_mapping_mut)
}

/// The proxy refuses an ACME store readable by others
#[cfg(unix)]
fn restrict_acme_storage(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io(path, e))?;
    debug!(path = %path.display(), "ACME storage permissions set to 0600");
    Ok(())
}

#[cfg(not(unix))]
fn restrict_acme_storage(path: &Path) -> Result<()> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "Cannot restrict ACME storage permissions on this platform");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir, environment: Environment) -> Settings {
        Settings {
            environment,
            main_dir: tmp.path().join("traefik"),
            dynamic_dir: tmp.path().join("traefik/dynamic"),
            ..Default::default()
        }
    }

    fn reload(config: &StaticConfig) -> Value {
        let text = std::fs::read_to_string(config.path()).unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn test_production_shape() {
        let config = MainConfigBuilder::new(&Settings::default()).build();

        assert!(matches!(config.providers.runtime, RuntimeProviders::Production { .. }));
        assert_eq!(config.providers.file.directory, "/etc/dokploy/traefik/dynamic");
        assert!(config.providers.file.watch);
        assert_eq!(config.entry_points.web.address, ":80");
        assert_eq!(config.entry_points.websecure.address, ":443");
        assert!(config.entry_points.websecure.http3.is_none());
        assert_eq!(
            config.entry_points.websecure.http.as_ref().unwrap().tls.cert_resolver,
            "letsencrypt"
        );
        let resolvers = config.certificates_resolvers.unwrap();
        let acme = &resolvers["letsencrypt"].acme;
        assert_eq!(acme.storage, "/etc/dokploy/traefik/dynamic/acme.json");
        assert_eq!(acme.http_challenge.entry_point, "web");
    }

    #[test]
    fn test_development_shape() {
        let config = MainConfigBuilder::new(&Settings::default())
            .environment(Environment::Development)
            .build();

        assert!(matches!(config.providers.runtime, RuntimeProviders::Development { .. }));
        assert!(config.certificates_resolvers.is_none());
        assert!(config.entry_points.websecure.http.is_none());

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("defaultRule"));
        assert!(!yaml.contains("swarm"));
        assert!(!yaml.contains("certificatesResolvers"));
        assert!(!yaml.contains("http3"));
    }

    #[test]
    fn test_production_yaml_flattens_providers() {
        let config = MainConfigBuilder::new(&Settings::default()).build();
        let value = serde_yaml::to_value(&config).unwrap();
        let providers = value.get("providers").unwrap();
        assert_eq!(
            providers.get("swarm").and_then(|s| s.get("exposedByDefault")),
            Some(&Value::Bool(false))
        );
        assert!(providers.get("docker").is_some());
        assert!(providers.get("file").is_some());

        let back: MainConfig = serde_yaml::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_bootstrap_writes_once() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));

        assert!(matches!(config.bootstrap(false).unwrap(), Bootstrap::Created(_)));
        std::fs::write(config.path(), "entryPoints:\n  web:\n    address: ':8000'\n").unwrap();

        assert_eq!(config.bootstrap(true).unwrap(), Bootstrap::AlreadyExists);
        let raw = std::fs::read_to_string(config.path()).unwrap();
        assert!(raw.contains(":8000"));
    }

    #[test]
    fn test_bootstrap_with_http3() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        config.bootstrap(true).unwrap();

        let doc = reload(&config);
        let port = doc["entryPoints"]["websecure"]["http3"]["advertisedPort"].as_u64();
        assert_eq!(port, Some(443));
        assert!(config.http3_enabled().unwrap());
    }

    #[test]
    fn test_http3_toggle_symmetry() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        config.bootstrap(false).unwrap();
        let never_enabled = reload(&config);

        config.set_http3(true).unwrap();
        assert!(config.http3_enabled().unwrap());
        config.set_http3(false).unwrap();

        let doc = reload(&config);
        assert!(doc["entryPoints"]["websecure"].get("http3").is_none());
        assert_eq!(doc, never_enabled);
    }

    #[test]
    fn test_set_http3_requires_bootstrap() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));

        let err = config.set_http3(true).unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)));
        assert!(!config.exists());
    }

    #[test]
    fn test_set_http3_keeps_operator_keys() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        std::fs::create_dir_all(tmp.path().join("traefik")).unwrap();
        std::fs::write(
            config.path(),
            r#"
log:
  level: DEBUG
entryPoints:
  web:
    address: ":80"
  websecure:
    address: ":443"
    transport:
      respondingTimeouts:
        readTimeout: 42s
  metrics:
    address: ":8082"
"#,
        )
        .unwrap();

        config.set_http3(true).unwrap();
        let doc = reload(&config);
        assert_eq!(doc["log"]["level"].as_str(), Some("DEBUG"));
        assert_eq!(doc["entryPoints"]["metrics"]["address"].as_str(), Some(":8082"));
        assert_eq!(
            doc["entryPoints"]["websecure"]["transport"]["respondingTimeouts"]["readTimeout"]
                .as_str(),
            Some("42s")
        );
        assert_eq!(
            doc["entryPoints"]["websecure"]["http3"]["advertisedPort"].as_u64(),
            Some(443)
        );
    }

    #[test]
    fn test_corrupt_main_config() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        std::fs::create_dir_all(tmp.path().join("traefik")).unwrap();
        std::fs::write(config.path(), "entryPoints: [").unwrap();

        let err = config.set_http3(false).unwrap_err();
        assert!(matches!(err, Error::CorruptConfig { .. }));
    }

    #[test]
    fn test_access_log_toggle() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        config.bootstrap(false).unwrap();
        assert!(!config.access_log_enabled().unwrap());

        config.set_access_log(true).unwrap();
        assert!(config.access_log_enabled().unwrap());
        let doc = reload(&config);
        assert_eq!(
            doc["accessLog"]["filePath"].as_str(),
            Some("/etc/dokploy/traefik/dynamic/access.log")
        );
        assert_eq!(doc["accessLog"]["filters"]["minDuration"].as_str(), Some("10ms"));

        config.set_access_log(false).unwrap();
        assert!(!config.access_log_enabled().unwrap());
        assert!(reload(&config).get("accessLog").is_none());
    }

    #[test]
    fn test_update_lets_encrypt_email() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        config.bootstrap(false).unwrap();

        config.update_lets_encrypt_email(Some("ops@example.com")).unwrap();
        let doc = reload(&config);
        assert_eq!(
            doc["certificatesResolvers"]["letsencrypt"]["acme"]["email"].as_str(),
            Some("ops@example.com")
        );

        // Absent email leaves the previous one
        config.update_lets_encrypt_email(None).unwrap();
        let doc = reload(&config);
        assert_eq!(
            doc["certificatesResolvers"]["letsencrypt"]["acme"]["email"].as_str(),
            Some("ops@example.com")
        );
    }

    #[test]
    fn test_update_email_without_resolver_is_noop() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Development));
        config.bootstrap(false).unwrap();
        let before = reload(&config);

        config.update_lets_encrypt_email(Some("ops@example.com")).unwrap();
        assert_eq!(reload(&config), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_bootstrap_restricts_acme_storage() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, Environment::Production);
        std::fs::create_dir_all(&settings.dynamic_dir).unwrap();
        std::fs::write(settings.acme_storage_path(), "{}").unwrap();
        std::fs::set_permissions(
            settings.acme_storage_path(),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        StaticConfig::new(&settings).bootstrap(false).unwrap();
        let mode = std::fs::metadata(settings.acme_storage_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_raw_validates() {
        let tmp = TempDir::new().unwrap();
        let config = StaticConfig::new(&settings(&tmp, Environment::Production));
        config.bootstrap(false).unwrap();
        let before = config.read_raw().unwrap();

        let err = config.write_raw("entryPoints: {").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
        assert_eq!(config.read_raw().unwrap(), before);

        config.write_raw("api:\n  insecure: false\n").unwrap();
        assert_eq!(reload(&config)["api"]["insecure"].as_bool(), Some(false));
    }
}
