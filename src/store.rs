//! File-backed storage for routing documents
//!
//! One YAML file per namespace in the directory the proxy watches. Writes replace
//! the whole file through a temporary file and a rename, so the proxy never
//! hot-reloads a half-written document.

use crate::dynamic::RoutingDocument;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Namespace holding shared middleware definitions
pub const MIDDLEWARES_NAMESPACE: &str = "middlewares";

/// Loads and persists routing documents by namespace name
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    app_port: u16,
}

impl ConfigStore {
    /// Create a store over `dir`. `app_port` is the upstream port used when a
    /// default application document has to be synthesized.
    pub fn new(dir: impl Into<PathBuf>, app_port: u16) -> Self {
        Self {
            dir: dir.into(),
            app_port,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.yml", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Read and parse a document. `Ok(None)` when the file does not exist.
    pub fn read(&self, name: &str) -> Result<Option<RoutingDocument>> {
        let path = self.path(name);
        let Some(text) = read_optional(&path)? else {
            return Ok(None);
        };
        parse_document(&path, &text).map(Some)
    }

    /// Load a document, creating and persisting its default if the file is absent.
    ///
    /// A file that exists but does not parse fails with `CorruptConfig`.
    pub fn load_or_create(&self, name: &str) -> Result<RoutingDocument> {
        if let Some(doc) = self.read(name)? {
            return Ok(doc);
        }

        let doc = self.default_document(name);
        self.write(name, &doc)?;
        info!(name, path = %self.path(name).display(), "Created default routing document");
        Ok(doc)
    }

    /// Persist `doc` if no file exists yet. Returns whether it was written.
    pub fn create_if_absent(&self, name: &str, doc: &RoutingDocument) -> Result<bool> {
        if self.exists(name) {
            info!(name, "Routing document already exists");
            return Ok(false);
        }
        self.write(name, doc)?;
        info!(name, path = %self.path(name).display(), "Created routing document");
        Ok(true)
    }

    /// Replace the whole document
    pub fn write(&self, name: &str, doc: &RoutingDocument) -> Result<()> {
        let text = serde_yaml::to_string(doc)?;
        write_atomic(&self.path(name), &text)?;
        debug!(name, "Routing document written");
        Ok(())
    }

    /// Raw file contents for operator editing. `Ok(None)` when the file does not exist.
    pub fn read_raw(&self, name: &str) -> Result<Option<String>> {
        read_optional(&self.path(name))
    }

    /// Replace a document with operator-supplied text.
    ///
    /// The text must parse as a routing document; otherwise the file is left as it was.
    pub fn write_raw(&self, name: &str, text: &str) -> Result<()> {
        let path = self.path(name);
        serde_yaml::from_str::<RoutingDocument>(text)
            .map_err(|source| Error::InvalidDocument {
                path: path.clone(),
                source,
            })?;
        write_atomic(&path, text)?;
        info!(name, "Routing document replaced by operator");
        Ok(())
    }

    /// The document `load_or_create` would write for `name`
    pub fn default_document(&self, name: &str) -> RoutingDocument {
        if name == MIDDLEWARES_NAMESPACE {
            RoutingDocument::default_middlewares()
        } else {
            let url = format!("http://{}:{}", name, self.app_port);
            RoutingDocument::default_for_app(name, &url)
        }
    }
}

fn parse_document(path: &Path, text: &str) -> Result<RoutingDocument> {
    // An empty file is a valid, empty document
    if text.trim().is_empty() {
        return Ok(RoutingDocument::default());
    }
    serde_yaml::from_str(text).map_err(|source| Error::CorruptConfig {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Replace `path` with `contents` via a temporary file in the same directory
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::REDIRECT_TO_HTTPS;
    use tempfile::TempDir;

    fn create_store() -> (ConfigStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = ConfigStore::new(tmp.path().join("dynamic"), 3000);
        (store, tmp)
    }

    #[test]
    fn test_load_or_create_synthesizes_default() {
        let (store, _tmp) = create_store();
        assert!(!store.exists("dokploy"));

        let doc = store.load_or_create("dokploy").unwrap();
        assert!(store.exists("dokploy"));
        assert_eq!(
            doc.router("dokploy-router-app").unwrap().service,
            "dokploy-service-app"
        );
        let lb = doc
            .service("dokploy-service-app")
            .unwrap()
            .load_balancer
            .as_ref()
            .unwrap();
        assert_eq!(lb.servers[0].url, "http://dokploy:3000");
    }

    #[test]
    fn test_load_or_create_reads_existing() {
        let (store, _tmp) = create_store();
        let first = store.load_or_create("dokploy").unwrap();
        let second = store.load_or_create("dokploy").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_is_not_replaced() {
        let (store, _tmp) = create_store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.path("dokploy"), "http: [unclosed").unwrap();

        let err = store.load_or_create("dokploy").unwrap_err();
        assert!(matches!(err, Error::CorruptConfig { .. }));

        // The operator's file is untouched
        let raw = std::fs::read_to_string(store.path("dokploy")).unwrap();
        assert_eq!(raw, "http: [unclosed");
    }

    #[test]
    fn test_empty_file_is_empty_document() {
        let (store, _tmp) = create_store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.path("custom"), "").unwrap();

        let doc = store.read("custom").unwrap().unwrap();
        assert_eq!(doc, RoutingDocument::default());
    }

    #[test]
    fn test_middlewares_default() {
        let (store, _tmp) = create_store();
        let doc = store.load_or_create(MIDDLEWARES_NAMESPACE).unwrap();
        let http = doc.http.unwrap();
        assert!(http.middlewares.contains_key(REDIRECT_TO_HTTPS));
        assert!(http.routers.is_empty());
    }

    #[test]
    fn test_create_if_absent_keeps_existing() {
        let (store, _tmp) = create_store();
        let doc = RoutingDocument::default_for_app("dokploy", "http://dokploy:3000");
        assert!(store.create_if_absent("dokploy", &doc).unwrap());

        let other = RoutingDocument::default_for_app("dokploy", "http://elsewhere:1");
        assert!(!store.create_if_absent("dokploy", &other).unwrap());
        assert_eq!(store.read("dokploy").unwrap().unwrap(), doc);
    }

    #[test]
    fn test_write_raw_rejects_unparseable_text() {
        let (store, _tmp) = create_store();
        let original = store.load_or_create("dokploy").unwrap();

        let err = store.write_raw("dokploy", "http:\n  routers: [").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
        assert_eq!(store.read("dokploy").unwrap().unwrap(), original);
    }

    #[test]
    fn test_write_raw_roundtrip() {
        let (store, _tmp) = create_store();
        let text = "http:\n  routers:\n    a:\n      rule: Host(`a.test`)\n      service: s\n      entryPoints: [web]\n";
        store.write_raw("custom", text).unwrap();
        assert_eq!(store.read_raw("custom").unwrap().as_deref(), Some(text));
        assert!(store.read("custom").unwrap().unwrap().router("a").is_some());
    }

    #[test]
    fn test_read_missing() {
        let (store, _tmp) = create_store();
        assert!(store.read("nothing").unwrap().is_none());
        assert!(store.read_raw("nothing").unwrap().is_none());
    }
}
