//! Per-device client identity, persisted across restarts.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crowdlink_common::new_client_id;

/// Resolves and persists the per-device client identifier.
///
/// An explicitly supplied id is always reused verbatim. Otherwise a
/// previously persisted id is restored, so a restart without an explicit
/// id recovers the same identity. Only a freshly generated id is written
/// back. Persistence is best-effort: if the storage medium is
/// unavailable the id lives in memory for this process only, and session
/// setup is never blocked.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: Option<PathBuf>,
}

impl IdentityStore {
    /// Store backed by the platform data directory.
    pub fn new() -> Self {
        Self {
            path: dirs::data_dir().map(|dir| dir.join("crowdlink").join("client-id")),
        }
    }

    /// Store backed by an explicit file path.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Store with no persistence at all.
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    /// Resolve the client identity for a new session.
    pub fn resolve(&self, existing: Option<&str>) -> String {
        if let Some(id) = existing {
            return id.to_string();
        }
        if let Some(saved) = self.load() {
            return saved;
        }
        let id = new_client_id();
        self.persist(&id);
        id
    }

    fn load(&self) -> Option<String> {
        let path = self.path.as_ref()?;
        match fs::read_to_string(path) {
            Ok(contents) => {
                let id = contents.trim();
                if id.is_empty() {
                    None
                } else {
                    Some(id.to_string())
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "could not read client id");
                }
                None
            }
        }
    }

    fn persist(&self, id: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                debug!(path = %parent.display(), error = %e, "client id not persisted");
                return;
            }
        }
        if let Err(e) = fs::write(path, id) {
            debug!(path = %path.display(), error = %e, "client id not persisted");
        }
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_reused_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::with_path(dir.path().join("client-id"));
        assert_eq!(store.resolve(Some("abc-123")), "abc-123");
        // An explicit id is never written back.
        assert!(!dir.path().join("client-id").exists());
    }

    #[test]
    fn generated_id_persists_across_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::with_path(dir.path().join("client-id"));
        let first = store.resolve(None);
        let second = store.resolve(None);
        assert_eq!(first, second);
    }

    #[test]
    fn fresh_store_reads_prior_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-id");
        let first = IdentityStore::with_path(path.clone()).resolve(None);
        let second = IdentityStore::with_path(path).resolve(None);
        assert_eq!(first, second);
    }

    #[test]
    fn in_memory_store_still_resolves() {
        let store = IdentityStore::in_memory();
        let a = store.resolve(None);
        let b = store.resolve(None);
        assert!(!a.is_empty());
        // No medium, so every resolve without an explicit id is fresh.
        assert_ne!(a, b);
    }

    #[test]
    fn unwritable_path_falls_back_silently() {
        let store = IdentityStore::with_path(PathBuf::from("/dev/null/not/a/dir/client-id"));
        let id = store.resolve(None);
        assert!(!id.is_empty());
    }
}
