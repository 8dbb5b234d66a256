use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use cb_domain::{Error, Result};

use crate::entry::SessionEntry;
use crate::key::{alias, build_agent_main_session_key};

/// Single JSON file per agent holding `key -> SessionEntry`.
///
/// All writes go through [`SessionStore::update`], which reads, invokes a
/// mutator, and writes back atomically (temp file + rename) under a
/// per-path mutex (spec §4.C, §9: "readers always reload from disk for
/// liveness" — there is deliberately no in-memory cache promoted to
/// source of truth; every read re-parses the file).
pub struct SessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load_all(&self) -> Result<HashMap<String, SessionEntry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                if raw.trim().is_empty() {
                    Ok(HashMap::new())
                } else {
                    serde_json::from_str(&raw).map_err(Error::from)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn write_all_atomic(&self, data: &HashMap<String, SessionEntry>) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let body = serde_json::to_string_pretty(data)?;
        use std::io::Write;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Direct lookup: no resolution chain.
    pub fn get(&self, key: &str) -> Result<Option<SessionEntry>> {
        Ok(self.load_all()?.remove(key))
    }

    /// Resolution-order lookup (spec §4.C): `k`, `agent:<default>:k`,
    /// `agent:<default>:<alias(k)>`, then the canonical main key for
    /// `default_agent`. Returns the first hit, or `None`.
    pub fn resolve(&self, key: &str, default_agent: &str) -> Result<Option<SessionEntry>> {
        let all = self.load_all()?;

        if let Some(e) = all.get(key) {
            return Ok(Some(e.clone()));
        }

        let namespaced = format!("agent:{default_agent}:{key}");
        if let Some(e) = all.get(&namespaced) {
            return Ok(Some(e.clone()));
        }

        let aliased = format!("agent:{default_agent}:{}", alias(key));
        if let Some(e) = all.get(&aliased) {
            return Ok(Some(e.clone()));
        }

        let main = build_agent_main_session_key(default_agent);
        Ok(all.get(&main).cloned())
    }

    /// Atomic read-modify-write. `mutator` receives the current entry for
    /// `key` (creating one via `make_default` if absent) and mutates it in
    /// place; the whole file is rewritten atomically afterward.
    pub async fn update<F>(&self, key: &str, make_default: impl FnOnce() -> SessionEntry, mutator: F) -> Result<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let _guard = self.write_lock.lock().await;
        let mut all = self.load_all()?;
        let mut entry = all.remove(key).unwrap_or_else(make_default);
        mutator(&mut entry);
        all.insert(key.to_string(), entry.clone());
        self.write_all_atomic(&all)?;
        Ok(entry)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.load_all()?.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SessionEntry;

    fn temp_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        (dir, SessionStore::new(path))
    }

    #[tokio::test]
    async fn update_creates_file_atomically() {
        let (_dir, store) = temp_store();
        store
            .update(
                "agent:main:dm:+1",
                || SessionEntry::new("s1", "telegram"),
                |_| {},
            )
            .await
            .unwrap();
        let got = store.get("agent:main:dm:+1").unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let (_dir, store) = temp_store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_falls_through_chain() {
        let (_dir, store) = temp_store();
        store
            .update(
                "agent:main:dm:main",
                || SessionEntry::new("main-sess", "telegram"),
                |_| {},
            )
            .await
            .unwrap();

        // Nothing matches the raw key or the namespaced/aliased forms,
        // so resolution falls through to the canonical main key.
        let resolved = store.resolve("+9999", "main").unwrap();
        assert_eq!(resolved.unwrap().session_id, "main-sess");
    }

    #[tokio::test]
    async fn resolve_prefers_exact_match() {
        let (_dir, store) = temp_store();
        store
            .update("literal-key", || SessionEntry::new("exact", "telegram"), |_| {})
            .await
            .unwrap();
        store
            .update(
                "agent:main:dm:main",
                || SessionEntry::new("main-sess", "telegram"),
                |_| {},
            )
            .await
            .unwrap();

        let resolved = store.resolve("literal-key", "main").unwrap();
        assert_eq!(resolved.unwrap().session_id, "exact");
    }

    #[tokio::test]
    async fn update_mutates_existing_entry() {
        let (_dir, store) = temp_store();
        store
            .update("k", || SessionEntry::new("s1", "telegram"), |_| {})
            .await
            .unwrap();
        store
            .update("k", || SessionEntry::new("unused", "x"), |e| {
                e.set_provider_model_override("anthropic".into(), "claude".into())
            })
            .await
            .unwrap();

        let entry = store.get("k").unwrap().unwrap();
        assert_eq!(entry.session_id, "s1");
        assert_eq!(entry.model_override.as_deref(), Some("claude"));
    }
}
