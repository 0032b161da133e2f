//! JSON file store
//!
//! Keeps every pool document in a single JSON file. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and a tokio Mutex
//! serializes read-modify-write cycles within the process.
//!
//! Pulls always re-read the file so that writes from other processes sharing
//! the file are observed. Waiting pulls re-check on every in-process push and
//! at least every `wait_poll_interval` for writes made elsewhere.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::document::{PoolDocument, PoolUpdate, StoreState};
use crate::error::{Error, Result};
use crate::{IdentityStore, WaitCondition};

/// Default re-check interval for waiting pulls.
const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Store backed by one JSON file.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    version: watch::Sender<u64>,
    wait_poll_interval: Duration,
}

impl FileStore {
    /// Open the store file at `path`.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with no pools).
    /// An existing file must parse, so a corrupt store is reported at startup.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Io(format!("checking store file: {e}")))?
        {
            let state = read_state(&path).await?;
            info!(path = %path.display(), pools = state.len(), "opened identity store");
        } else {
            info!(path = %path.display(), "store file not found, starting with empty store");
            write_atomic(&path, &StoreState::new()).await?;
        }

        let (version, _) = watch::channel(0);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            version,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        })
    }

    /// Override how often waiting pulls re-read the file.
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty document for `pool` unless one exists.
    pub async fn ensure_pool(&self, pool: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = read_state(&self.path).await?;
        if state.contains_key(pool) {
            return Ok(());
        }
        state.insert(pool.to_string(), PoolDocument::default());
        write_atomic(&self.path, &state).await?;
        self.version.send_modify(|v| *v += 1);
        debug!(pool, "created empty pool document");
        Ok(())
    }
}

impl IdentityStore for FileStore {
    fn pull<'a>(
        &'a self,
        pool: &'a str,
        wait: Option<WaitCondition>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PoolDocument>>> + Send + 'a>> {
        Box::pin(async move {
            let Some(wait) = wait else {
                return Ok(read_state(&self.path).await?.remove(pool));
            };

            let mut changes = self.version.subscribe();
            let mut announced = false;
            loop {
                let doc = read_state(&self.path).await?.remove(pool);
                if wait.is_satisfied(doc.as_ref()) {
                    return Ok(doc);
                }
                if !announced {
                    info!(pool, path = %self.path.display(), "{}", wait.message);
                    announced = true;
                }
                tokio::select! {
                    changed = changes.changed() => {
                        changed.map_err(|_| Error::Closed(format!("file store dropped while {}", wait.message)))?;
                    }
                    _ = tokio::time::sleep(self.wait_poll_interval) => {}
                }
            }
        })
    }

    fn push<'a>(
        &'a self,
        pool: &'a str,
        update: PoolUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<PoolDocument>> + Send + 'a>> {
        Box::pin(async move {
            let doc = {
                let _guard = self.write_lock.lock().await;
                let mut state = read_state(&self.path).await?;
                let doc = state.entry(pool.to_string()).or_default();
                update.apply_to(doc);
                let doc = doc.clone();
                write_atomic(&self.path, &state).await?;
                doc
            };
            self.version.send_modify(|v| *v += 1);
            Ok(doc)
        })
    }
}

/// Read and parse the whole store file.
async fn read_state(path: &Path) -> Result<StoreState> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
    serde_json::from_str(&contents).map_err(|e| Error::Parse(format!("parsing store file: {e}")))
}

/// Write the store to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// identity payloads usually carry credentials.
async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("identities");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StoredIdentity;
    use std::sync::Arc;

    fn update_with(id: &str, deprecated: u32) -> PoolUpdate {
        let mut update = PoolUpdate::default();
        update.identities.insert(
            id.to_string(),
            Some(StoredIdentity {
                data: serde_json::json!({"token": format!("tk_{id}")}),
                deprecated,
                last_time_used: 1_700_000_000_000,
                locked: None,
            }),
        );
        update
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");

        assert!(!path.exists());
        let store = FileStore::open(path.clone()).await.unwrap();
        assert!(path.exists());
        assert!(store.pull("any", None).await.unwrap().is_none());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: StoreState = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(&path, "not json {{").unwrap();

        let result = FileStore::open(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn push_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.push("scraper", update_with("a", 1)).await.unwrap();

        let reopened = FileStore::open(path).await.unwrap();
        let doc = reopened.pull("scraper", None).await.unwrap().unwrap();
        assert_eq!(doc.identities["a"].deprecated, 1);
        assert_eq!(doc.identities["a"].data["token"], "tk_a");
    }

    #[tokio::test]
    async fn on_disk_layout_nests_identities_under_pool_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.push("scraper", update_with("a", 0)).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(
            raw["scraper"]["identities"]["a"]["lastTimeUsed"],
            1_700_000_000_000u64
        );
    }

    #[tokio::test]
    async fn null_entry_removes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("identities.json"))
            .await
            .unwrap();
        store.push("p", update_with("a", 0)).await.unwrap();
        store.push("p", update_with("b", 0)).await.unwrap();

        let mut removal = PoolUpdate::default();
        removal.identities.insert("a".into(), None);
        let doc = store.push("p", removal).await.unwrap();

        assert!(!doc.identities.contains_key("a"));
        assert!(doc.identities.contains_key("b"));
    }

    #[tokio::test]
    async fn ensure_pool_creates_document_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("identities.json"))
            .await
            .unwrap();
        store.ensure_pool("p").await.unwrap();
        store.push("p", update_with("a", 0)).await.unwrap();
        store.ensure_pool("p").await.unwrap();

        let doc = store.pull("p", None).await.unwrap().unwrap();
        assert_eq!(doc.identities.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        let store = FileStore::open(path.clone()).await.unwrap();
        store.push("p", update_with("a", 0)).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "store file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn waiting_pull_observes_write_from_other_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");

        let waiter_store = Arc::new(
            FileStore::open(path.clone())
                .await
                .unwrap()
                .with_wait_poll_interval(Duration::from_millis(10)),
        );
        let writer_store = FileStore::open(path).await.unwrap();

        let waiter = {
            let store = waiter_store.clone();
            tokio::spawn(async move {
                store
                    .pull("p", Some(WaitCondition::non_empty("p")))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        writer_store.push("p", update_with("a", 0)).await.unwrap();
        let doc = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(doc.identities.contains_key("a"));
    }
}
