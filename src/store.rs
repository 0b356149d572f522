// Document store adapter
// Checklists are stored as JSON documents in SQLite with the columns the
// store queries on (group, archived flag, revision) lifted out of the
// document. A settings table holds single serialized records such as the
// template registry and the user directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

use crate::checklist::Checklist;
use crate::error::{SyncError, SyncResult};

/// Bound on waiting for the store connection. Expiry surfaces as
/// `StoreUnavailable` instead of hanging the session.
#[cfg(not(test))]
const STORE_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
const STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Shared handle to the embedded document store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        setup_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection within the request timeout.
    async fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        timeout(STORE_TIMEOUT, self.conn.lock())
            .await
            .map_err(|_| SyncError::StoreUnavailable)
    }

    /// Non-archived checklists for a group, in creation order.
    pub async fn list_active(&self, group_id: &str) -> SyncResult<Vec<Checklist>> {
        let conn = self.lock().await?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM checklists WHERE group_id = ?1 AND archived = 0 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;

        let mut checklists = Vec::new();
        for doc in rows {
            checklists.push(serde_json::from_str(&doc?)?);
        }
        Ok(checklists)
    }

    /// Every non-archived checklist in the deployment (template sync walks
    /// all groups).
    pub async fn list_all_active(&self) -> SyncResult<Vec<Checklist>> {
        let conn = self.lock().await?;
        let mut stmt =
            conn.prepare("SELECT doc FROM checklists WHERE archived = 0 ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut checklists = Vec::new();
        for doc in rows {
            checklists.push(serde_json::from_str(&doc?)?);
        }
        Ok(checklists)
    }

    /// Fetch one checklist by id, archived or not.
    pub async fn get(&self, id: &str) -> SyncResult<Option<Checklist>> {
        let conn = self.lock().await?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM checklists WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Insert a freshly created checklist.
    pub async fn insert(&self, checklist: &Checklist) -> SyncResult<()> {
        let doc = serde_json::to_string(checklist)?;
        let conn = self.lock().await?;
        conn.execute(
            "INSERT INTO checklists (id, group_id, archived, revision, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checklist.id,
                checklist.group_id,
                checklist.archived as i64,
                checklist.revision,
                doc
            ],
        )?;
        Ok(())
    }

    /// Compare-and-swap update. `checklist.revision` must hold the revision
    /// the caller read; on success it is bumped in place and persisted. A
    /// stale revision is a `Conflict`, an unknown id a `NotFound`.
    pub async fn update(&self, checklist: &mut Checklist) -> SyncResult<()> {
        let expected = checklist.revision;
        checklist.revision = expected + 1;
        let doc = serde_json::to_string(checklist)?;

        let conn = self.lock().await?;
        let changed = conn.execute(
            "UPDATE checklists SET doc = ?1, revision = ?2, archived = ?3
             WHERE id = ?4 AND revision = ?5",
            params![
                doc,
                checklist.revision,
                checklist.archived as i64,
                checklist.id,
                expected
            ],
        )?;

        if changed == 0 {
            checklist.revision = expected;
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM checklists WHERE id = ?1",
                    params![checklist.id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => SyncError::Conflict {
                    id: checklist.id.clone(),
                },
                None => SyncError::NotFound {
                    entity: "checklist",
                    id: checklist.id.clone(),
                },
            });
        }
        Ok(())
    }

    /// Read a settings record.
    pub async fn get_setting(&self, key: &str) -> SyncResult<Option<String>> {
        let conn = self.lock().await?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a settings record, replacing any previous value.
    pub async fn put_setting(&self, key: &str, value: &str) -> SyncResult<()> {
        let conn = self.lock().await?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn setup_schema(conn: &Connection) -> SyncResult<()> {
    // WAL for crash recovery under concurrent readers.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checklists (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 0,
            doc TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_checklists_group
         ON checklists(group_id, archived)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::{Item, ItemStatus};

    fn sample(name: &str, group: &str) -> Checklist {
        Checklist::new(
            name,
            group,
            "u1",
            vec![Item::new(1, "Bank A", ItemStatus::NotStarted)],
        )
    }

    #[tokio::test]
    async fn test_insert_and_list_active_scopes_by_group() {
        let store = Store::open_in_memory().unwrap();
        store.insert(&sample("Q1 Banks", "g1")).await.unwrap();
        store.insert(&sample("Q2 Banks", "g1")).await.unwrap();
        store.insert(&sample("Other", "g2")).await.unwrap();

        let g1 = store.list_active("g1").await.unwrap();
        assert_eq!(g1.len(), 2);
        assert_eq!(g1[0].name, "Q1 Banks");
        assert_eq!(store.list_active("g2").await.unwrap().len(), 1);
        assert_eq!(store.list_active("g3").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_bumps_revision() {
        let store = Store::open_in_memory().unwrap();
        let mut list = sample("Q1 Banks", "g1");
        store.insert(&list).await.unwrap();

        list.name = "Q1 Banks (renamed)".into();
        store.update(&mut list).await.unwrap();
        assert_eq!(list.revision, 1);

        let stored = store.get(&list.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.name, "Q1 Banks (renamed)");
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        let list = sample("Q1 Banks", "g1");
        store.insert(&list).await.unwrap();

        // Two readers pick up revision 0; the second write must lose.
        let mut first = store.get(&list.id).await.unwrap().unwrap();
        let mut second = store.get(&list.id).await.unwrap().unwrap();

        store.update(&mut first).await.unwrap();
        let err = store.update(&mut second).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
        // The loser's copy keeps its stale revision for the caller to retry.
        assert_eq!(second.revision, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let mut ghost = sample("Ghost", "g1");
        let err = store.update(&mut ghost).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_archive_excludes_from_active_lists() {
        let store = Store::open_in_memory().unwrap();
        let list = sample("Q1 Banks", "g1");
        store.insert(&list).await.unwrap();

        let mut archived = store.get(&list.id).await.unwrap().unwrap();
        archived.archived = true;
        store.update(&mut archived).await.unwrap();

        assert!(store.list_active("g1").await.unwrap().is_empty());
        assert!(store.list_all_active().await.unwrap().is_empty());
        // Still fetchable by id for auditability.
        assert!(store.get(&list.id).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_setting("template").await.unwrap().is_none());

        store.put_setting("template", "v1").await.unwrap();
        store.put_setting("template", "v2").await.unwrap();
        assert_eq!(
            store.get_setting("template").await.unwrap().as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_held_lock_times_out_as_store_unavailable() {
        let store = Store::open_in_memory().unwrap();
        let guard = store.conn.lock().await;

        let err = store.get_setting("template").await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable));
        drop(guard);
    }
}
