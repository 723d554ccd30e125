//! Audit hub: records peer membership in SQLite.
//!
//! [`AuditHub`] wraps any other hub. The in-memory registration happens
//! first; if writing the audit row then fails, the client is taken out of the
//! wrapped hub again so memory and the database never disagree about who is
//! connected.
//!
//! SQLite writes are blocking, so membership changes run them on tokio's
//! blocking pool instead of the connection's worker thread.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::error::NetworkError;
use crate::hub::{BroadcastFilter, ClientRef, Hub};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A currently connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRow {
    pub id: u64,
    pub name: String,
    pub addr: String,
    pub connected_at: String,
}

/// One connect or disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEventRow {
    pub seq: i64,
    pub peer_id: u64,
    pub name: String,
    pub event: String,
    pub at: String,
}

// ---------------------------------------------------------------------------
// Hub decorator
// ---------------------------------------------------------------------------

/// Hub decorator persisting membership changes.
pub struct AuditHub<H> {
    inner: H,
    db: Arc<Mutex<Connection>>,
}

impl<H> AuditHub<H> {
    /// Open (or create) the audit database at `path`.
    pub fn open(inner: H, path: &Path) -> Result<Self, NetworkError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let hub = Self::with_connection(inner, conn)?;
        info!("Audit database opened at {}", path.display());
        Ok(hub)
    }

    /// In-memory database, for tests and throwaway servers.
    pub fn open_in_memory(inner: H) -> Result<Self, NetworkError> {
        Self::with_connection(inner, Connection::open_in_memory()?)
    }

    fn with_connection(inner: H, conn: Connection) -> Result<Self, NetworkError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS peers (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                addr TEXT NOT NULL,
                connected_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peer_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                event TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_peer_events_peer ON peer_events(peer_id);
            ",
        )?;
        // Peers left over from a previous run are no longer connected.
        conn.execute("DELETE FROM peers", [])?;

        Ok(Self {
            inner,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Peers currently recorded as connected, ordered by id.
    pub fn current_peers(&self) -> Result<Vec<PeerRow>, NetworkError> {
        let db = self.db.lock();
        let mut stmt =
            db.prepare("SELECT id, name, addr, connected_at FROM peers ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PeerRow {
                    id: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                    addr: row.get(2)?,
                    connected_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full event history, oldest first.
    pub fn events(&self) -> Result<Vec<PeerEventRow>, NetworkError> {
        let db = self.db.lock();
        let mut stmt =
            db.prepare("SELECT seq, peer_id, name, event, at FROM peer_events ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PeerEventRow {
                    seq: row.get(0)?,
                    peer_id: row.get::<_, i64>(1)? as u64,
                    name: row.get(2)?,
                    event: row.get(3)?,
                    at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Run `write` against the database on the blocking pool.
    async fn write<F>(&self, write: F) -> Result<(), NetworkError>
    where
        F: FnOnce(&mut Connection) -> Result<(), NetworkError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || write(&mut db.lock()))
            .await
            .map_err(std::io::Error::from)?
    }
}

fn record_connected(db: &mut Connection, id: u64, name: &str, addr: &str) -> Result<(), NetworkError> {
    let now = Utc::now().to_rfc3339();
    let tx = db.transaction()?;
    tx.execute(
        "INSERT OR REPLACE INTO peers (id, name, addr, connected_at) VALUES (?1, ?2, ?3, ?4)",
        params![id as i64, name, addr, now],
    )?;
    tx.execute(
        "INSERT INTO peer_events (peer_id, name, event, at) VALUES (?1, ?2, 'connected', ?3)",
        params![id as i64, name, now],
    )?;
    tx.commit()?;
    Ok(())
}

fn record_disconnected(db: &mut Connection, id: u64, name: &str) -> Result<(), NetworkError> {
    let now = Utc::now().to_rfc3339();
    let tx = db.transaction()?;
    let removed = tx.execute("DELETE FROM peers WHERE id = ?1", params![id as i64])?;
    if removed > 0 {
        tx.execute(
            "INSERT INTO peer_events (peer_id, name, event, at) VALUES (?1, ?2, 'disconnected', ?3)",
            params![id as i64, name, now],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl<T, H> Hub<T> for AuditHub<H>
where
    T: Send + Sync + 'static,
    H: Hub<T>,
{
    async fn add_client(&self, client: ClientRef<T>) -> Result<(), NetworkError> {
        self.inner.add_client(client.clone()).await?;

        let (id, name, addr) = (client.id(), client.name(), client.addr());
        let recorded = self
            .write(move |db| record_connected(db, id, &name, &addr))
            .await;
        if let Err(e) = recorded {
            warn!("Audit of {} failed, rolling back: {e}", client.name());
            if let Err(rollback) = self.inner.remove_client(&client).await {
                warn!("Rollback of {} failed: {rollback}", client.name());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn remove_client(&self, client: &ClientRef<T>) -> Result<(), NetworkError> {
        self.inner.remove_client(client).await?;
        let (id, name) = (client.id(), client.name());
        self.write(move |db| record_disconnected(db, id, &name)).await
    }

    async fn broadcast(&self, msg: &T, filters: &[&dyn BroadcastFilter]) -> Result<(), NetworkError> {
        self.inner.broadcast(msg, filters).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::InMemoryHub;
    use crate::hub::tests::FakeClient;
    use std::time::Duration;

    fn audited() -> AuditHub<InMemoryHub<String>> {
        AuditHub::open_in_memory(InMemoryHub::new(8, 4)).unwrap()
    }

    fn client(id: u64) -> ClientRef<String> {
        FakeClient::new(id) as ClientRef<String>
    }

    #[tokio::test]
    async fn test_add_and_remove_are_recorded() {
        let hub = audited();
        let a = client(1);
        let b = client(2);
        hub.add_client(a.clone()).await.unwrap();
        hub.add_client(b.clone()).await.unwrap();

        let peers = hub.current_peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "Client #1");
        assert_eq!(peers[1].addr, "127.0.0.1:4002");

        hub.remove_client(&a).await.unwrap();
        let ids: Vec<u64> = hub.current_peers().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2]);

        let events: Vec<(u64, String)> = hub
            .events()
            .unwrap()
            .into_iter()
            .map(|e| (e.peer_id, e.event))
            .collect();
        assert_eq!(
            events,
            vec![
                (1, "connected".to_string()),
                (2, "connected".to_string()),
                (1, "disconnected".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let hub = audited();
        hub.remove_client(&client(42)).await.unwrap();
        assert!(hub.events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_audit_rolls_back_membership() {
        let hub = audited();
        hub.db.lock().execute_batch("DROP TABLE peers").unwrap();

        let err = hub.add_client(client(1)).await.unwrap_err();
        assert!(matches!(err, NetworkError::Persistence(_)));
        assert!(!hub.inner().contains(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_database_does_not_stall_runtime() {
        let hub = Arc::new(audited());

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let db = Arc::clone(&hub.db);
        let holder = std::thread::spawn(move || {
            let _guard = db.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
        });
        locked_rx.recv().unwrap();

        let adding = Arc::clone(&hub);
        let add = tokio::spawn(async move { adding.add_client(client(1)).await });

        let started = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!add.is_finished());

        add.await.unwrap().unwrap();
        holder.join().unwrap();
        assert_eq!(hub.current_peers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_delegates() {
        let hub = audited();
        let a = FakeClient::new(1);
        hub.add_client(Arc::clone(&a) as ClientRef<String>).await.unwrap();
        hub.broadcast(&"ping".to_string(), &[]).await.unwrap();
        assert_eq!(a.received(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_reopen_clears_stale_peers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        {
            let hub = AuditHub::open(InMemoryHub::<String>::new(8, 4), &path).unwrap();
            hub.add_client(client(1)).await.unwrap();
            assert_eq!(hub.current_peers().unwrap().len(), 1);
        }

        let hub = AuditHub::open(InMemoryHub::<String>::new(8, 4), &path).unwrap();
        assert!(hub.current_peers().unwrap().is_empty());
        assert_eq!(hub.events().unwrap().len(), 1);
    }
}
