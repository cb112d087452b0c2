// Room registry: one in-memory document handle per document id for the life
// of the process, lazily hydrated from its snapshot file on first access.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, warn};

use crate::doc::SharedDoc;
use crate::snapshot::{load_snapshot, write_snapshot};

const BROADCAST_BUFFER_SIZE: usize = 256;
pub const SNAPSHOT_EXT: &str = "ydoc";

/// One shared document plus everyone currently connected to it.
///
/// All mutation runs under the document mutex, so within a room each
/// accepted message is processed to completion (apply, persist, broadcast)
/// before the next one starts.
pub struct Room {
    doc_id: String,
    snapshot_path: PathBuf,
    doc: Mutex<SharedDoc>,
    updates_tx: broadcast::Sender<(u64, Vec<u8>)>,
    connections: AtomicUsize,
}

impl Room {
    fn new(doc_id: String, snapshot_path: PathBuf, doc: SharedDoc) -> Self {
        let (updates_tx, _) = broadcast::channel(BROADCAST_BUFFER_SIZE);
        Self {
            doc_id,
            snapshot_path,
            doc: Mutex::new(doc),
            updates_tx,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.doc_id
    }

    pub fn doc(&self) -> &Mutex<SharedDoc> {
        &self.doc
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(u64, Vec<u8>)> {
        self.updates_tx.subscribe()
    }

    pub fn connect(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Unregister one connection. The last one out flushes a snapshot, which
    /// covers any accepted write whose own persist was skipped.
    pub async fn disconnect(&self) {
        if self.connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            let doc = self.doc.lock().await;
            if let Err(error) = write_snapshot(&self.snapshot_path, &doc) {
                error!(doc_id = %self.doc_id, ?error, "failed to flush snapshot on last disconnect");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Merge an accepted update and write the snapshot through, atomically
    /// with respect to every other accepted write in this room.
    pub async fn apply_and_persist(&self, update: &[u8]) -> Result<()> {
        let doc = self.doc.lock().await;
        doc.apply_update(update)?;
        write_snapshot(&self.snapshot_path, &doc)
            .with_context(|| format!("failed to persist snapshot for `{}`", self.doc_id))?;
        Ok(())
    }

    /// Fan a frame out to every other connection in the room. The sender id
    /// lets each subscriber drop its own frames; a send with no subscribers
    /// is not an error.
    pub fn broadcast(&self, sender_id: u64, frame: Vec<u8>) {
        let _ = self.updates_tx.send((sender_id, frame));
    }
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    persist_dir: PathBuf,
    next_client_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new(persist_dir: PathBuf) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            persist_dir,
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the room for `doc_id`, creating and hydrating it on first
    /// reference. Hydration runs while holding the registry lock, so two
    /// concurrent connections can never end up with two handles for the
    /// same document.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(doc_id) {
            return Arc::clone(room);
        }

        let snapshot_path = self.persist_dir.join(format!("{doc_id}.{SNAPSHOT_EXT}"));
        let doc = match load_snapshot(&snapshot_path) {
            Ok(Some(doc)) => doc,
            Ok(None) => SharedDoc::new(),
            Err(error) => {
                // Not the same as "no snapshot yet": the file is there but
                // unreadable, so starting empty may lose data. Say so.
                warn!(doc_id, ?error, "snapshot failed to load; starting room empty");
                SharedDoc::new()
            }
        };

        let room = Arc::new(Room::new(doc_id.to_string(), snapshot_path, doc));
        rooms.insert(doc_id.to_string(), Arc::clone(&room));
        room
    }
}
