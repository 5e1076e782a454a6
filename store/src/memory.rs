use crate::session::{
    CreateMode, SessionError, SessionEvent, SessionResult, SessionState, StoreConnector,
    StoreSession, WatchEvent, WatchKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// In-process coordination store with ZooKeeper-style semantics: hierarchical
/// nodes, per-parent sequential counters, session-owned ephemerals and
/// one-shot watches. Any number of sessions share one ensemble; sessions can
/// be disconnected, reconnected and expired, which makes the store a faithful
/// harness for connection-loss and failover behavior.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Ensemble>>,
}

struct Znode {
    data: Vec<u8>,
    version: u32,
    owner: Option<u64>,
    seq_counter: u64,
}

struct SessionEntry {
    tx: UnboundedSender<SessionEvent>,
    connected: bool,
    expired: bool,
    closed: bool,
    ephemerals: BTreeSet<String>,
}

impl SessionEntry {
    fn alive(&self) -> bool {
        !self.expired && !self.closed
    }
}

#[derive(Default)]
struct Ensemble {
    nodes: BTreeMap<String, Znode>,
    sessions: HashMap<u64, SessionEntry>,
    next_session_id: u64,
    data_watches: HashMap<String, Vec<u64>>,
    child_watches: HashMap<String, Vec<u64>>,
    exists_watches: HashMap<String, Vec<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ensemble::default())),
        }
    }

    /// Opens a new session against this ensemble. The session is connected
    /// immediately and its event stream starts with `SyncConnected`.
    pub fn connect(&self) -> Arc<MemorySession> {
        let mut ens = self.inner.lock();

        let id = ens.next_session_id;
        ens.next_session_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::State(SessionState::SyncConnected));

        ens.sessions.insert(
            id,
            SessionEntry {
                tx,
                connected: true,
                expired: false,
                closed: false,
                ephemerals: BTreeSet::new(),
            },
        );

        debug!("Opened memory store session {}", id);

        Arc::new(MemorySession {
            id,
            store: self.clone(),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Ids of all sessions ever opened and not yet closed, in open order
    pub fn session_ids(&self) -> Vec<u64> {
        let ens = self.inner.lock();

        let mut ids: Vec<u64> = ens
            .sessions
            .iter()
            .filter(|(_, s)| !s.closed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Simulates a network drop: the session stays alive, its ephemerals
    /// stay, but every operation fails with `ConnectionLoss`.
    pub fn disconnect(&self, session_id: u64) {
        let mut ens = self.inner.lock();

        if let Some(entry) = ens.sessions.get_mut(&session_id) {
            if entry.alive() && entry.connected {
                entry.connected = false;
                let _ = entry
                    .tx
                    .send(SessionEvent::State(SessionState::Disconnected));
            }
        }
    }

    /// Ends a simulated network drop
    pub fn reconnect(&self, session_id: u64) {
        let mut ens = self.inner.lock();

        if let Some(entry) = ens.sessions.get_mut(&session_id) {
            if entry.alive() && !entry.connected {
                entry.connected = true;
                let _ = entry
                    .tx
                    .send(SessionEvent::State(SessionState::SyncConnected));
            }
        }
    }

    /// Expires a session: its ephemerals are deleted (firing watches) and the
    /// session observes `Expired`. This is the canonical member-crash signal.
    pub fn expire(&self, session_id: u64) {
        let mut ens = self.inner.lock();

        let Some(entry) = ens.sessions.get_mut(&session_id) else {
            return;
        };

        if !entry.alive() {
            return;
        }

        entry.expired = true;
        entry.connected = false;
        let tx = entry.tx.clone();
        let ephemerals: Vec<String> = entry.ephemerals.iter().cloned().collect();
        entry.ephemerals.clear();

        for path in ephemerals {
            ens.remove_node(&path);
        }

        ens.drop_session_watches(session_id);

        let _ = tx.send(SessionEvent::State(SessionState::Expired));

        debug!("Expired memory store session {}", session_id);
    }

    /// Test helper: raw payload of a node
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Test helper: child names of a node, sorted
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.inner.lock().children(path)
    }

    /// Test helper: node existence
    pub fn node_exists(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    fn close_session(&self, session_id: u64) {
        let mut ens = self.inner.lock();

        let Some(entry) = ens.sessions.get_mut(&session_id) else {
            return;
        };

        if entry.closed {
            return;
        }

        entry.closed = true;
        entry.connected = false;
        let ephemerals: Vec<String> = entry.ephemerals.iter().cloned().collect();
        entry.ephemerals.clear();

        for path in ephemerals {
            ens.remove_node(&path);
        }

        ens.drop_session_watches(session_id);

        debug!("Closed memory store session {}", session_id);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(
        &self,
        _connect_string: &str,
        _session_timeout: Duration,
    ) -> SessionResult<Arc<dyn StoreSession>> {
        Ok(self.connect() as Arc<dyn StoreSession>)
    }
}

/// One session against a [`MemoryStore`]
pub struct MemorySession {
    id: u64,
    store: MemoryStore,
    events: Mutex<Option<UnboundedReceiver<SessionEvent>>>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    fn take_events(&self) -> UnboundedReceiver<SessionEvent> {
        self.events
            .lock()
            .take()
            .expect("session event stream already taken")
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> SessionResult<String> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;
        ens.create(self.id, path, data, mode)
    }

    async fn exists(&self, path: &str, watch: bool) -> SessionResult<bool> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;

        if watch {
            register_watch(&mut ens.exists_watches, path, self.id);
        }

        Ok(ens.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str, watch: bool) -> SessionResult<Vec<u8>> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;

        if !ens.nodes.contains_key(path) {
            return Err(SessionError::NoNode);
        }

        if watch {
            register_watch(&mut ens.data_watches, path, self.id);
        }

        Ok(ens.nodes[path].data.clone())
    }

    async fn get_children(&self, path: &str, watch: bool) -> SessionResult<Vec<String>> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;

        if !ens.nodes.contains_key(path) {
            return Err(SessionError::NoNode);
        }

        if watch {
            register_watch(&mut ens.child_watches, path, self.id);
        }

        Ok(ens.children(path))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<u32>) -> SessionResult<()> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;

        let node = ens.nodes.get_mut(path).ok_or(SessionError::NoNode)?;

        if let Some(expected) = version {
            if expected != node.version {
                return Err(SessionError::BadVersion);
            }
        }

        node.data = data.to_vec();
        node.version += 1;

        ens.fire(path, WatchKind::DataChanged, &[WatchSet::Data, WatchSet::Exists]);

        Ok(())
    }

    async fn delete(&self, path: &str, version: Option<u32>) -> SessionResult<()> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;
        ens.delete(path, version)
    }

    async fn multi_delete(
        &self,
        parent: &str,
        names: &[String],
        version: Option<u32>,
    ) -> SessionResult<()> {
        let mut ens = self.store.inner.lock();

        ens.check_session(self.id)?;

        // Validate everything up front so the removal is all-or-nothing.
        for name in names {
            let path = format!("{}/{}", parent, name);

            let node = ens.nodes.get(&path).ok_or(SessionError::NoNode)?;

            if let Some(expected) = version {
                if expected != node.version {
                    return Err(SessionError::BadVersion);
                }
            }

            if !ens.children(&path).is_empty() {
                return Err(SessionError::NotEmpty);
            }
        }

        for name in names {
            let path = format!("{}/{}", parent, name);
            ens.remove_node(&path);
        }

        Ok(())
    }

    fn is_alive(&self) -> bool {
        let ens = self.store.inner.lock();

        ens.sessions
            .get(&self.id)
            .map(|s| s.alive())
            .unwrap_or(false)
    }

    fn close(&self) {
        self.store.close_session(self.id);
    }
}

/// Which watch registries an event fans out to
#[derive(Clone, Copy, PartialEq, Eq)]
enum WatchSet {
    Data,
    Exists,
    Children,
}

impl Ensemble {
    fn check_session(&self, session_id: u64) -> SessionResult<()> {
        let Some(entry) = self.sessions.get(&session_id) else {
            return Err(SessionError::Closed);
        };

        if entry.closed {
            return Err(SessionError::Closed);
        }

        if entry.expired {
            return Err(SessionError::SessionExpired);
        }

        if !entry.connected {
            return Err(SessionError::ConnectionLoss);
        }

        Ok(())
    }

    fn create(
        &mut self,
        session_id: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> SessionResult<String> {
        let parent = parent_of(path);

        if !parent.is_empty() && !self.nodes.contains_key(parent) {
            return Err(SessionError::NoNode);
        }

        let final_path = if mode.is_sequential() {
            let seq = if parent.is_empty() {
                0
            } else {
                let parent_node = self.nodes.get_mut(parent).expect("parent checked above");
                let seq = parent_node.seq_counter;
                parent_node.seq_counter += 1;
                seq
            };

            format!("{}{:010}", path, seq)
        } else {
            if self.nodes.contains_key(path) {
                return Err(SessionError::NodeExists);
            }

            path.to_string()
        };

        let owner = mode.is_ephemeral().then_some(session_id);

        self.nodes.insert(
            final_path.clone(),
            Znode {
                data: data.to_vec(),
                version: 0,
                owner,
                seq_counter: 0,
            },
        );

        if owner.is_some() {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.ephemerals.insert(final_path.clone());
            }
        }

        self.fire(&final_path, WatchKind::Created, &[WatchSet::Exists]);

        if !parent.is_empty() {
            self.fire(parent, WatchKind::ChildrenChanged, &[WatchSet::Children]);
        }

        Ok(final_path)
    }

    fn delete(&mut self, path: &str, version: Option<u32>) -> SessionResult<()> {
        let node = self.nodes.get(path).ok_or(SessionError::NoNode)?;

        if let Some(expected) = version {
            if expected != node.version {
                return Err(SessionError::BadVersion);
            }
        }

        if !self.children(path).is_empty() {
            return Err(SessionError::NotEmpty);
        }

        self.remove_node(path);

        Ok(())
    }

    /// Unconditional removal with watch fan-out; used by delete paths and by
    /// ephemeral cleanup on session end.
    fn remove_node(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };

        if let Some(owner) = node.owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.remove(path);
            }
        }

        self.fire(
            path,
            WatchKind::Deleted,
            &[WatchSet::Data, WatchSet::Exists, WatchSet::Children],
        );

        let parent = parent_of(path);

        if !parent.is_empty() {
            self.fire(parent, WatchKind::ChildrenChanged, &[WatchSet::Children]);
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    /// Delivers a one-shot watch event to every registered watcher of the path
    fn fire(&mut self, path: &str, kind: WatchKind, sets: &[WatchSet]) {
        let mut watchers: Vec<u64> = Vec::new();

        for set in sets {
            let registry = match set {
                WatchSet::Data => &mut self.data_watches,
                WatchSet::Exists => &mut self.exists_watches,
                WatchSet::Children => &mut self.child_watches,
            };

            if let Some(ids) = registry.remove(path) {
                for id in ids {
                    if !watchers.contains(&id) {
                        watchers.push(id);
                    }
                }
            }
        }

        if watchers.is_empty() {
            return;
        }

        let event = SessionEvent::Watch(WatchEvent {
            path: path.to_string(),
            kind,
        });

        for id in watchers {
            if let Some(entry) = self.sessions.get(&id) {
                if entry.alive() {
                    let _ = entry.tx.send(event.clone());
                }
            }
        }
    }

    fn drop_session_watches(&mut self, session_id: u64) {
        for registry in [
            &mut self.data_watches,
            &mut self.child_watches,
            &mut self.exists_watches,
        ] {
            registry.retain(|_, ids| {
                ids.retain(|id| *id != session_id);
                !ids.is_empty()
            });
        }
    }
}

fn register_watch(registry: &mut HashMap<String, Vec<u64>>, path: &str, session_id: u64) {
    let ids = registry.entry(path.to_string()).or_default();

    if !ids.contains(&session_id) {
        ids.push(session_id);
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}
