use crate::session::{CreateMode, SessionError, SessionEvent, SessionState, StoreSession, WatchEvent};
use conclave_common::{ConclaveError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a failed operation waits for the reconnect signal between retries
const RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Client-level connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Lost,
}

/// Events the client re-publishes to its single consumer: triggered watches,
/// and at most one terminal connection-loss notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Watch(WatchEvent),
    ConnectionLost,
}

struct ClientState {
    conn: ConnectionState,
    conn_start: Instant,
    /// Bumped on every disconnect transition; lets operations and the timer
    /// detect that the episode they observed is over
    epoch: u64,
    closed: bool,
    lost_sent: bool,
}

struct ClientInner {
    session: Arc<dyn StoreSession>,
    conn_loss_timeout: Duration,
    state: Mutex<ClientState>,
    reconnected: Notify,
    events_tx: UnboundedSender<ClientEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Reliable wrapper over a raw store session.
///
/// Operations retry transparently while the connection is down, for at most
/// the configured connection-loss window measured from the moment the
/// disconnect began. Once the window closes the client is `Lost`: every
/// pending and subsequent operation fails and a single
/// [`ClientEvent::ConnectionLost`] is emitted.
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

impl StoreClient {
    pub fn new(
        session: Arc<dyn StoreSession>,
        conn_loss_timeout: Duration,
        events_tx: UnboundedSender<ClientEvent>,
    ) -> Self {
        let session_events = session.take_events();

        let inner = Arc::new(ClientInner {
            session,
            conn_loss_timeout,
            state: Mutex::new(ClientState {
                conn: ConnectionState::Disconnected,
                conn_start: Instant::now(),
                epoch: 0,
                closed: false,
                lost_sent: false,
            }),
            reconnected: Notify::new(),
            events_tx,
            timer: Mutex::new(None),
        });

        // The client starts disconnected; if the store never connects, the
        // timer closes it at the deadline.
        let deadline = inner.state.lock().conn_start + conn_loss_timeout;
        arm_timer(&inner, 0, deadline);

        tokio::spawn(run_session_events(inner.clone(), session_events));

        Self { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().conn
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.retrying("exists", path, || self.inner.session.exists(path, false))
            .await
    }

    /// `exists` that also arms a one-shot watch on the path
    pub async fn exists_watch(&self, path: &str) -> Result<bool> {
        self.retrying("exists", path, || self.inner.session.exists(path, true))
            .await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.retrying("get-children", path, || {
            self.inner.session.get_children(path, false)
        })
        .await
    }

    pub async fn get_children_watch(&self, path: &str) -> Result<Vec<String>> {
        self.retrying("get-children", path, || {
            self.inner.session.get_children(path, true)
        })
        .await
    }

    /// Fails with [`ConclaveError::NoNode`] when the path is absent
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.retrying("get-data", path, || self.inner.session.get_data(path, false))
            .await
    }

    pub async fn get_data_watch(&self, path: &str) -> Result<Vec<u8>> {
        self.retrying("get-data", path, || self.inner.session.get_data(path, true))
            .await
    }

    /// Creates a node, returning the final path. Creation of an already
    /// existing node is a no-op returning the requested path.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.retrying("create", path, || async move {
            match self.inner.session.create(path, data, mode).await {
                Err(SessionError::NodeExists) => {
                    info!("Node already exists: {}", path);

                    Ok(path.to_string())
                }
                other => other,
            }
        })
        .await
    }

    pub async fn set_data(&self, path: &str, data: &[u8], version: Option<u32>) -> Result<()> {
        self.retrying("set-data", path, || {
            self.inner.session.set_data(path, data, version)
        })
        .await
    }

    /// Fails with [`ConclaveError::NoNode`] when the path is absent
    pub async fn delete(&self, path: &str, version: Option<u32>) -> Result<()> {
        self.retrying("delete", path, || self.inner.session.delete(path, version))
            .await
    }

    pub async fn delete_if_exists(&self, path: &str, version: Option<u32>) -> Result<()> {
        match self.delete(path, version).await {
            Err(e) if e.is_no_node() => Ok(()),
            other => other,
        }
    }

    /// All-or-nothing removal of the named children of `parent`
    pub async fn multi_delete(
        &self,
        parent: &str,
        names: &[String],
        version: Option<u32>,
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        self.retrying("multi-delete", parent, || {
            self.inner.session.multi_delete(parent, names, version)
        })
        .await
    }

    /// Closes the session and cancels the connection timer. No
    /// [`ClientEvent::ConnectionLost`] is emitted after an explicit close.
    pub fn close(&self) {
        {
            let mut st = self.inner.state.lock();

            if st.closed {
                debug!("Store client already closed");

                return;
            }

            st.closed = true;
            st.lost_sent = true;
        }

        cancel_timer(&self.inner);
        self.inner.session.close();

        // Wake blocked retries so they observe the closed client.
        self.inner.reconnected.notify_waiters();
    }

    async fn retrying<T, F, Fut>(&self, op_name: &str, path: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, SessionError>>,
    {
        loop {
            let epoch = self.inner.state.lock().epoch;

            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => self.on_store_error(op_name, path, epoch, e).await?,
            }
        }
    }

    /// Decides the fate of a failed operation: `Ok(())` means retry, an error
    /// is surfaced to the caller.
    async fn on_store_error(
        &self,
        op_name: &str,
        path: &str,
        prev_epoch: u64,
        err: SessionError,
    ) -> Result<()> {
        match err {
            SessionError::NoNode => {
                return Err(ConclaveError::NoNode {
                    path: path.to_string(),
                })
            }

            SessionError::ConnectionLoss => {
                {
                    let mut st = self.inner.state.lock();

                    if st.closed {
                        return Err(client_failed("client is closed"));
                    }

                    match st.conn {
                        ConnectionState::Lost => {
                            return Err(client_failed("connection to the store was lost"));
                        }

                        ConnectionState::Connected if st.epoch == prev_epoch => {
                            st.conn = ConnectionState::Disconnected;
                            st.conn_start = Instant::now();
                            st.epoch += 1;

                            let epoch = st.epoch;
                            let deadline = st.conn_start + self.inner.conn_loss_timeout;

                            warn!(
                                "Store operation failed, will retry [op={}, path={}, connLossTimeout={:?}]",
                                op_name, path, self.inner.conn_loss_timeout
                            );

                            drop(st);

                            arm_timer(&self.inner, epoch, deadline);
                        }

                        ConnectionState::Connected => {
                            // A full disconnect/reconnect cycle happened while
                            // the operation was in flight; just retry.
                        }

                        ConnectionState::Disconnected => {
                            let elapsed = st.conn_start.elapsed();

                            if elapsed >= self.inner.conn_loss_timeout {
                                drop(st);

                                to_lost(&self.inner, "connection-loss timeout elapsed");

                                return Err(client_failed("connection-loss timeout elapsed"));
                            }

                            warn!(
                                "Store operation failed, will retry [op={}, path={}, remaining={:?}]",
                                op_name,
                                path,
                                self.inner.conn_loss_timeout - elapsed
                            );
                        }
                    }
                }

                let _ = tokio::time::timeout(RETRY_TIMEOUT, self.inner.reconnected.notified()).await;

                Ok(())
            }

            // Everything else is terminal for the session. The retry policy
            // deliberately covers connection loss only.
            other => {
                warn!(
                    "Store operation failed with non-retryable error, closing client [op={}, path={}, err={}]",
                    op_name, path, other
                );

                to_lost(&self.inner, "non-retryable store error");

                Err(client_failed(&other.to_string()))
            }
        }
    }
}

fn client_failed(message: &str) -> ConclaveError {
    ConclaveError::ClientFailed {
        message: message.to_string(),
    }
}

async fn run_session_events(inner: Arc<ClientInner>, mut rx: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::State(state) => on_session_state(&inner, state),
            SessionEvent::Watch(watch) => {
                let _ = inner.events_tx.send(ClientEvent::Watch(watch));
            }
        }
    }
}

fn on_session_state(inner: &Arc<ClientInner>, state: SessionState) {
    match state {
        SessionState::SyncConnected => {
            {
                let mut st = inner.state.lock();

                if st.closed || st.conn == ConnectionState::Lost {
                    warn!("Received connect event after the client was lost");

                    return;
                }

                if st.conn == ConnectionState::Connected {
                    return;
                }

                info!(
                    "Store client state changed [prevState={:?}, newState={:?}]",
                    st.conn,
                    ConnectionState::Connected
                );

                st.conn = ConnectionState::Connected;
            }

            cancel_timer(inner);
            inner.reconnected.notify_waiters();
        }

        SessionState::Disconnected => {
            let armed = {
                let mut st = inner.state.lock();

                if st.closed || st.conn == ConnectionState::Lost {
                    warn!("Received disconnect event after the client was lost");

                    return;
                }

                if st.conn == ConnectionState::Disconnected {
                    return;
                }

                info!(
                    "Store client state changed [prevState={:?}, newState={:?}]",
                    st.conn,
                    ConnectionState::Disconnected
                );

                st.conn = ConnectionState::Disconnected;
                st.conn_start = Instant::now();
                st.epoch += 1;

                (st.epoch, st.conn_start + inner.conn_loss_timeout)
            };

            arm_timer(inner, armed.0, armed.1);
        }

        SessionState::Expired => {
            warn!("Store session expired, closing client");

            to_lost(inner, "session expired");
        }
    }
}

/// One scheduled task per disconnect episode. On fire, if the episode is still
/// current, the client transitions to `Lost`.
fn arm_timer(inner: &Arc<ClientInner>, epoch: u64, deadline: Instant) {
    let task_inner = inner.clone();

    let handle = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;

        let fire = {
            let st = task_inner.state.lock();

            !st.closed && st.conn == ConnectionState::Disconnected && st.epoch == epoch
        };

        if fire {
            warn!(
                "Failed to establish store connection, closing client [timeout={:?}]",
                task_inner.conn_loss_timeout
            );

            to_lost(&task_inner, "connection-loss timeout elapsed");
        }
    });

    if let Some(old) = inner.timer.lock().replace(handle) {
        old.abort();
    }
}

fn cancel_timer(inner: &Arc<ClientInner>) {
    if let Some(handle) = inner.timer.lock().take() {
        handle.abort();
    }
}

/// Terminal transition: closes the session and emits `ConnectionLost` exactly
/// once over the client's lifetime.
fn to_lost(inner: &Arc<ClientInner>, reason: &str) {
    let notify = {
        let mut st = inner.state.lock();

        if st.conn == ConnectionState::Lost {
            false
        } else {
            st.conn = ConnectionState::Lost;

            let notify = !st.lost_sent;
            st.lost_sent = true;

            notify
        }
    };

    cancel_timer(inner);
    inner.session.close();

    // Wake blocked retries so they observe the lost state.
    inner.reconnected.notify_waiters();

    if notify {
        warn!("Store connection lost: {}", reason);

        let _ = inner.events_tx.send(ClientEvent::ConnectionLost);
    }
}
