// Warden - Unix Domain Socket Server
//
// Owns the listening socket and the connection registry. Admission goes
// through a semaphore sized to `max_connections`; a connection that
// cannot get a permit is dropped before any protocol exchange. Each
// admitted connection gets its own serving task which reads one
// envelope, answers it, and only then reads the next.
//
// Shutdown cancels a token shared by the accept loop and every serving
// task, waits for the tasks to drain, and removes the socket file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capability::CapabilityEngine;
use crate::config::ServerConfig;
use crate::error::{Result, WardenError};
use crate::policy::PolicyEngine;
use crate::protocol::{Envelope, EnvelopeCodec};

use super::caller::CallerInfo;
use super::connection::{Connection, ConnectionInfo};
use super::handlers;

/// Upper bound on how long `stop()` waits for serving tasks to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

// ─── Shared State ────────────────────────────────────────────────────────────

struct RegistryEntry {
    info: ConnectionInfo,
    cancel: CancellationToken,
}

/// State shared by the accept loop, serving tasks, and handlers.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) policy: Arc<dyn PolicyEngine>,
    pub(crate) engine: Arc<dyn CapabilityEngine>,
    pub(crate) started_at: Instant,
    owner_uid: AtomicU32,
    registry: RwLock<HashMap<String, RegistryEntry>>,
}

impl ServerState {
    pub(crate) fn new(
        config: ServerConfig,
        policy: Arc<dyn PolicyEngine>,
        engine: Arc<dyn CapabilityEngine>,
    ) -> Self {
        Self {
            config,
            policy,
            engine,
            started_at: Instant::now(),
            owner_uid: AtomicU32::new(u32::MAX),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Uid owning the bound socket file.
    pub(crate) fn owner_uid(&self) -> u32 {
        self.owner_uid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner_uid(&self, uid: u32) {
        self.owner_uid.store(uid, Ordering::Relaxed);
    }

    pub(crate) fn connection_count(&self) -> usize {
        match self.registry.read() {
            Ok(registry) => registry.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = match self.registry.read() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.values().map(|entry| entry.info.clone()).collect()
    }

    fn register(&self, conn: &Connection, cancel: CancellationToken) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.insert(
            conn.id().to_string(),
            RegistryEntry {
                info: conn.info(),
                cancel,
            },
        );
    }

    /// Update the registry snapshot of `conn`.
    pub(crate) fn refresh(&self, conn: &Connection) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = registry.get_mut(conn.id()) {
            entry.info = conn.info();
        }
    }

    fn deregister(&self, id: &str) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.remove(id);
    }

    /// Force every tracked connection closed.
    fn close_all(&self) {
        let registry = match self.registry.read() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in registry.values() {
            entry.cancel.cancel();
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

struct Running {
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
    tracker: TaskTracker,
}

/// Unix Domain Socket server for the capability broker.
pub struct UdsServer {
    state: Arc<ServerState>,
    admission: Arc<Semaphore>,
    cleanup_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl UdsServer {
    pub fn new(
        config: ServerConfig,
        policy: Arc<dyn PolicyEngine>,
        engine: Arc<dyn CapabilityEngine>,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_connections));
        Self {
            state: Arc::new(ServerState::new(config, policy, engine)),
            admission,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            running: Mutex::new(None),
        }
    }

    /// Interval of the expired-capability purge task.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.state.config.socket_path
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state.connections()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the socket and start accepting connections.
    pub async fn start(&self) -> Result<()> {
        self.state.config.validate()?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WardenError::Transport("server is already running".to_string()));
        }

        let path = self.state.config.socket_path.clone();
        let listener = bind_socket(&path, self.state.config.socket_mode)
            .await
            .map_err(|e| {
                WardenError::Transport(format!("failed to bind {}: {}", path.display(), e))
            })?;
        self.state.set_owner_uid(socket_owner(&path).unwrap_or(u32::MAX));

        tracing::info!(
            socket = %path.display(),
            max_connections = self.state.config.max_connections,
            auth_enabled = self.state.config.auth_enabled,
            "Warden UDS server listening"
        );

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.state),
            Arc::clone(&self.admission),
            shutdown.clone(),
            tracker.clone(),
        ));
        let cleanup_task = tokio::spawn(cleanup_loop(
            Arc::clone(&self.state),
            self.cleanup_interval,
            shutdown.clone(),
        ));

        *running = Some(Running {
            shutdown,
            accept_task,
            cleanup_task,
            tracker,
        });
        Ok(())
    }

    /// Stop accepting, close every connection, wait for serving tasks, and
    /// remove the socket file. Calling `stop` on a stopped server is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        self.state.close_all();

        if let Err(e) = running.accept_task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }
        running.cleanup_task.abort();

        running.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, running.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = running.tracker.len(),
                "Serving tasks did not exit within the shutdown grace period"
            );
        }

        let path = &self.state.config.socket_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %path.display(), error = %e, "Failed to remove socket"),
        }

        tracing::info!(socket = %path.display(), "Warden UDS server stopped");
        Ok(())
    }
}

/// Bind under a staging name, apply `mode`, then rename into place so the
/// socket never appears at `path` with umask-derived permissions.
async fn bind_socket(path: &Path, mode: u32) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
    }

    // Remove stale socket file if it exists
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let staging = staging_path(path);
    let _ = tokio::fs::remove_file(&staging).await;
    let listener = UnixListener::bind(&staging)?;

    let placed = async {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&staging, perms).await?;
        tokio::fs::rename(&staging, path).await
    }
    .await;
    if let Err(e) = placed {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }

    Ok(listener)
}

/// Hidden sibling of `path` used while the socket is being prepared.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "warden.sock".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn socket_owner(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|meta| meta.uid())
}

// ─── Accept Loop ─────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: UnixListener,
    state: Arc<ServerState>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let permit = match Arc::clone(&admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    max_connections = state.config.max_connections,
                    "Connection limit reached, closing new connection"
                );
                drop(stream);
                continue;
            }
        };

        let state = Arc::clone(&state);
        let cancel = shutdown.child_token();
        tracker.spawn(serve_connection(stream, state, permit, cancel));
    }

    tracing::debug!("Accept loop stopped");
}

async fn cleanup_loop(state: Arc<ServerState>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = state.engine.purge_expired();
                if removed > 0 {
                    tracing::info!(removed, "Purged expired capabilities");
                }
            }
        }
    }
}

// ─── Serving Loop ────────────────────────────────────────────────────────────

async fn serve_connection(
    stream: UnixStream,
    state: Arc<ServerState>,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let caller = match CallerInfo::from_stream(&stream) {
        Ok(info) => tokio::task::spawn_blocking(move || info.fingerprint()).await.ok(),
        Err(e) => {
            tracing::debug!(error = %e, "Peer credentials unavailable");
            None
        }
    };

    let mut conn = Connection::new(caller);
    state.register(&conn, cancel.clone());
    let _registration = Registration {
        state: Arc::clone(&state),
        id: conn.id().to_string(),
        permit: Some(permit),
    };
    tracing::info!(connection_id = %conn.id(), remote = %conn.remote(), "Client connected");

    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    let write_deadline = state.config.request_timeout();

    loop {
        let read_deadline = if state.config.auth_enabled && !conn.is_authenticated() {
            state.config.auth_timeout()
        } else {
            state.config.conn_timeout()
        };

        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(connection_id = %conn.id(), "Closing connection for shutdown");
                break;
            }
            next = tokio::time::timeout(read_deadline, framed.next()) => next,
        };

        let item = match next {
            Err(_) => {
                tracing::info!(connection_id = %conn.id(), "Read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(connection_id = %conn.id(), error = %e, "Closing connection on decode failure");
                break;
            }
            Ok(Some(Ok(item))) => item,
        };

        conn.touch();
        state.refresh(&conn);

        let response = match item {
            Ok(request) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    request_id = %request.id,
                    kind = %request.kind(),
                    "Request received"
                );
                let id = request.id;
                Envelope::reply(id, handlers::dispatch(&state, &mut conn, request.message))
            }
            Err(rejection) => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    request_id = %rejection.id,
                    code = %rejection.code,
                    "Rejected request"
                );
                rejection.into_response()
            }
        };

        match tokio::time::timeout(write_deadline, framed.send(response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(connection_id = %conn.id(), error = %e, "Write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id = %conn.id(), "Write deadline expired");
                break;
            }
        }
    }

    tracing::info!(connection_id = %conn.id(), "Client disconnected");
}

/// Removes a connection from the registry and releases its admission
/// permit when the serving task ends, including by unwinding.
struct Registration {
    state: Arc<ServerState>,
    id: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Release admission before the entry disappears so an observed
        // count of zero implies a free slot.
        drop(self.permit.take());
        self.state.deregister(&self.id);
    }
}

/// Default socket path, re-exported for callers that only use the gateway.
pub fn default_socket_path() -> PathBuf {
    crate::config::default_socket_path()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{EngineConfig, MemoryCapabilityEngine};
    use crate::policy::{Effect, RulePolicyEngine};
    use crate::protocol::{decode, encode, ErrorCode, Message, MessageKind};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn server(dir: &Path, max_connections: usize) -> UdsServer {
        let config = ServerConfig {
            socket_path: dir.join("warden.sock"),
            max_connections,
            auth_enabled: false,
            ..Default::default()
        };
        let policy = RulePolicyEngine::from_policies(vec![], Effect::Allow).unwrap();
        let engine = MemoryCapabilityEngine::new(EngineConfig::default());
        UdsServer::new(config, Arc::new(policy), Arc::new(engine))
    }

    async fn roundtrip(
        reader: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        line: &str,
    ) -> Envelope {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let reply = reader.next_line().await.unwrap().unwrap();
        decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_start_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();

        let mode = std::fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        server.stop().await.unwrap();
        assert!(!server.socket_path().exists());
        // Idempotent
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_directory_is_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run").join("warden");
        let server = server(&run_dir, 4);
        server.start().await.unwrap();

        let dir_mode = std::fs::metadata(&run_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let sock_mode = std::fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(sock_mode & 0o777, 0o600);
        // Only the socket itself is left behind.
        let entries: Vec<_> = std::fs::read_dir(&run_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);

        server.stop().await.unwrap();
    }

    #[test]
    fn test_staging_path_is_hidden_sibling() {
        let staging = staging_path(Path::new("/run/warden/agent.sock"));
        assert_eq!(staging.parent(), Some(Path::new("/run/warden")));
        let name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".agent.sock."));
        assert!(name.ends_with(".tmp"));
    }

    #[tokio::test]
    async fn test_registry_tracks_last_activity() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let ping = encode(&Envelope::new(Message::PingRequest)).unwrap();

        roundtrip(&mut lines, &mut write, &ping).await;
        let first = server.connections()[0].last_activity;

        tokio::time::sleep(Duration::from_millis(300)).await;
        roundtrip(&mut lines, &mut write, &ping).await;
        let second = server.connections()[0].last_activity;
        assert!(second > first);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_registry_entry_and_permit() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 1);
        server.start().await.unwrap();
        let ping = encode(&Envelope::new(Message::PingRequest)).unwrap();

        for _ in 0..3 {
            let stream = UnixStream::connect(server.socket_path()).await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            roundtrip(&mut lines, &mut write, &ping).await;
            assert_eq!(server.connection_count(), 1);
            drop(write);
            drop(lines);

            let deadline = Instant::now() + Duration::from_secs(2);
            while server.connection_count() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(server.connection_count(), 0);
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("warden.sock"), b"stale").unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();
        assert!(UnixStream::connect(server.socket_path()).await.is_ok());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(WardenError::Transport(_))));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_connection_usable() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let bogus = r#"{"version":"1.0","type":"capability_renew","id":"r-1","timestamp":"2024-01-01T00:00:00Z","payload":{}}"#;
        let reply = roundtrip(&mut lines, &mut write, bogus).await;
        assert_eq!(reply.id, "r-1");
        match reply.message {
            Message::Error(e) => assert_eq!(e.code, ErrorCode::UnknownMessageType),
            other => panic!("unexpected {:?}", other),
        }

        let ping = encode(&Envelope::reply("r-2", Message::PingRequest)).unwrap();
        let reply = roundtrip(&mut lines, &mut write, &ping).await;
        assert_eq!(reply.id, "r-2");
        assert_eq!(reply.kind(), MessageKind::PingResponse);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"this is not json\n").await.unwrap();
        assert!(lines.next_line().await.unwrap().is_none());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit_drops_extra_connections() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 1);
        server.start().await.unwrap();

        let first = UnixStream::connect(server.socket_path()).await.unwrap();
        let (r1, mut w1) = first.into_split();
        let mut l1 = BufReader::new(r1).lines();
        let ping = encode(&Envelope::new(Message::PingRequest)).unwrap();
        roundtrip(&mut l1, &mut w1, &ping).await;
        assert_eq!(server.connection_count(), 1);

        let second = UnixStream::connect(server.socket_path()).await.unwrap();
        let (r2, _w2) = second.into_split();
        let mut l2 = BufReader::new(r2).lines();
        // Closed without any protocol exchange.
        let closed = tokio::time::timeout(Duration::from_secs(2), l2.next_line())
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert!(server.connection_count() <= 1);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_open_connections() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), 4);
        server.start().await.unwrap();

        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let ping = encode(&Envelope::new(Message::PingRequest)).unwrap();
        roundtrip(&mut lines, &mut write, &ping).await;

        server.stop().await.unwrap();
        assert_eq!(server.connection_count(), 0);
        assert!(matches!(lines.next_line().await, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let config = ServerConfig {
            socket_path: blocker.join("warden.sock"),
            auth_enabled: false,
            ..Default::default()
        };
        let policy = RulePolicyEngine::from_policies(vec![], Effect::Allow).unwrap();
        let engine = MemoryCapabilityEngine::new(EngineConfig::default());
        let server = UdsServer::new(config, Arc::new(policy), Arc::new(engine));
        assert!(matches!(server.start().await, Err(WardenError::Transport(_))));
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.ends_with("warden/agent.sock"));
    }
}
