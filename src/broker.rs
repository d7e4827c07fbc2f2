//! WebSocket front door.
//!
//! Every upgrade request is resolved against a path-keyed dispatch table.
//! Exact matches win; anything else goes to the fallback handler, which in
//! this server is the terminal session flow.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::ConnectionLimiter;
use crate::config::ServerConfig;
use crate::notes::{NotesHub, NOTES_PATH};
use crate::pty::{BridgeSettings, ChildEnv, ProcessSupervisor, PtyBridge, SpawnSpec};

/// One accepted upgrade request.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub peer: SocketAddr,
    pub path: String,
}

/// Strategy for one kind of endpoint.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Decide before the upgrade. A `false` answers the handshake with 503.
    fn admit(&self, _conn: &Connection) -> bool {
        true
    }

    /// Undo `admit`. Called once, after `serve` finished or the upgrade
    /// never completed.
    fn release(&self, _conn: &Connection) {}

    fn serve(self: Arc<Self>, socket: WebSocket, conn: Connection) -> BoxFuture<'static, ()>;
}

/// Path -> handler table with a catch-all.
#[derive(Clone)]
pub struct DispatchTable {
    routes: HashMap<String, Arc<dyn ConnectionHandler>>,
    fallback: Arc<dyn ConnectionHandler>,
}

impl DispatchTable {
    pub fn new(fallback: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.routes.insert(path.into(), handler);
        self
    }

    pub fn resolve(&self, path: &str) -> Arc<dyn ConnectionHandler> {
        self.routes
            .get(path)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Releases an admitted connection when dropped, whether or not the
/// upgrade ever ran.
struct Admitted {
    handler: Arc<dyn ConnectionHandler>,
    conn: Connection,
}

impl Drop for Admitted {
    fn drop(&mut self) {
        self.handler.release(&self.conn);
    }
}

async fn dispatch(
    State(table): State<Arc<DispatchTable>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let conn = Connection {
        id: Uuid::new_v4().to_string(),
        peer,
        path: uri.path().to_string(),
    };
    let handler = table.resolve(&conn.path);

    if !handler.admit(&conn) {
        warn!(peer = %peer, path = %conn.path, "Refusing connection: limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let admitted = Admitted { handler, conn };
    ws.on_upgrade(move |socket| async move {
        let kind = admitted.handler.kind();
        let conn = admitted.conn.clone();
        info!(peer = %conn.peer, path = %conn.path, id = %conn.id, kind, "Client connected");
        Arc::clone(&admitted.handler)
            .serve(socket, conn.clone())
            .await;
        drop(admitted);
        info!(peer = %conn.peer, path = %conn.path, id = %conn.id, kind, "Client disconnected");
    })
}

/// Terminal endpoint: one PTY child per admitted connection.
pub struct TerminalSessions {
    bridge: PtyBridge,
    limiter: Arc<ConnectionLimiter>,
}

impl TerminalSessions {
    pub fn new(bridge: PtyBridge, limiter: Arc<ConnectionLimiter>) -> Self {
        Self { bridge, limiter }
    }
}

impl ConnectionHandler for TerminalSessions {
    fn kind(&self) -> &'static str {
        "terminal"
    }

    fn admit(&self, conn: &Connection) -> bool {
        self.limiter.add(&conn.id)
    }

    fn release(&self, conn: &Connection) {
        self.limiter.remove(&conn.id);
    }

    fn serve(self: Arc<Self>, socket: WebSocket, conn: Connection) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.bridge.run(socket, &conn.id, conn.peer).await })
    }
}

impl ConnectionHandler for NotesHub {
    fn kind(&self) -> &'static str {
        "notes"
    }

    fn serve(self: Arc<Self>, socket: WebSocket, conn: Connection) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.serve_socket(socket, &conn.id).await })
    }
}

/// `ws://` URL of the notes endpoint as seen from this host. Wildcard
/// listen addresses are rewritten to loopback so children can dial it.
pub fn notes_url_for(addr: SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("ws://{}{}", SocketAddr::new(ip, addr.port()), NOTES_PATH)
}

/// The tunnel server: owns the listener, the child registry, the admission
/// limiter and the notes state.
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    local_addr: SocketAddr,
    supervisor: ProcessSupervisor,
    limiter: Arc<ConnectionLimiter>,
    notes: Arc<NotesHub>,
    table: Arc<DispatchTable>,
}

impl TunnelServer {
    /// Bind exactly `bind_address:port` from `config`.
    pub async fn bind(config: ServerConfig, argv: Vec<String>, env: ChildEnv) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Self::bind_listener(config, listener, argv, env)
    }

    /// Use an already bound listener. The configured port is ignored.
    pub fn bind_listener(
        config: ServerConfig,
        listener: TcpListener,
        argv: Vec<String>,
        env: ChildEnv,
    ) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        let config = Arc::new(config);
        let supervisor = ProcessSupervisor::new();
        let limiter = Arc::new(ConnectionLimiter::new(config.max_connections()));
        let notes = Arc::new(NotesHub::new());

        let child_env = env
            .notes_url(notes_url_for(local_addr))
            .compose_from_process();
        let spec = SpawnSpec::new(argv, child_env);
        let bridge = PtyBridge::new(
            supervisor.clone(),
            spec,
            BridgeSettings {
                buffer_size: config.buffer_size(),
                idle_timeout: config.connection_timeout(),
                keepalive_interval: config.keepalive_interval(),
                terminate_grace: config.terminate_grace(),
            },
        );

        let terminals: Arc<dyn ConnectionHandler> =
            Arc::new(TerminalSessions::new(bridge, Arc::clone(&limiter)));
        let notes_handler: Arc<dyn ConnectionHandler> = notes.clone();
        let table = Arc::new(DispatchTable::new(terminals).route(NOTES_PATH, notes_handler));

        Ok(Self {
            config,
            listener,
            local_addr,
            supervisor,
            limiter,
            notes,
            table,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn notes_url(&self) -> String {
        notes_url_for(self.local_addr)
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    pub fn notes(&self) -> &Arc<NotesHub> {
        &self.notes
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&self.table))
            .layer(TraceLayer::new_for_http())
    }

    /// Accept connections until `stop` resolves, then sweep every child
    /// still registered.
    pub async fn run_until<F>(self, stop: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            addr = %self.local_addr,
            max_connections = self.config.max_connections(),
            "Tunnel server listening"
        );
        let app = self.router();
        let serve = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future();

        let result = tokio::select! {
            res = serve => res.context("Server error"),
            _ = stop => {
                info!("Stop requested, no longer accepting connections");
                Ok(())
            }
        };

        self.supervisor
            .shutdown_sweep(self.config.shutdown_grace())
            .await;
        info!("Tunnel server stopped");
        result
    }

    /// Run until SIGTERM or Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

/// Resolves on the first SIGTERM or Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
