//! End-to-end tests: a real server on 127.0.0.1:0 driven by
//! tokio-tungstenite clients, with /bin/sh children.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use delta_tunnel::pty::{process_exists, ChildEnv, ProcessSupervisor};
use delta_tunnel::{ConnectionLimiter, NotesHub, NotesMessage, ServerConfig, TunnelServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(10);

struct Harness {
    addr: SocketAddr,
    supervisor: ProcessSupervisor,
    limiter: Arc<ConnectionLimiter>,
    notes: Arc<NotesHub>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(config: ServerConfig, argv: Vec<String>, env: ChildEnv) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TunnelServer::bind_listener(config, listener, argv, env).unwrap();
        let addr = server.local_addr();
        let supervisor = server.supervisor().clone();
        let limiter = Arc::clone(server.limiter());
        let notes = Arc::clone(server.notes());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            stop_rx.await.ok();
        }));
        Self {
            addr,
            supervisor,
            limiter,
            notes,
            stop: Some(stop_tx),
            handle,
        }
    }

    async fn sh(script: &str) -> Self {
        Self::start(default_config(), sh(script), ChildEnv::new()).await
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn connect(&self, path: &str) -> Ws {
        let (ws, _) = tokio::time::timeout(STEP, connect_async(self.url(path)))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        ws
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(STEP, self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn default_config() -> ServerConfig {
    ServerConfig::builder()
        .terminate_grace(Duration::from_millis(500))
        .shutdown_grace(Duration::from_millis(100))
        .build()
        .unwrap()
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

async fn read_until_closed(ws: &mut Ws) -> Vec<u8> {
    let mut out = Vec::new();
    let drain = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => out.extend(data),
                Ok(Message::Text(text)) => out.extend(text.into_bytes()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    tokio::time::timeout(STEP, drain)
        .await
        .expect("session did not close");
    out
}

async fn next_notes(ws: &mut Ws) -> NotesMessage {
    loop {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("no notes message")
            .expect("notes socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return NotesMessage::parse(&text).unwrap();
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn child_output_arrives_byte_for_byte() {
    let server = Harness::sh(r"printf 'A\001\033[31mB\377Z'").await;
    let mut ws = server.connect("/").await;

    let out = read_until_closed(&mut ws).await;
    assert_eq!(out, b"A\x01\x1b[31mB\xffZ".to_vec());

    assert!(eventually(|| server.supervisor.registry().is_empty()).await);
    server.shutdown().await;
}

#[tokio::test]
async fn resize_sentinel_sets_child_window_size() {
    let server = Harness::sh("read line; stty size").await;
    let mut ws = server.connect("/").await;

    ws.send(Message::Text("RESIZE 120 40".into())).await.unwrap();
    ws.send(Message::Binary(b"\r".to_vec())).await.unwrap();

    let out = String::from_utf8_lossy(&read_until_closed(&mut ws).await).into_owned();
    assert!(out.contains("40 120"), "unexpected output {out:?}");
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_resize_is_ignored() {
    let server = Harness::sh("read line; stty size").await;
    let mut ws = server.connect("/").await;

    for bad in ["RESIZE abc 1", "RESIZE 0 5", "RESIZE 1 2 3"] {
        ws.send(Message::Text(bad.into())).await.unwrap();
    }
    ws.send(Message::Text("RESIZE 90 33".into())).await.unwrap();
    ws.send(Message::Binary(b"\r".to_vec())).await.unwrap();

    let out = String::from_utf8_lossy(&read_until_closed(&mut ws).await).into_owned();
    assert!(out.contains("33 90"), "unexpected output {out:?}");
    server.shutdown().await;
}

#[tokio::test]
async fn eof_marker_ends_child_naturally() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("finished");
    let script = format!("cat >/dev/null; echo done > '{}'", marker.display());
    let server = Harness::sh(&script).await;
    let mut ws = server.connect("/").await;

    assert!(eventually(|| server.supervisor.registry().len() == 1).await);
    let pid = server.supervisor.registry().pids()[0];

    ws.send(Message::Binary(vec![0x04])).await.unwrap();
    read_until_closed(&mut ws).await;

    assert!(eventually(|| !process_exists(pid)).await);
    assert!(server.supervisor.registry().is_empty());
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "done");
    server.shutdown().await;
}

#[tokio::test]
async fn child_environment_is_composed() {
    let env = ChildEnv::new().passthrough("DELTA_NEW", Some("/data/new".into()));
    let server = Harness::start(
        default_config(),
        sh(r#"printf '%s|%s|%s|%s' "$DELTA_SERVER_CHILD" "$DELTA_NOTES_URL" "${DELTA_MODE:-unset}" "$DELTA_NEW""#),
        env,
    )
    .await;
    let mut ws = server.connect("/").await;

    let out = String::from_utf8(read_until_closed(&mut ws).await).unwrap();
    let expected = format!("true|ws://{}/notes|unset|/data/new", server.addr);
    assert_eq!(out, expected);
    server.shutdown().await;
}

#[tokio::test]
async fn notes_converge_across_clients() {
    let server = Harness::sh("sleep 30").await;

    let mut a = server.connect("/notes").await;
    let mut b = server.connect("/notes").await;
    for ws in [&mut a, &mut b] {
        assert_eq!(
            next_notes(ws).await,
            NotesMessage::Sync {
                text: String::new(),
                source: None
            }
        );
    }

    let update = NotesMessage::Update {
        client_id: "client-a".into(),
        text: "hello".into(),
    };
    a.send(Message::Text(update.to_json())).await.unwrap();

    let expected = NotesMessage::Sync {
        text: "hello".into(),
        source: Some("client-a".into()),
    };
    assert_eq!(next_notes(&mut b).await, expected);
    assert_eq!(next_notes(&mut a).await, expected);
    assert_eq!(server.notes.text(), "hello");

    let mut c = server.connect("/notes").await;
    assert_eq!(
        next_notes(&mut c).await,
        NotesMessage::Sync {
            text: "hello".into(),
            source: None
        }
    );

    // Notes connections never spawn children or take admission slots.
    assert!(server.supervisor.registry().is_empty());
    assert_eq!(server.limiter.active_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn garbage_on_notes_channel_is_ignored() {
    let server = Harness::sh("sleep 30").await;
    let mut a = server.connect("/notes").await;
    next_notes(&mut a).await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    a.send(Message::Text(r#"{"type":"rename","text":"x"}"#.into()))
        .await
        .unwrap();
    a.send(Message::Text(
        NotesMessage::Update {
            client_id: "a".into(),
            text: "still here".into(),
        }
        .to_json(),
    ))
    .await
    .unwrap();

    match next_notes(&mut a).await {
        NotesMessage::Sync { text, .. } => assert_eq!(text, "still here"),
        other => panic!("unexpected {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn second_terminal_is_refused_at_capacity() {
    let config = ServerConfig::builder()
        .max_connections(1)
        .terminate_grace(Duration::from_millis(500))
        .build()
        .unwrap();
    let server = Harness::start(config, sh("sleep 30"), ChildEnv::new()).await;

    let mut a = server.connect("/").await;
    assert!(eventually(|| server.supervisor.registry().len() == 1).await);

    match connect_async(server.url("/")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        Err(e) => panic!("expected a 503 refusal, got {e}"),
        Ok(_) => panic!("second terminal was admitted past the limit"),
    }
    assert_eq!(server.supervisor.registry().len(), 1);

    // The notes endpoint stays reachable while terminals are full.
    let mut notes = server.connect("/notes").await;
    next_notes(&mut notes).await;

    a.close(None).await.unwrap();
    assert!(eventually(|| server.limiter.active_count() == 0).await);
    assert!(eventually(|| server.supervisor.registry().is_empty()).await);

    let _again = server.connect("/").await;
    assert!(eventually(|| server.supervisor.registry().len() == 1).await);
    server.shutdown().await;
}

#[tokio::test]
async fn idle_session_times_out() {
    let config = ServerConfig::builder()
        .connection_timeout_secs(1)
        .terminate_grace(Duration::from_millis(500))
        .build()
        .unwrap();
    let server = Harness::start(config, sh("sleep 30"), ChildEnv::new()).await;

    let mut ws = server.connect("/").await;
    assert!(eventually(|| server.supervisor.registry().len() == 1).await);
    let pid = server.supervisor.registry().pids()[0];

    read_until_closed(&mut ws).await;
    assert!(eventually(|| !process_exists(pid)).await);
    assert!(eventually(|| server.limiter.active_count() == 0).await);
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_sweeps_every_child() {
    let server = Harness::sh("trap '' TERM; while :; do sleep 1; done").await;

    let _a = server.connect("/").await;
    let _b = server.connect("/other").await;
    assert!(eventually(|| server.supervisor.registry().len() == 2).await);
    let pids = server.supervisor.registry().pids();
    let supervisor = server.supervisor.clone();

    server.shutdown().await;

    assert!(supervisor.registry().is_empty());
    for pid in pids {
        assert!(!process_exists(pid), "child {pid} survived shutdown");
    }
}
