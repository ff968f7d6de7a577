//! End-to-end over a real socket with a tungstenite client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use switchboard_core::{HandlerError, NodeId};
use switchboard_server::{
    HandlerContext, Hub, HubConfig, MessageDispatcher, PathHandler, Session, SwitchboardServer,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Clone, Default)]
struct Room {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PathHandler for Room {
    async fn on_message(
        &self,
        cx: &HandlerContext,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), HandlerError> {
        let _ = cx.broadcaster.broadcast(session.path(), text).await;
        Ok(())
    }

    async fn on_close(&self, _cx: &HandlerContext, _session: &Arc<Session>) -> Result<(), HandlerError> {
        let _ = self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct WhoAmI;

#[async_trait]
impl PathHandler for WhoAmI {
    async fn on_message(
        &self,
        _cx: &HandlerContext,
        session: &Arc<Session>,
        _text: &str,
    ) -> Result<(), HandlerError> {
        let who = session.user_id().unwrap_or("anonymous").to_string();
        session.send(who).map_err(|e| HandlerError::failed(e.to_string()))
    }
}

struct Running {
    addr: SocketAddr,
    hub: Arc<Hub>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn start(room: &Room) -> Running {
    start_with(room, HubConfig::default()).await
}

async fn start_with(room: &Room, config: HubConfig) -> Running {
    let dispatcher = MessageDispatcher::new()
        .route("/chat", room.clone())
        .route("/whoami", WhoAmI);
    let hub = Hub::with_node_id(NodeId::from("ws-node"), config, dispatcher, None);
    let server = SwitchboardServer::new(Arc::clone(&hub));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    Running { addr, hub, stop, task }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

#[tokio::test]
async fn chat_round_trip_and_close() {
    let room = Room::default();
    let server = start(&room).await;
    let url = format!("ws://{}/ws/chat", server.addr);

    let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
    let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
    let hub = Arc::clone(&server.hub);
    wait_until(|| hub.connection_count() == 2).await;

    alice.send(Message::text("hi all")).await.unwrap();
    assert_eq!(next_text(&mut alice).await, "hi all");
    assert_eq!(next_text(&mut bob).await, "hi all");

    bob.close(None).await.unwrap();
    wait_until(|| hub.connection_count() == 1).await;
    wait_until(|| room.closed.load(Ordering::SeqCst) == 1).await;

    let _ = server.stop.send(());
    server.task.await.unwrap();
    assert_eq!(hub.connection_count(), 0);
    assert_eq!(room.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn user_header_reaches_the_session() {
    let room = Room::default();
    let server = start(&room).await;
    let mut request = format!("ws://{}/ws/whoami", server.addr)
        .into_client_request()
        .unwrap();
    let _ = request.headers_mut().insert("x-user-id", "alice".parse().unwrap());

    let (mut client, _) = connect_async(request).await.unwrap();
    client.send(Message::text("?")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "alice");

    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn unknown_path_is_refused_before_upgrade() {
    let room = Room::default();
    let server = start(&room).await;
    let err = connect_async(format!("ws://{}/ws/missing", server.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 404),
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hub.connection_count(), 0);

    let _ = server.stop.send(());
    server.task.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let room = Room::default();
    let server = start(&room).await;
    let (mut client, _) = connect_async(format!("ws://{}/ws/chat", server.addr))
        .await
        .unwrap();
    let hub = Arc::clone(&server.hub);
    wait_until(|| hub.connection_count() == 1).await;

    let _ = server.stop.send(());
    let closed = timeout(WAIT, async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    server.task.await.unwrap();
    assert_eq!(room.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn answering_pings_does_not_keep_a_session_alive() {
    let room = Room::default();
    let config = HubConfig {
        session_timeout: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(100),
        ..HubConfig::default()
    };
    let server = start_with(&room, config).await;
    let (mut client, _) = connect_async(format!("ws://{}/ws/chat", server.addr))
        .await
        .unwrap();

    // Reading keeps the client answering the server's pings.
    let mut pings = 0usize;
    let closed = timeout(WAIT, async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Ping(_)) => pings += 1,
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(pings >= 1);

    let hub = Arc::clone(&server.hub);
    wait_until(|| hub.connection_count() == 0).await;
    wait_until(|| room.closed.load(Ordering::SeqCst) == 1).await;

    let _ = server.stop.send(());
    server.task.await.unwrap();
}
