use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use duet_client::{CoachChat, Notice, RequestGateway, SessionStore};
use duet_core::Role;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

#[tokio::test]
async fn send_appends_user_and_assistant_optimistically() {
    let server = new_server();
    let (base_url, shutdown_tx) = start_server(coach_router(server.clone())).await;
    let (gateway, _notices) = new_gateway(&base_url);

    let mut chat = CoachChat::new(gateway);
    let reply = chat.send("we argued again").await.expect("send");
    assert_eq!(reply, "take a breath first");

    let messages = chat.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "we argued again");
    assert!(
        messages[0].id.confirmed().is_none(),
        "local echo should not carry a server id"
    );
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "take a breath first");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn reload_replaces_local_echoes_with_server_history() {
    let server = new_server();
    server.lock().expect("server state").history = vec![
        coach_msg(10, "user", "we argued again"),
        coach_msg(11, "assistant", "take a breath first"),
    ];
    let (base_url, shutdown_tx) = start_server(coach_router(server.clone())).await;
    let (gateway, _notices) = new_gateway(&base_url);

    let mut chat = CoachChat::new(gateway);
    chat.send("we argued again").await.expect("send");
    assert!(chat.messages().iter().all(|m| m.id.confirmed().is_none()));

    chat.load().await.expect("reload");
    let ids: Vec<Option<u64>> = chat.messages().iter().map(|m| m.id.confirmed()).collect();
    assert_eq!(ids, vec![Some(10), Some(11)]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn clear_empties_the_log_on_server_confirmation() {
    let server = new_server();
    server.lock().expect("server state").history = vec![coach_msg(10, "user", "hello")];
    let (base_url, shutdown_tx) = start_server(coach_router(server.clone())).await;
    let (gateway, _notices) = new_gateway(&base_url);

    let mut chat = CoachChat::new(gateway);
    chat.load().await.expect("load");
    assert_eq!(chat.messages().len(), 1);

    chat.clear().await.expect("clear");
    assert!(chat.messages().is_empty());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn failed_send_keeps_the_local_echo_and_reports_the_server_message() {
    let server = new_server();
    server.lock().expect("server state").reject_chat = true;
    let (base_url, shutdown_tx) = start_server(coach_router(server.clone())).await;
    let (gateway, _notices) = new_gateway(&base_url);

    let mut chat = CoachChat::new(gateway);
    let err = chat.send("anyone there?").await.expect_err("send must fail");
    assert_eq!(err.to_string(), "coach unavailable");

    let messages = chat.messages();
    assert_eq!(messages.len(), 1, "failed send should keep the user's line");
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "anyone there?");

    let _ = shutdown_tx.send(());
}

#[derive(Default)]
struct CoachState {
    history: Vec<Value>,
    reject_chat: bool,
}

type CoachServer = Arc<Mutex<CoachState>>;

fn new_server() -> CoachServer {
    Arc::new(Mutex::new(CoachState::default()))
}

fn coach_msg(id: u64, role: &str, content: &str) -> Value {
    json!({
        "id": id,
        "role": role,
        "content": content,
        "created_at": "2026-08-29 09:00:00"
    })
}

async fn chat_endpoint(State(state): State<CoachServer>, Json(_body): Json<Value>) -> Json<Value> {
    if state.lock().expect("server state").reject_chat {
        Json(json!({ "success": false, "message": "coach unavailable" }))
    } else {
        Json(json!({ "success": true, "data": { "reply": "take a breath first" } }))
    }
}

async fn history_endpoint(State(state): State<CoachServer>) -> Json<Value> {
    let history = state.lock().expect("server state").history.clone();
    Json(json!({ "success": true, "data": { "messages": history } }))
}

async fn clear_endpoint(State(state): State<CoachServer>) -> Json<Value> {
    state.lock().expect("server state").history.clear();
    Json(json!({ "success": true }))
}

fn coach_router(server: CoachServer) -> Router {
    Router::new()
        .route("/api/coach/chat", post(chat_endpoint))
        .route("/api/coach/history", get(history_endpoint))
        .route("/api/coach/clear", post(clear_endpoint))
        .with_state(server)
}

fn new_gateway(base_url: &str) -> (Arc<RequestGateway>, mpsc::UnboundedReceiver<Notice>) {
    let dir = tempfile::tempdir().expect("session dir");
    let session = Arc::new(SessionStore::open(dir.keep().join("session.json")));
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(
        RequestGateway::new(base_url, session, notice_tx).expect("gateway init"),
    );
    (gateway, notice_rx)
}

async fn start_server(router: Router) -> (String, oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral socket");
    let address = listener.local_addr().expect("server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{address}"), shutdown_tx)
}
