use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use mockgate_core::ConsumerId;
use mockgate_settings::MockSettings;
use mockgate_store::{BypassConfigStore, PresetQueue};
use mockgate_upstream::Forwarder;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::coordinator::{CoordinatorConfig, RequestCoordinator};
use crate::handlers::{self, HandlerState};
use crate::hub::{self, BroadcastHub};

const SERVICE_BANNER: &str = "Mock OpenAI Tool API";
const CONTROL_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &MockSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue,
            heartbeat_interval: server.heartbeat_interval(),
            client_timeout: server.client_timeout(),
            cleanup_interval: server.cleanup_interval(),
            coordinator: CoordinatorConfig {
                timeout: settings.manual.timeout(),
                disconnect_poll_interval: settings.manual.disconnect_poll_interval(),
            },
        }
    }
}

/// Stores and upstream client the server answers from.
pub struct ServerDeps {
    pub presets: Arc<PresetQueue>,
    pub bypass: Arc<BypassConfigStore>,
    pub forwarder: Arc<dyn Forwarder>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub hub: Arc<BroadcastHub>,
    pub message_tx: mpsc::Sender<(ConsumerId, String)>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .merge(api::preset_routes())
        .merge(api::bypass_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let hub = Arc::new(BroadcastHub::new(config.max_send_queue, config.client_timeout));
    let coordinator = Arc::new(RequestCoordinator::new(
        Arc::clone(&hub),
        config.coordinator.clone(),
    ));

    let cleanup = hub::start_cleanup_task(Arc::clone(&hub), config.cleanup_interval);

    let (msg_tx, msg_rx) = mpsc::channel::<(ConsumerId, String)>(CONTROL_CHANNEL_CAPACITY);
    let control = tokio::spawn(handlers::process_control_messages(
        msg_rx,
        Arc::clone(&coordinator),
    ));

    let handler_state = Arc::new(HandlerState::new(
        coordinator,
        deps.presets,
        deps.bypass,
        deps.forwarder,
    ));
    let app_state = AppState {
        handler_state,
        hub,
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval,
    };

    let router = build_router(app_state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Mock server started");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        control,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    control: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait briefly for in-flight ones.
    /// Requests still held after the grace period are dropped, which
    /// cancels them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let server = self.server.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("Graceful shutdown timed out, aborting connections");
            server.abort();
        }
        self.control.abort();
        self.cleanup.abort();
        tracing::info!("Mock server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (consumer_id, rx) = state.handler_state.coordinator.attach_consumer();
    tracing::info!(consumer_id = %consumer_id, consumers = state.hub.count(), "Console connected");

    hub::handle_ws_connection(
        socket,
        consumer_id,
        rx,
        state.hub,
        state.message_tx,
        state.heartbeat_interval,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hs = &state.handler_state;
    Json(json!({
        "status": "healthy",
        "consumers": state.hub.count(),
        "manual": hs.coordinator.snapshot(),
        "bypass_enabled": hs.bypass.is_enabled(),
        "persistence": hs.presets.persist_status(),
    }))
}

async fn index_handler() -> impl IntoResponse {
    Json(json!({ "message": SERVICE_BANNER, "status": "running" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use mockgate_core::UpstreamError;
    use mockgate_upstream::{HttpForwarder, MockForwarder, MockReply};
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type WsStream =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestServer {
        handle: ServerHandle,
        base: String,
        presets: Arc<PresetQueue>,
    }

    async fn boot(timeout: Duration) -> TestServer {
        boot_with(timeout, Arc::new(HttpForwarder::new().unwrap())).await
    }

    async fn boot_with(timeout: Duration, forwarder: Arc<dyn Forwarder>) -> TestServer {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            coordinator: CoordinatorConfig {
                timeout,
                disconnect_poll_interval: Duration::from_millis(20),
            },
            ..Default::default()
        };
        let presets = Arc::new(PresetQueue::in_memory());
        let deps = ServerDeps {
            presets: Arc::clone(&presets),
            bypass: Arc::new(BypassConfigStore::in_memory()),
            forwarder,
        };
        let handle = start(config, deps).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        TestServer {
            handle,
            base,
            presets,
        }
    }

    async fn connect_console(port: u16) -> WsStream {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        ws
    }

    /// Next text frame as JSON, skipping control frames.
    async fn next_event(ws: &mut WsStream) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no event within 5s")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn next_event_of(ws: &mut WsStream, kind: &str) -> Value {
        loop {
            let event = next_event(ws).await;
            if event["type"] == kind {
                return event;
            }
        }
    }

    async fn send_frame(ws: &mut WsStream, text: String) {
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn health(base: &str) -> Value {
        reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    fn chat_body() -> Value {
        json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]})
    }

    #[test]
    fn config_from_settings() {
        let mut settings = MockSettings::default();
        settings.server.port = 9100;
        settings.manual.timeout_secs = 12;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 9100);
        assert_eq!(config.coordinator.timeout, Duration::from_secs(12));
        assert_eq!(config.coordinator.disconnect_poll_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn serves_health_and_banner() {
        let srv = boot(Duration::from_secs(5)).await;
        assert!(srv.handle.port > 0);

        let resp = reqwest::get(format!("{}/health", srv.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["consumers"], 0);
        assert_eq!(body["manual"]["live_cells"], 0);
        assert_eq!(body["bypass_enabled"], false);

        let banner: Value = reqwest::get(&srv.base).await.unwrap().json().await.unwrap();
        assert_eq!(banner["status"], "running");

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn operator_resolves_held_request() {
        let srv = boot(Duration::from_secs(10)).await;
        let mut console = connect_console(srv.handle.port).await;

        let url = format!("{}/v1/chat/completions", srv.base);
        let caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .header("x-trace-id", "t-1")
                .json(&chat_body())
                .send()
                .await
                .unwrap()
        });

        let announced = next_event_of(&mut console, "new_request").await;
        let data = &announced["data"];
        assert_eq!(data["ip"], "127.0.0.1");
        assert_eq!(data["path"], "/v1/chat/completions");
        assert_eq!(data["headers"]["x-trace-id"], "t-1");
        assert_eq!(data["body"]["model"], "gpt-4");

        let reply = json!({
            "type": "send_response",
            "id": data["id"],
            "status_code": 201,
            "response": {"choices": [{"message": {"content": "hello"}}]},
        });
        console
            .send(Message::Text(reply.to_string().into()))
            .await
            .unwrap();

        let resp = caller.await.unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello");

        let completed = next_event_of(&mut console, "completed_request").await;
        assert_eq!(completed["data"]["id"], data["id"]);
        assert_eq!(completed["data"]["status_code"], 201);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn late_console_sees_current_request() {
        let srv = boot(Duration::from_secs(10)).await;

        let url = format!("{}/v1/chat/completions", srv.base);
        let caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .json(&chat_body())
                .send()
                .await
                .unwrap()
        });

        let health_url = format!("{}/health", srv.base);
        for _ in 0..100 {
            let health: Value = reqwest::get(&health_url).await.unwrap().json().await.unwrap();
            if !health["manual"]["current"].is_null() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut console = connect_console(srv.handle.port).await;
        let announced = next_event_of(&mut console, "new_request").await;
        let reply = json!({"type": "send_response", "id": announced["data"]["id"], "response": {"ok": true}});
        console
            .send(Message::Text(reply.to_string().into()))
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().status(), 200);
        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let srv = boot(Duration::from_millis(200)).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], handlers::TIMEOUT_MESSAGE);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn non_json_body_rejected() {
        let srv = boot(Duration::from_secs(5)).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", srv.base))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn preset_answers_before_manual() {
        let srv = boot(Duration::from_millis(200)).await;
        let client = reqwest::Client::new();
        let mut console = connect_console(srv.handle.port).await;

        let added: Value = client
            .post(format!("{}/api/preset-queue/127.0.0.1", srv.base))
            .json(&json!({"response": {"preset": 1}, "status_code": 202}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(added["success"], true);
        assert_eq!(added["queue_length"], 1);

        let resp = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"preset": 1}));
        assert_eq!(srv.presets.queue_length("127.0.0.1"), 0);

        let completed = next_event_of(&mut console, "completed_request").await;
        assert_eq!(completed["data"]["response"], json!({"preset": 1}));

        // Queue drained, so the next call falls through to manual mode.
        let resp = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn preset_rest_endpoints() {
        let srv = boot(Duration::from_secs(5)).await;
        let client = reqwest::Client::new();
        let queue_url = format!("{}/api/preset-queue/10.0.0.1", srv.base);

        let rejected = client
            .post(&queue_url)
            .json(&json!({"response": [1, 2]}))
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status(), 400);

        let batch: Value = client
            .post(format!("{queue_url}/batch"))
            .json(&json!({"responses": [{"a": 1}, "bad", {"b": 2}]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(batch["added_count"], 2);
        assert_eq!(batch["failed_count"], 1);
        assert_eq!(batch["errors"][0]["index"], 1);

        let all: Value = reqwest::get(format!("{}/api/preset-queue", srv.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all["queues"]["10.0.0.1"]["count"], 2);

        let export = reqwest::get(format!("{queue_url}/export")).await.unwrap();
        assert_eq!(export.status(), 200);
        let disposition = export.headers()["content-disposition"].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=queue_10.0.0.1_"));
        let exported: Value = export.json().await.unwrap();
        assert_eq!(exported, json!([{"a": 1}, {"b": 2}]));

        let imported: Value = client
            .post(format!("{}/api/preset-queue/10.0.0.2/import", srv.base))
            .body(exported.to_string())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(imported["total"], 2);
        assert_eq!(imported["added_count"], 2);

        let missing = client
            .delete(format!("{queue_url}/no-such-id"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        let detail: Value = missing.json().await.unwrap();
        assert_eq!(detail["detail"], "response not found");

        let id = srv.presets.get_queue("10.0.0.1")[0].id.clone();
        let deleted = client
            .delete(format!("{queue_url}/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);
        assert_eq!(srv.presets.queue_length("10.0.0.1"), 1);

        assert_eq!(client.delete(&queue_url).send().await.unwrap().status(), 200);
        let unknown = client
            .delete(format!("{}/api/preset-queue/10.9.9.9", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 404);

        client
            .delete(format!("{}/api/preset-queue", srv.base))
            .send()
            .await
            .unwrap();
        let empty_export = reqwest::get(format!("{}/api/preset-queue/export", srv.base))
            .await
            .unwrap();
        assert_eq!(empty_export.status(), 404);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bypass_forwards_upstream() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "chatcmpl-real"})))
            .expect(1)
            .mount(&upstream)
            .await;

        let srv = boot(Duration::from_millis(200)).await;
        let client = reqwest::Client::new();
        let mut console = connect_console(srv.handle.port).await;

        let view: Value = client
            .put(format!("{}/api/bypass/config", srv.base))
            .json(&json!({
                "target_host": "127.0.0.1",
                "target_port": upstream.address().port(),
                "use_https": false,
                "api_key": "sk-test",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["api_key_configured"], true);
        assert!(view.get("api_key").is_none());

        let enabled = client
            .post(format!("{}/api/bypass/enable", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(enabled.status(), 200);

        let resp = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap()["id"], "chatcmpl-real");

        let request = next_event_of(&mut console, "bypass_request").await;
        assert!(request["data"]["target_url"]
            .as_str()
            .unwrap()
            .ends_with("/v1/chat/completions"));
        let response = next_event_of(&mut console, "bypass_response").await;
        assert_eq!(response["data"]["success"], true);

        let received = &upstream.received_requests().await.unwrap()[0];
        assert_eq!(
            received.headers["authorization"].to_str().unwrap(),
            "Bearer sk-test"
        );

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bypass_failure_is_bad_gateway() {
        let closed_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let srv = boot(Duration::from_millis(200)).await;
        let client = reqwest::Client::new();
        client
            .put(format!("{}/api/bypass/config", srv.base))
            .json(&json!({"target_host": "127.0.0.1", "target_port": closed_port}))
            .send()
            .await
            .unwrap();
        client
            .post(format!("{}/api/bypass/enable", srv.base))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_caller_frees_the_slot() {
        let srv = boot(Duration::from_secs(10)).await;
        let mut console = connect_console(srv.handle.port).await;

        let body = chat_body().to_string();
        let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", srv.handle.port))
            .await
            .unwrap();
        let request = format!(
            "POST /v1/chat/completions HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        raw.write_all(request.as_bytes()).await.unwrap();

        let first = next_event_of(&mut console, "new_request").await;
        let first_id = first["data"]["id"].clone();

        let url = format!("{}/v1/chat/completions", srv.base);
        let second_caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .json(&chat_body())
                .send()
                .await
                .unwrap()
        });
        for _ in 0..100 {
            if health(&srv.base).await["manual"]["queued"].as_array().map_or(0, Vec::len) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(raw);

        let next = next_event_of(&mut console, "new_request").await;
        let next_id = next["data"]["id"].clone();
        assert_ne!(next_id, first_id);

        let snapshot = health(&srv.base).await;
        assert_eq!(snapshot["manual"]["current"], next_id);
        assert_eq!(snapshot["manual"]["live_cells"], 1);

        // A late answer for the cancelled request changes nothing.
        let stale = json!({"type": "send_response", "id": first_id, "response": {"late": true}});
        send_frame(&mut console, stale.to_string()).await;
        let reply = json!({"type": "send_response", "id": next_id, "response": {"ok": true}});
        send_frame(&mut console, reply.to_string()).await;

        let resp = second_caller.await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": true}));

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bad_control_frames_leave_console_usable() {
        let srv = boot(Duration::from_secs(10)).await;
        let mut console = connect_console(srv.handle.port).await;

        let url = format!("{}/v1/chat/completions", srv.base);
        let caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .json(&chat_body())
                .send()
                .await
                .unwrap()
        });
        let announced = next_event_of(&mut console, "new_request").await;
        let id = announced["data"]["id"].clone();

        send_frame(&mut console, "{not json".to_string()).await;
        send_frame(&mut console, json!({"type": "subscribe"}).to_string()).await;
        let bad_status = json!({"type": "send_response", "id": id, "status_code": 5000, "response": {}});
        send_frame(&mut console, bad_status.to_string()).await;

        let reply = json!({"type": "send_response", "id": id, "status_code": 203, "response": {"after": "errors"}});
        send_frame(&mut console, reply.to_string()).await;

        let resp = caller.await.unwrap();
        assert_eq!(resp.status(), 203);
        assert_eq!(resp.json::<Value>().await.unwrap()["after"], "errors");
        assert_eq!(health(&srv.base).await["consumers"], 1);

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bypass_failure_reported_to_consoles() {
        let forwarder = Arc::new(MockForwarder::new(vec![
            MockReply::Error(UpstreamError::Connect {
                url: "http://api.openai.com:443/v1/chat/completions".into(),
                reason: "connection refused".into(),
            }),
            MockReply::Json(201, json!({"id": "chatcmpl-2"})),
        ]));
        let srv = boot_with(Duration::from_millis(200), Arc::clone(&forwarder) as Arc<dyn Forwarder>).await;
        let client = reqwest::Client::new();
        let mut console = connect_console(srv.handle.port).await;

        let enabled = client
            .post(format!("{}/api/bypass/enable", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(enabled.status(), 200);

        let failed = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .header("x-trace-id", "t-9")
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(failed.status(), 502);
        let body: Value = failed.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("connection refused"));

        let request = next_event_of(&mut console, "bypass_request").await;
        let response = next_event_of(&mut console, "bypass_response").await;
        assert_eq!(response["data"]["id"], request["data"]["id"]);
        assert_eq!(response["data"]["success"], false);
        assert_eq!(response["data"]["status_code"], 502);
        assert!(response["data"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to connect"));

        let ok = client
            .post(format!("{}/v1/chat/completions", srv.base))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 201);
        let response = next_event_of(&mut console, "bypass_response").await;
        assert_eq!(response["data"]["success"], true);
        assert!(response["data"].get("error").is_none());

        assert_eq!(forwarder.call_count(), 2);
        let calls = forwarder.calls();
        assert!(calls[0].url.ends_with("/v1/chat/completions"));
        assert_eq!(calls[0].headers["x-trace-id"], "t-9");
        assert_eq!(calls[0].body["model"], "gpt-4");

        srv.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bypass_config_validation() {
        let srv = boot(Duration::from_secs(5)).await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{}/api/bypass/config", srv.base))
            .json(&json!({"timeout": 0}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["detail"].as_str().unwrap().contains("timeout"));

        let disabled: Value = client
            .post(format!("{}/api/bypass/disable", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(disabled["enabled"], false);

        let view: Value = reqwest::get(format!("{}/api/bypass/config", srv.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["timeout"], 60);

        srv.handle.shutdown().await;
    }
}
