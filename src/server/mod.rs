//! Local HTTP API exposing device state and commands to a host application.

use crate::client::{CommandError, PrizrakClient};
use crate::dispatch::DeviceStateSink;
use crate::model::{Device, DeviceCommand, DeviceId, DeviceState, DeviceUpdate};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Fans device updates out to every `/ws` subscriber.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DeviceUpdate>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.tx.subscribe()
    }
}

impl DeviceStateSink for BroadcastSink {
    fn on_device_state(&self, update: &DeviceUpdate) {
        // No subscribers is the normal idle case.
        let _ = self.tx.send(update.clone());
    }
}

#[derive(Clone)]
struct ServerState {
    token: String,
    client: Arc<PrizrakClient>,
    updates: BroadcastSink,
}

#[derive(Debug, Serialize)]
struct DeviceView {
    device_id: DeviceId,
    device: Option<Device>,
    state: Option<DeviceState>,
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    client: Arc<PrizrakClient>,
    updates: BroadcastSink,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let state = Arc::new(ServerState {
        token,
        client,
        updates,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/devices", get(list_devices))
        .route("/devices/:id", get(get_device))
        .route("/devices/:id/commands/:command", post(send_command))
        .route("/reconnect", post(reconnect))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "local api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

async fn status(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.client.status()).into_response()
}

async fn list_devices(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let views = device_views(state.client.devices(), state.client.device_states());
    Json(views).into_response()
}

/// Directory entries joined with their states; devices seen only through
/// events are listed too.
fn device_views(devices: Vec<Device>, states: Vec<DeviceState>) -> Vec<DeviceView> {
    let mut states: HashMap<DeviceId, DeviceState> =
        states.into_iter().map(|s| (s.device_id, s)).collect();
    let mut views: Vec<DeviceView> = devices
        .into_iter()
        .map(|device| DeviceView {
            device_id: device.device_id,
            state: states.remove(&device.device_id),
            device: Some(device),
        })
        .collect();
    views.extend(states.into_values().map(|state| DeviceView {
        device_id: state.device_id,
        device: None,
        state: Some(state),
    }));
    views.sort_by_key(|view| view.device_id);
    views
}

async fn get_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let view = DeviceView {
        device_id,
        device: state.client.device(device_id),
        state: state.client.device_state(device_id),
    };
    if view.device.is_none() && view.state.is_none() {
        return (StatusCode::NOT_FOUND, "Unknown device").into_response();
    }
    Json(view).into_response()
}

async fn send_command(
    State(state): State<Arc<ServerState>>,
    Path((device_id, command)): Path<(DeviceId, String)>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let command: DeviceCommand = match command.parse() {
        Ok(command) => command,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let timeout = state.client.timings().command_timeout;
    match state.client.send_command(device_id, command, timeout).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "command": command, "result": result })),
        )
            .into_response(),
        Err(err) => (
            command_error_status(&err),
            Json(json!({ "ok": false, "command": command, "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn reconnect(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let closed = state.client.reconnect();
    (StatusCode::ACCEPTED, Json(json!({ "reconnecting": closed }))).into_response()
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let rx = state.updates.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<DeviceUpdate>) {
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Ok(update) => {
                    let payload = match serde_json::to_string(&update) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to encode device update");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "update subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

fn command_error_status(err: &CommandError) -> StatusCode {
    match err {
        CommandError::NotConnected | CommandError::ConnectionLost(_) => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::SendTimeout | CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CommandError::Rejected(_) => StatusCode::BAD_GATEWAY,
        CommandError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization header first, `?token=` for browsers.
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }
    query.get("token").map(|t| t == token).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientTimings;
    use crate::control::{ClientIdentity, ControlClient};
    use crate::passport::PassportClient;
    use crate::transport::SocketEndpoint;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn state() -> Arc<ServerState> {
        let updates = BroadcastSink::new();
        let passport = PassportClient::builder("http://127.0.0.1:9", "driver@example.test", "pw")
            .build()
            .unwrap();
        let control = ControlClient::builder(
            "http://127.0.0.1:9",
            ClientIdentity {
                app_name: "test".into(),
                app_version: "0".into(),
                app_host: String::new(),
                lang: "ru".into(),
            },
        )
        .build()
        .unwrap();
        let endpoint = SocketEndpoint {
            ws_url: "ws://127.0.0.1:9".into(),
            origin: "http://localhost".into(),
        };
        let client = PrizrakClient::new(
            passport,
            control,
            endpoint,
            ClientTimings::default(),
            Arc::new(updates.clone()),
        );
        Arc::new(ServerState {
            token: "secret".to_string(),
            client: Arc::new(client),
            updates,
        })
    }

    fn authorized() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers
    }

    #[test]
    fn token_accepted_from_header_or_query() {
        let mut query = HashMap::new();
        assert!(is_token_valid(&authorized(), &query, "secret"));
        assert!(!is_token_valid(&HeaderMap::new(), &query, "secret"));

        query.insert("token".to_string(), "secret".to_string());
        assert!(is_token_valid(&HeaderMap::new(), &query, "secret"));

        let mut wrong = HeaderMap::new();
        wrong.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert!(!is_token_valid(&wrong, &query, "secret"));
    }

    #[test]
    fn command_errors_map_to_gateway_statuses() {
        assert_eq!(
            command_error_status(&CommandError::NotConnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            command_error_status(&CommandError::Timeout(Duration::from_secs(10))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            command_error_status(&CommandError::Rejected("offline".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn broadcast_sink_reaches_subscribers() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        let update = DeviceUpdate {
            device_id: 7,
            partial: serde_json::Map::new(),
            state: DeviceState::new(7),
        };
        sink.on_device_state(&update);
        assert_eq!(rx.try_recv().unwrap().device_id, 7);
    }

    #[test]
    fn device_list_includes_devices_known_only_from_events() {
        let devices = vec![
            Device { device_id: 2, name: Some("Camry".into()), model: None },
            Device { device_id: 1, name: None, model: None },
        ];
        let states = vec![DeviceState::new(2), DeviceState::new(9)];

        let views = device_views(devices, states);
        let ids: Vec<DeviceId> = views.iter().map(|v| v.device_id).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert!(views[0].device.is_some() && views[0].state.is_none());
        assert!(views[1].device.is_some() && views[1].state.is_some());
        assert!(views[2].device.is_none() && views[2].state.is_some());
    }

    #[tokio::test]
    async fn command_route_rejects_unknown_command_and_reports_offline() {
        let state = state();
        let res = send_command(
            State(state.clone()),
            Path((7, "SelfDestruct".to_string())),
            authorized(),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send_command(
            State(state),
            Path((7, "guardon".to_string())),
            authorized(),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn device_routes_require_token_and_known_device() {
        let state = state();
        let res = list_devices(State(state.clone()), HeaderMap::new(), Query(HashMap::new())).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = get_device(State(state), Path(99), authorized(), Query(HashMap::new())).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
