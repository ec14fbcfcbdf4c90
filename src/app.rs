use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use minijinja::{context, Environment};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::relay::{self, RelayJob};
use crate::session::SessionHistory;
use crate::store;
use crate::types::{
    AppState, NewMessageEvent, RealtimeState, RelayConfig, SendMessageBody, ToggleBotBody,
};

const DASHBOARD_TEMPLATE: &str = include_str!("../templates/dashboard.html");

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn load_config() -> RelayConfig {
    RelayConfig {
        port: env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5000),
        database_url: env_or("DATABASE_URL", "sqlite://whatsapp.db?mode=rwc"),
        verify_token: env_or("VERIFY_TOKEN", ""),
        openai_api_key: env_or("OPENAI_API_KEY", ""),
        openai_api_url: env_or(
            "OPENAI_API_URL",
            "https://api.openai.com/v1/chat/completions",
        ),
        openai_model: env_or("OPENAI_CHAT_MODEL", "gpt-3.5-turbo"),
        sheets_url: env_or("GOOGLE_SHEETS_URL", ""),
        whatsapp_api_url: env_or("WHATSAPP_API_URL", ""),
        meta_access_token: env_or("META_ACCESS_TOKEN", ""),
    }
}

pub fn build_state(
    config: RelayConfig,
    db: SqlitePool,
    jobs: mpsc::Sender<RelayJob>,
) -> Arc<AppState> {
    Arc::new(AppState {
        db,
        config,
        sessions: SessionHistory::new(),
        jobs,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        http_client: reqwest::Client::new(),
    })
}

fn event_payload(event: &str, data: &NewMessageEvent) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

/// Fan-out: every connected dashboard client receives every event. No
/// filtering, no replay for late joiners, no acknowledgment.
pub async fn emit_new_message(state: &Arc<AppState>, event: NewMessageEvent) {
    let Some(payload) = event_payload("new_message", &event) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        rt.clients.values().cloned().collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn index() -> impl IntoResponse {
    "WebSocket server is running"
}

async fn dashboard() -> impl IntoResponse {
    let mut env = Environment::new();
    if let Err(err) = env.add_template("dashboard", DASHBOARD_TEMPLATE) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    let template = match env.get_template("dashboard") {
        Ok(template) => template,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };
    match template.render(context! { title => "Panel de conversaciones" }) {
        Ok(html) => Html(html).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !state.config.verify_token.is_empty()
        && verify_token == state.config.verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }

    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let message = payload
        .get("entry")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("changes"))
        .and_then(Value::as_array)
        .and_then(|changes| changes.first())
        .and_then(|change| change.get("value"))
        .and_then(|value| value.get("messages"))
        .and_then(Value::as_array)
        .and_then(|messages| messages.first());

    let text = message
        .and_then(|msg| msg.get("text"))
        .and_then(|text| text.get("body"))
        .and_then(Value::as_str);
    let from = message.and_then(|msg| msg.get("from")).and_then(Value::as_str);

    // Status callbacks and non-text payloads are acknowledged untouched.
    let (Some(text), Some(from)) = (text, from) else {
        return (StatusCode::OK, "OK");
    };

    emit_new_message(&state, NewMessageEvent::received(from, text)).await;

    let job = RelayJob {
        phone_number: from.to_string(),
        text: text.to_string(),
    };
    if let Err(err) = state.jobs.try_send(job) {
        warn!(phone_number = %from, "relay queue rejected job: {err}");
    }

    (StatusCode::OK, "OK")
}

async fn send_dashboard_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let (phone_number, message) = match (body.phone_number, body.message) {
        (Some(phone), Some(message)) if !phone.is_empty() && !message.is_empty() => {
            (phone, message)
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Falta número de teléfono o mensaje" })),
            )
                .into_response();
        }
    };

    if let Err(err) = relay::send_to_whatsapp(&state, &phone_number, &message).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response();
    }

    if let Err(err) = store::save_conversation(&state.db, &phone_number, "", &message).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response();
    }

    emit_new_message(&state, NewMessageEvent::responded(&phone_number, &message)).await;

    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

async fn get_contacts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match store::contacts(&state.db).await {
        Ok(contacts) => Json(contacts).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

async fn get_messages(
    Path(phone): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match store::conversations_by_phone(&state.db, &phone).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

async fn get_bot_status(
    Path(phone): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match store::bot_status(&state.db, &phone).await {
        Ok(is_active) => Json(json!({ "is_active": is_active })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

async fn toggle_bot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToggleBotBody>,
) -> impl IntoResponse {
    match store::set_bot_status(&state.db, &body.phone_number, body.is_active).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Dashboard clients only listen; inbound frames are drained until close.
    while let Some(Ok(message)) = ws_receiver.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
    }

    send_task.abort();
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/dashboard", get(dashboard))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/api/send-message", post(send_dashboard_message))
        .route("/api/contacts", get(get_contacts))
        .route("/api/messages/{phone}", get(get_messages))
        .route("/api/bot-status/{phone}", get(get_bot_status))
        .route("/api/toggle-bot", post(toggle_bot))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config();
    let port = config.port;
    let db = store::connect(&config.database_url)
        .await
        .expect("failed to open conversation store (set DATABASE_URL)");

    let (jobs_tx, jobs_rx) = relay::job_queue();
    let state = build_state(config, db, jobs_tx);
    relay::spawn_workers(state.clone(), jobs_rx);

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("relay server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
