use std::{collections::HashMap, sync::atomic::AtomicUsize};

use chrono::Local;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};

use crate::relay::RelayJob;
use crate::session::SessionHistory;

/// Timestamp format shared by the conversation store and the dashboard feed.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_local() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One turn of a sender's in-memory history. Serializes directly into the
/// chat-completions message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Fan-out payload for the dashboard. Exactly one of `incoming_message` and
/// `response_message` is non-empty per emission.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessageEvent {
    pub phone_number: String,
    pub incoming_message: String,
    pub response_message: String,
    pub timestamp: String,
}

impl NewMessageEvent {
    pub fn received(phone_number: &str, text: &str) -> Self {
        Self {
            phone_number: phone_number.to_string(),
            incoming_message: text.to_string(),
            response_message: String::new(),
            timestamp: now_local(),
        }
    }

    pub fn responded(phone_number: &str, reply: &str) -> Self {
        Self {
            phone_number: phone_number.to_string(),
            incoming_message: String::new(),
            response_message: reply.to_string(),
            timestamp: now_local(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub phone_number: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleBotBody {
    pub phone_number: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRow {
    pub id: i64,
    pub phone_number: String,
    pub incoming_message: String,
    pub response_message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactRow {
    pub phone_number: String,
    pub last_message: String,
}

/// Environment-sourced configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub database_url: String,
    pub verify_token: String,
    pub openai_api_key: String,
    pub openai_api_url: String,
    pub openai_model: String,
    pub sheets_url: String,
    pub whatsapp_api_url: String,
    pub meta_access_token: String,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
}

pub struct AppState {
    pub db: SqlitePool,
    pub config: RelayConfig,
    pub sessions: SessionHistory,
    pub jobs: mpsc::Sender<RelayJob>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub http_client: reqwest::Client,
}
