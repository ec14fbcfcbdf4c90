use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::app::emit_new_message;
use crate::prompting::render_system_prompt;
use crate::store;
use crate::types::{AppState, ConversationTurn, NewMessageEvent};

pub const QUEUE_CAPACITY: usize = 64;
pub const WORKER_COUNT: usize = 4;

/// One inbound message awaiting orchestration.
#[derive(Debug, Clone)]
pub struct RelayJob {
    pub phone_number: String,
    pub text: String,
}

pub fn job_queue() -> (mpsc::Sender<RelayJob>, mpsc::Receiver<RelayJob>) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// Starts the relay worker pool. Workers pull from the shared queue; a job
/// failure ends at the worker boundary: logged, never retried.
pub fn spawn_workers(state: Arc<AppState>, jobs: mpsc::Receiver<RelayJob>) {
    let jobs = Arc::new(Mutex::new(jobs));
    for worker in 0..WORKER_COUNT {
        let state = state.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            loop {
                let job = { jobs.lock().await.recv().await };
                let Some(job) = job else { break };
                if let Err(err) = process_message(&state, &job).await {
                    warn!(
                        worker,
                        phone_number = %job.phone_number,
                        "relay task failed: {err}"
                    );
                }
            }
        });
    }
}

/// Per-message orchestration: bot gate, context fetch, model call, persist,
/// notify, reply dispatch. The webhook has already been acknowledged.
async fn process_message(state: &Arc<AppState>, job: &RelayJob) -> Result<(), String> {
    if !store::bot_status(&state.db, &job.phone_number).await? {
        info!(phone_number = %job.phone_number, "bot disabled, reply suppressed");
        return Ok(());
    }

    let context_text = fetch_sheets_context(state).await;

    state
        .sessions
        .append(&job.phone_number, ConversationTurn::user(job.text.clone()))
        .await;
    let history = state.sessions.snapshot(&job.phone_number).await;

    let reply = chat_completion(state, &history, &context_text).await?;

    #[cfg(feature = "sheets-script")]
    let reply = send_to_script(state, reply, &job.phone_number).await;

    store::save_conversation(&state.db, &job.phone_number, &job.text, &reply).await?;

    emit_new_message(state, NewMessageEvent::responded(&job.phone_number, &reply)).await;

    state
        .sessions
        .append(&job.phone_number, ConversationTurn::assistant(reply.clone()))
        .await;

    // Persistence and notification already happened; a failed dispatch is
    // logged and goes no further.
    if let Err(err) = send_to_whatsapp(state, &job.phone_number, &reply).await {
        warn!(phone_number = %job.phone_number, "reply dispatch failed: {err}");
    }

    Ok(())
}

/// GET `{sheets_url}?action=getContext`. Any transport or decode failure
/// degrades to an empty context; the flow continues.
async fn fetch_sheets_context(state: &Arc<AppState>) -> String {
    let url = state.config.sheets_url.trim();
    if url.is_empty() {
        return String::new();
    }

    let response = match state
        .http_client
        .get(url)
        .query(&[("action", "getContext")])
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!("context fetch failed: {err}");
            return String::new();
        }
    };

    match response.json::<Value>().await {
        Ok(payload) => payload
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        Err(err) => {
            debug!("context decode failed: {err}");
            String::new()
        }
    }
}

async fn chat_completion(
    state: &Arc<AppState>,
    history: &[ConversationTurn],
    context_text: &str,
) -> Result<String, String> {
    let api_key = state.config.openai_api_key.trim();
    if api_key.is_empty() {
        return Err("OPENAI_API_KEY not configured".to_string());
    }

    let mut messages =
        vec![json!({ "role": "system", "content": render_system_prompt(context_text) })];
    for turn in history {
        messages
            .push(serde_json::to_value(turn).map_err(|err| format!("turn encode failed: {err}"))?);
    }

    let response = state
        .http_client
        .post(&state.config.openai_api_url)
        .bearer_auth(api_key)
        .json(&json!({
            "model": state.config.openai_model,
            "messages": messages,
            "temperature": 0.3
        }))
        .send()
        .await
        .map_err(|err| format!("model request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("model API returned {status}: {body}"));
    }

    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("model response parse failed: {err}"))?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err("model response had empty content".to_string());
    }
    Ok(text)
}

/// Fixed-shape Cloud API send. The response body is not inspected.
pub async fn send_to_whatsapp(
    state: &Arc<AppState>,
    phone_number: &str,
    text: &str,
) -> Result<(), String> {
    let url = state.config.whatsapp_api_url.trim();
    if url.is_empty() {
        return Err("WHATSAPP_API_URL not configured".to_string());
    }

    state
        .http_client
        .post(url)
        .bearer_auth(&state.config.meta_access_token)
        .json(&json!({
            "messaging_product": "whatsapp",
            "to": phone_number,
            "text": { "body": text }
        }))
        .send()
        .await
        .map_err(|err| format!("whatsapp send failed: {err}"))?;
    Ok(())
}

/// Best-effort hand-off of the model reply to the Apps Script endpoint.
/// Falls back to the original reply on any failure or empty result.
#[cfg(feature = "sheets-script")]
async fn send_to_script(state: &Arc<AppState>, reply: String, phone_number: &str) -> String {
    let url = state.config.sheets_url.trim();
    if url.is_empty() {
        return reply;
    }

    let response = match state
        .http_client
        .post(url)
        .json(&json!({ "response": reply, "phoneNumber": phone_number }))
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!("script dispatch failed: {err}");
            return reply;
        }
    };

    match response.json::<Value>().await {
        Ok(payload) => match payload.get("result").and_then(Value::as_str) {
            Some(result) if !result.is_empty() => result.to_string(),
            _ => reply,
        },
        Err(err) => {
            warn!("script response decode failed: {err}");
            reply
        }
    }
}
