//! Session history REST client.
//!
//! Consumed once at session start to seed the conversation with turns the
//! backend already persisted. Failures are reported but never block a session.

use serde::Deserialize;
use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    #[error("Network error fetching history: {0}")]
    Network(String),
    #[error("History API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to parse history response: {0}")]
    Parse(String),
}

/// One persisted chat message
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `GET /agent/chat/{session_id}/history`
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub message_count: usize,
}

/// A user message with the assistant reply that followed it, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredTurn {
    pub user: String,
    pub assistant: Option<String>,
}

/// Pair flat role-tagged messages into turns.
///
/// An assistant message with no preceding user message gets an empty user
/// side; consecutive user messages each become their own turn.
pub fn pair_turns(messages: &[HistoryMessage]) -> Vec<RestoredTurn> {
    let mut turns: Vec<RestoredTurn> = Vec::new();
    for message in messages {
        match message.role.as_str() {
            "user" => turns.push(RestoredTurn {
                user: message.content.clone(),
                assistant: None,
            }),
            "assistant" => match turns.last_mut() {
                Some(turn) if turn.assistant.is_none() => {
                    turn.assistant = Some(message.content.clone());
                }
                _ => turns.push(RestoredTurn {
                    user: String::new(),
                    assistant: Some(message.content.clone()),
                }),
            },
            other => log::debug!("History: skipping message with role {:?}", other),
        }
    }
    turns
}

fn history_url(http_base_url: &str, session_id: &SessionId) -> String {
    format!(
        "{}/agent/chat/{}/history",
        http_base_url.trim_end_matches('/'),
        session_id
    )
}

/// Fetch the persisted messages for `session_id`.
pub async fn fetch_history(
    http_base_url: &str,
    session_id: &SessionId,
) -> Result<Vec<HistoryMessage>, HistoryError> {
    let url = history_url(http_base_url, session_id);
    log::info!("History: fetching {}", url);

    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .map_err(|e| HistoryError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HistoryError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let history: HistoryResponse = response
        .json()
        .await
        .map_err(|e| HistoryError::Parse(e.to_string()))?;

    if !history.success {
        log::warn!("History: backend reported failure for {}", session_id);
    }
    log::info!(
        "History: {} messages for session {}",
        history.messages.len(),
        history.session_id
    );
    Ok(history.messages)
}

/// `DELETE /agent/chat/{session_id}/history`
pub async fn clear_history(
    http_base_url: &str,
    session_id: &SessionId,
) -> Result<(), HistoryError> {
    let url = history_url(http_base_url, session_id);
    log::info!("History: clearing {}", url);

    let response = reqwest::Client::new()
        .delete(&url)
        .send()
        .await
        .map_err(|e| HistoryError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HistoryError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}
