use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::ConversationTurn;

/// Newest turns kept per sender; older turns are evicted on append.
pub const MAX_TURNS_PER_SENDER: usize = 40;

/// Per-sender conversation history used to build model prompts.
///
/// Append and snapshot each hold the lock for their full duration, so
/// concurrent relay jobs for the same sender cannot interleave a
/// read-modify-write. State is process-lifetime only; restart loses it.
#[derive(Default)]
pub struct SessionHistory {
    turns: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, phone_number: &str, turn: ConversationTurn) {
        let mut turns = self.turns.lock().await;
        let history = turns.entry(phone_number.to_string()).or_default();
        history.push(turn);
        if history.len() > MAX_TURNS_PER_SENDER {
            let excess = history.len() - MAX_TURNS_PER_SENDER;
            history.drain(..excess);
        }
    }

    pub async fn snapshot(&self, phone_number: &str) -> Vec<ConversationTurn> {
        let turns = self.turns.lock().await;
        turns.get(phone_number).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn turns_keep_insertion_order() {
        let sessions = SessionHistory::new();
        sessions
            .append("56911112222", ConversationTurn::user("hola"))
            .await;
        sessions
            .append("56911112222", ConversationTurn::assistant("buenas"))
            .await;
        sessions
            .append("56911112222", ConversationTurn::user("quiero reservar"))
            .await;

        let history = sessions.snapshot("56911112222").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hola");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[2].content, "quiero reservar");
    }

    #[tokio::test]
    async fn senders_are_isolated() {
        let sessions = SessionHistory::new();
        sessions.append("111", ConversationTurn::user("a")).await;
        sessions.append("222", ConversationTurn::user("b")).await;

        assert_eq!(sessions.snapshot("111").await.len(), 1);
        assert_eq!(sessions.snapshot("222").await.len(), 1);
        assert!(sessions.snapshot("333").await.is_empty());
    }

    #[tokio::test]
    async fn oldest_turns_are_evicted_past_the_cap() {
        let sessions = SessionHistory::new();
        for i in 0..MAX_TURNS_PER_SENDER + 5 {
            sessions
                .append("111", ConversationTurn::user(i.to_string()))
                .await;
        }

        let history = sessions.snapshot("111").await;
        assert_eq!(history.len(), MAX_TURNS_PER_SENDER);
        assert_eq!(history[0].content, "5");
        assert_eq!(
            history.last().unwrap().content,
            (MAX_TURNS_PER_SENDER + 4).to_string()
        );
    }
}
