//! Status replies back to whoever asked for a merge
//!
//! The pipeline only needs to post a message and later edit it. A chat adapter, the
//! CLI and the tests each provide their own [`ReplySink`].

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::queue::UserId;

/// Handle to a message previously sent through a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("unknown message {0:?}")]
    UnknownMessage(MessageId),

    #[error("reply delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, text: &str) -> Result<MessageId, ReplyError>;

    async fn edit(&self, message: MessageId, text: &str) -> Result<(), ReplyError>;
}

/// Sink that only emits tracing events
pub struct LogReplySink {
    user_id: UserId,
    next: Mutex<u64>,
}

impl LogReplySink {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            next: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ReplySink for LogReplySink {
    async fn send(&self, text: &str) -> Result<MessageId, ReplyError> {
        let id = {
            let mut next = self.next.lock().map_err(|e| ReplyError::Delivery(e.to_string()))?;
            *next += 1;
            MessageId(*next)
        };
        info!(user_id = self.user_id, message = id.0, "{}", text);
        Ok(id)
    }

    async fn edit(&self, message: MessageId, text: &str) -> Result<(), ReplyError> {
        info!(user_id = self.user_id, message = message.0, edited = true, "{}", text);
        Ok(())
    }
}

/// Sink that keeps the latest text of every message in memory
#[derive(Default)]
pub struct BufferedReplySink {
    messages: Mutex<Vec<String>>,
}

impl BufferedReplySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current text of every message, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<String> {
        self.messages().pop()
    }
}

#[async_trait]
impl ReplySink for BufferedReplySink {
    async fn send(&self, text: &str) -> Result<MessageId, ReplyError> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|e| ReplyError::Delivery(e.to_string()))?;
        messages.push(text.to_string());
        Ok(MessageId(messages.len() as u64))
    }

    async fn edit(&self, message: MessageId, text: &str) -> Result<(), ReplyError> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|e| ReplyError::Delivery(e.to_string()))?;
        let slot = (message.0 as usize)
            .checked_sub(1)
            .and_then(|index| messages.get_mut(index))
            .ok_or(ReplyError::UnknownMessage(message))?;
        *slot = text.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_send_and_edit() {
        let sink = BufferedReplySink::new();
        let first = sink.send("Merging 3 videos…").await.unwrap();
        let second = sink.send("other").await.unwrap();

        sink.edit(first, "Merged 3 videos").await.unwrap();

        assert_eq!(sink.messages(), vec!["Merged 3 videos", "other"]);
        assert_ne!(first, second);
        assert!(matches!(
            sink.edit(MessageId(9), "x").await,
            Err(ReplyError::UnknownMessage(MessageId(9)))
        ));
    }

    #[tokio::test]
    async fn test_log_sink_hands_out_distinct_ids() {
        let sink = LogReplySink::new(7);
        let a = sink.send("a").await.unwrap();
        let b = sink.send("b").await.unwrap();
        assert_ne!(a, b);
        sink.edit(a, "a2").await.unwrap();
    }
}
