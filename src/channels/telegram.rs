//! Telegram long-poll channel.
//!
//! Polls `getUpdates` with a monotonically increasing cursor persisted in
//! AppState (`telegram_cursor`), so restarts never replay messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Channel, Incoming, Outgoing};
use crate::error::PithError;
use crate::store::Store;

/// AppState key holding the last-acknowledged update id + 1.
const CURSOR_KEY: &str = "telegram_cursor";
/// Long-poll wait in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramChannel {
    base_url: String,
    client: reqwest::Client,
    store: Arc<Store>,
    offset: i64,
    pending: VecDeque<Incoming>,
}

impl TelegramChannel {
    pub fn new(token: &str, store: Arc<Store>) -> Result<Self, PithError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()
            .map_err(|e| PithError::Channel(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: format!("https://api.telegram.org/bot{token}"),
            client,
            store,
            offset: 0,
            pending: VecDeque::new(),
        })
    }

    fn load_cursor(&self) -> i64 {
        self.store
            .get_app_state(CURSOR_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn save_cursor(&self) {
        let _ = self.store.set_app_state(CURSOR_KEY, &self.offset.to_string());
    }

    async fn poll_updates(&mut self) -> Result<(), PithError> {
        let resp = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", self.offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PithError::Channel(format!("getUpdates failed: {e}")))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| PithError::Channel(format!("getUpdates body: {e}")))?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(PithError::Channel(format!("telegram error: {body}")));
        }

        for update in body
            .get("result")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                self.offset = self.offset.max(update_id + 1);
            }
            let message = update.get("message").cloned().unwrap_or(Value::Null);
            let Some(text) = message.get("text").and_then(Value::as_str) else {
                continue;
            };
            let chat_id = message
                .pointer("/chat/id")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let sender = message
                .pointer("/from/username")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            self.pending.push_back(Incoming {
                conversation: chat_id.to_string(),
                sender,
                text: text.to_string(),
            });
        }
        // Advance the cursor once per poll so restarts never replay.
        self.save_cursor();
        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&mut self) -> Result<(), PithError> {
        self.offset = self.load_cursor();
        let resp = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .send()
            .await
            .map_err(|e| PithError::Channel(format!("getMe failed: {e}")))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| PithError::Channel(format!("getMe body: {e}")))?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(PithError::Channel(format!("telegram auth failed: {body}")));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Incoming, PithError> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            self.poll_updates().await?;
            if self.pending.is_empty() {
                // Empty long-poll round; pause briefly before the next.
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }

    async fn send(&mut self, out: Outgoing) -> Result<(), PithError> {
        let chat_id: i64 = out
            .conversation
            .parse()
            .map_err(|_| PithError::Channel(format!("bad chat id: {}", out.conversation)))?;
        self.client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": out.text }))
            .send()
            .await
            .map_err(|e| PithError::Channel(format!("sendMessage failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("memory.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn cursor_roundtrips_through_app_state() {
        let (_dir, store) = store();
        let mut ch = TelegramChannel::new("test-token", store.clone()).unwrap();
        assert_eq!(ch.load_cursor(), 0);

        ch.offset = 1234;
        ch.save_cursor();
        assert_eq!(
            store.get_app_state("telegram_cursor").unwrap().as_deref(),
            Some("1234")
        );

        let ch2 = TelegramChannel::new("test-token", store).unwrap();
        assert_eq!(ch2.load_cursor(), 1234);
    }

    #[tokio::test]
    async fn bad_chat_id_is_channel_error() {
        let (_dir, store) = store();
        let mut ch = TelegramChannel::new("t", store).unwrap();
        let err = ch
            .send(Outgoing {
                conversation: "not-a-number".into(),
                text: "hi".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PithError::Channel(_)));
    }
}
