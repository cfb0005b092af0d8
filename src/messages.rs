//! Append/page/tail façade over the per-session message log.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::events::{EventPublisher, SyncEvent};
use crate::session::payload::{extract_usage, Usage};
use crate::storage::{MessageRow, Storage};

/// Hard cap on a single page; larger requests are clamped, not rejected.
pub const MAX_PAGE_LIMIT: i64 = 200;
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub content: Value,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl MessageView {
    pub fn from_row(row: MessageRow) -> Self {
        let content: Value = serde_json::from_str(&row.content).unwrap_or(Value::Null);
        let usage = extract_usage(&content);
        Self {
            id: row.id,
            seq: row.seq,
            local_id: row.local_id,
            content,
            created_at: row.created_at,
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before_seq: Option<i64>,
    pub has_more: bool,
}

pub struct MessageLog {
    storage: Arc<Storage>,
    publisher: EventPublisher,
}

impl MessageLog {
    pub fn new(storage: Arc<Storage>, publisher: EventPublisher) -> Self {
        Self { storage, publisher }
    }

    /// Append a message and fan out `message-received` on a fresh insert.
    ///
    /// A repeat append with a known `local_id` returns the stored row and
    /// emits nothing. The `bool` is `true` only for a fresh insert.
    pub async fn append(
        &self,
        namespace: &str,
        session_id: &str,
        content: &Value,
        local_id: Option<&str>,
    ) -> Result<(MessageView, bool)> {
        let (row, created) = self
            .storage
            .add_message(namespace, session_id, content, local_id)
            .await?;
        let view = MessageView::from_row(row);
        if created {
            self.publisher.emit(SyncEvent::MessageReceived {
                namespace: namespace.to_string(),
                session_id: session_id.to_string(),
                message: view.clone(),
            });
        }
        Ok((view, created))
    }

    /// Page backwards from `before_seq` (or the tail), oldest-to-newest.
    pub async fn page(
        &self,
        session_id: &str,
        before_seq: Option<i64>,
        limit: Option<i64>,
    ) -> Result<MessagePage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(0, MAX_PAGE_LIMIT);
        let rows = self.storage.get_messages(session_id, limit, before_seq).await?;
        let messages: Vec<MessageView> = rows.into_iter().map(MessageView::from_row).collect();
        let oldest = messages.first().map(|m| m.seq);
        let has_more = matches!(oldest, Some(seq) if seq > 1);
        Ok(MessagePage {
            messages,
            limit,
            before_seq,
            next_before_seq: if has_more { oldest } else { None },
            has_more,
        })
    }

    /// Catch-up tail: messages with `seq > after_seq`, oldest-to-newest.
    pub async fn tail(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: Option<i64>,
    ) -> Result<Vec<MessageView>> {
        let limit = limit.unwrap_or(MAX_PAGE_LIMIT).clamp(0, MAX_PAGE_LIMIT);
        let rows = self
            .storage
            .get_messages_after(session_id, after_seq, limit)
            .await?;
        Ok(rows.into_iter().map(MessageView::from_row).collect())
    }
}
