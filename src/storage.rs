//! SQLite-backed exchange log and derived conversation views.
//!
//! Every request/response interaction with the gateway is recorded as an
//! [`Exchange`] row. Rows are append-only: nothing updates or deletes an
//! exchange except the bulk [`StorageService::delete_all`] exposed for the
//! monitoring UI. Conversations are never stored — they are recomputed on
//! read by grouping the exchange stream, so there is no second source of
//! truth to drift.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::canonical::{TokenUsage, WireFormat};
use crate::error::{GatewayError, Result};

/// One persisted request/response interaction. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub inbound_format: WireFormat,
    /// Empty when the request failed before a route decision.
    pub provider: String,
    pub requested_model: String,
    pub upstream_model: String,
    pub request_body: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub latency_ms: i64,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub correlation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
    Canceled,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Canceled => "canceled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "error" => Some(Outcome::Error),
            "canceled" => Some(Outcome::Canceled),
            _ => None,
        }
    }
}

/// A derived, read-only conversation: exchanges sharing a correlation key
/// with no idle gap larger than the configured window between them. Its id is
/// the id of its first exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub correlation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub exchanges: Vec<Exchange>,
}

impl Conversation {
    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        let mut models: Vec<String> = Vec::new();
        let mut usage = TokenUsage::default();
        for ex in &self.exchanges {
            if !models.contains(&ex.requested_model) {
                models.push(ex.requested_model.clone());
            }
            usage.input_tokens += ex.usage.input_tokens;
            usage.output_tokens += ex.usage.output_tokens;
        }
        ConversationSummary {
            id: self.id.clone(),
            correlation_key: self.correlation_key.clone(),
            project_id: self.project_id.clone(),
            exchange_count: self.exchanges.len(),
            models,
            usage,
            started_at: self.exchanges.first().map(|e| e.timestamp),
            last_activity: self.exchanges.last().map(|e| e.timestamp),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub correlation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub exchange_count: usize,
    pub models: Vec<String>,
    pub usage: TokenUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct StorageService {
    conn: Arc<Mutex<Connection>>,
    idle_gap: chrono::Duration,
}

impl StorageService {
    /// Open (or create) the store at `path`. Called at startup; a failure
    /// here is fatal to the process.
    pub async fn open(path: &Path, idle_gap: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!(dir = %parent.display(), "Created database directory");
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        tracing::info!(path = %path.display(), "Database initialized");
        Self::with_connection(conn, idle_gap)
    }

    /// An in-memory store, for tests.
    pub fn open_in_memory(idle_gap: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?, idle_gap)
    }

    fn with_connection(conn: Connection, idle_gap: Duration) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS exchanges (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                inbound_format TEXT NOT NULL,
                provider TEXT NOT NULL,
                requested_model TEXT NOT NULL,
                upstream_model TEXT NOT NULL,
                request_body TEXT NOT NULL,
                response_body TEXT,
                latency_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                correlation_key TEXT NOT NULL,
                project_id TEXT
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_exchanges_correlation
             ON exchanges (correlation_key, timestamp)",
            [],
        )
        .map_err(db_err)?;

        let idle_gap = chrono::Duration::from_std(idle_gap)
            .map_err(|e| GatewayError::storage(format!("idle gap out of range: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            idle_gap,
        })
    }

    /// Append one exchange. Writes from concurrent requests serialize on the
    /// connection lock.
    pub async fn record(&self, ex: &Exchange) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO exchanges (
                id, timestamp, inbound_format, provider, requested_model,
                upstream_model, request_body, response_body, latency_ms,
                outcome, error, input_tokens, output_tokens, correlation_key,
                project_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                ex.id,
                ex.timestamp.to_rfc3339(),
                ex.inbound_format.as_str(),
                ex.provider,
                ex.requested_model,
                ex.upstream_model,
                ex.request_body.to_string(),
                ex.response_body.as_ref().map(ToString::to_string),
                ex.latency_ms,
                ex.outcome.as_str(),
                ex.error,
                ex.usage.input_tokens,
                ex.usage.output_tokens,
                ex.correlation_key,
                ex.project_id,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Exchanges newest first.
    pub async fn list_exchanges(&self, limit: Option<usize>) -> Result<Vec<Exchange>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, inbound_format, provider, requested_model,
                        upstream_model, request_body, response_body, latency_ms,
                        outcome, error, input_tokens, output_tokens,
                        correlation_key, project_id
                 FROM exchanges ORDER BY timestamp DESC, id LIMIT ?1",
            )
            .map_err(db_err)?;

        let limit = limit.map_or(-1i64, |l| l as i64);
        let rows = stmt
            .query_map([limit], row_to_exchange)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Drop every recorded exchange, returning how many were deleted. The
    /// monitoring UI's "clear data" action.
    pub async fn delete_all(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM exchanges", []).map_err(db_err)
    }

    /// All conversations, most recently active first, optionally filtered by
    /// project id.
    pub async fn list_conversations(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<ConversationSummary>> {
        let exchanges = self.all_ascending(project).await?;
        let mut conversations = group_conversations(exchanges, self.idle_gap);
        conversations.sort_by(|a, b| {
            let a_last = a.exchanges.last().map(|e| e.timestamp);
            let b_last = b.exchanges.last().map(|e| e.timestamp);
            b_last.cmp(&a_last)
        });
        Ok(conversations.iter().map(Conversation::summary).collect())
    }

    /// One conversation by id (the id of its first exchange).
    pub async fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let exchanges = self.all_ascending(None).await?;
        Ok(group_conversations(exchanges, self.idle_gap)
            .into_iter()
            .find(|c| c.id == id))
    }

    async fn all_ascending(&self, project: Option<&str>) -> Result<Vec<Exchange>> {
        let conn = self.conn.lock().await;
        let base = "SELECT id, timestamp, inbound_format, provider, requested_model,
                           upstream_model, request_body, response_body, latency_ms,
                           outcome, error, input_tokens, output_tokens,
                           correlation_key, project_id
                    FROM exchanges";

        let rows = if let Some(project) = project {
            let mut stmt = conn
                .prepare(&format!(
                    "{base} WHERE project_id = ?1 ORDER BY timestamp, id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([project], row_to_exchange)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        } else {
            let mut stmt = conn
                .prepare(&format!("{base} ORDER BY timestamp, id"))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_exchange)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        };
        Ok(rows)
    }
}

/// Group timestamp-ascending exchanges into conversations. A new conversation
/// starts when no prior exchange with the same correlation key exists within
/// the idle-gap window; otherwise the exchange appends to the most recent
/// matching conversation.
fn group_conversations(exchanges: Vec<Exchange>, idle_gap: chrono::Duration) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = Vec::new();
    let mut open: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for ex in exchanges {
        let slot = open.get(&ex.correlation_key).copied().filter(|&i| {
            conversations[i]
                .exchanges
                .last()
                .map(|last| ex.timestamp - last.timestamp <= idle_gap)
                .unwrap_or(false)
        });

        match slot {
            Some(i) => {
                if conversations[i].project_id.is_none() {
                    conversations[i].project_id = ex.project_id.clone();
                }
                conversations[i].exchanges.push(ex);
            }
            None => {
                open.insert(ex.correlation_key.clone(), conversations.len());
                conversations.push(Conversation {
                    id: ex.id.clone(),
                    correlation_key: ex.correlation_key.clone(),
                    project_id: ex.project_id.clone(),
                    exchanges: vec![ex],
                });
            }
        }
    }

    conversations
}

fn row_to_exchange(row: &rusqlite::Row<'_>) -> rusqlite::Result<Exchange> {
    let timestamp: String = row.get(1)?;
    let inbound_format: String = row.get(2)?;
    let request_body: String = row.get(6)?;
    let response_body: Option<String> = row.get(7)?;
    let outcome: String = row.get(9)?;

    Ok(Exchange {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        inbound_format: WireFormat::parse(&inbound_format).unwrap_or(WireFormat::Anthropic),
        provider: row.get(3)?,
        requested_model: row.get(4)?,
        upstream_model: row.get(5)?,
        request_body: serde_json::from_str(&request_body).unwrap_or(serde_json::Value::Null),
        response_body: response_body
            .map(|b| serde_json::from_str(&b).unwrap_or(serde_json::Value::Null)),
        latency_ms: row.get(8)?,
        outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Error),
        error: row.get(10)?,
        usage: TokenUsage {
            input_tokens: row.get(11)?,
            output_tokens: row.get(12)?,
        },
        correlation_key: row.get(13)?,
        project_id: row.get(14)?,
    })
}

fn db_err(e: rusqlite::Error) -> GatewayError {
    GatewayError::storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StorageService {
        StorageService::open_in_memory(Duration::from_secs(600)).unwrap()
    }

    fn exchange(id: &str, key: &str, at: &str) -> Exchange {
        Exchange {
            id: id.to_string(),
            timestamp: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            inbound_format: WireFormat::Anthropic,
            provider: "anthropic".to_string(),
            requested_model: "claude-3-haiku".to_string(),
            upstream_model: "claude-3-haiku-20240307".to_string(),
            request_body: serde_json::json!({"model": "claude-3-haiku"}),
            response_body: Some(serde_json::json!({"type": "message"})),
            latency_ms: 120,
            outcome: Outcome::Success,
            error: None,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            correlation_key: key.to_string(),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        store
            .record(&exchange("e2", "session:a", "2025-06-01T10:01:00Z"))
            .await
            .unwrap();

        let all = store.list_exchanges(None).await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].id, "e2");
        assert_eq!(all[0].usage.input_tokens, 10);

        let limited = store.list_exchanges(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_empties_everything() {
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();

        let deleted = store.delete_all().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.list_exchanges(None).await.unwrap().is_empty());
        assert!(store.list_conversations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchanges_within_gap_share_a_conversation() {
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        store
            .record(&exchange("e2", "session:a", "2025-06-01T10:05:00Z"))
            .await
            .unwrap();

        let conversations = store.list_conversations(None).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].exchange_count, 2);
        assert_eq!(conversations[0].id, "e1");
        assert_eq!(conversations[0].usage.output_tokens, 10);
    }

    #[tokio::test]
    async fn test_idle_gap_starts_new_conversation() {
        // 600s window; the second exchange arrives 11 minutes later.
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        store
            .record(&exchange("e2", "session:a", "2025-06-01T10:11:00Z"))
            .await
            .unwrap();

        let conversations = store.list_conversations(None).await.unwrap();
        assert_eq!(conversations.len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_never_group() {
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        store
            .record(&exchange("e2", "session:b", "2025-06-01T10:00:30Z"))
            .await
            .unwrap();

        let conversations = store.list_conversations(None).await.unwrap();
        assert_eq!(conversations.len(), 2);
    }

    #[tokio::test]
    async fn test_conversation_lookup_by_id() {
        let store = store();
        store
            .record(&exchange("e1", "session:a", "2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        store
            .record(&exchange("e2", "session:a", "2025-06-01T10:01:00Z"))
            .await
            .unwrap();

        let conv = store.conversation("e1").await.unwrap().unwrap();
        assert_eq!(conv.exchanges.len(), 2);
        assert_eq!(conv.exchanges[0].id, "e1");

        assert!(store.conversation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_project_filter() {
        let store = store();
        let mut ex = exchange("e1", "session:a", "2025-06-01T10:00:00Z");
        ex.project_id = Some("proj-1".to_string());
        store.record(&ex).await.unwrap();
        store
            .record(&exchange("e2", "session:b", "2025-06-01T10:00:10Z"))
            .await
            .unwrap();

        let filtered = store.list_conversations(Some("proj-1")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project_id.as_deref(), Some("proj-1"));
    }

    #[tokio::test]
    async fn test_concurrent_records_all_land() {
        let store = store();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let ex = exchange(&format!("e{i}"), "session:a", "2025-06-01T10:00:00Z");
                store.record(&ex).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.list_exchanges(None).await.unwrap().len(), 16);
    }
}
