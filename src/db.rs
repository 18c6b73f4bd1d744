//! SQLite-based call store.
//!
//! Holds the call rows created before a media stream connects, the single
//! termination update, call events, text messages, and the knowledge-base
//! documents the query tool reads through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::knowledge::{Document, DocumentSource};
use crate::types::{CallRecord, TerminationCause};

/// SQLite-backed store shared by the server and the per-call tasks.
pub struct CallStore {
    conn: Arc<Mutex<Connection>>,
}

impl CallStore {
    /// Open (or create) the store at the given path.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open call store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                call_sid TEXT,
                direction TEXT NOT NULL,
                from_number TEXT NOT NULL,
                to_number TEXT NOT NULL,
                input_data TEXT NOT NULL DEFAULT '{}',
                system_prompt TEXT NOT NULL,
                audio_format TEXT NOT NULL,
                tool_configuration TEXT NOT NULL DEFAULT '{}',
                log_path TEXT,
                end_reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS call_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_seconds INTEGER,
                sequence_number INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (call_id) REFERENCES calls(id)
            );

            CREATE TABLE IF NOT EXISTS text_messages (
                id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                from_number TEXT NOT NULL,
                to_number TEXT NOT NULL,
                body TEXT NOT NULL,
                direction TEXT NOT NULL DEFAULT 'outbound',
                provider_sid TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (call_id) REFERENCES calls(id)
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                knowledge_base_id TEXT NOT NULL,
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_call_events_call ON call_events(call_id);
            CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(knowledge_base_id);
            "#,
        )?;
        Ok(())
    }

    pub async fn insert_call(&self, record: &CallRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO calls
               (id, call_sid, direction, from_number, to_number, input_data,
                system_prompt, audio_format, tool_configuration, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                record.id.to_string(),
                record.call_sid,
                enum_str(&record.direction)?,
                record.from_number,
                record.to_number,
                record.input_data.to_string(),
                record.system_prompt,
                enum_str(&record.audio_format)?,
                serde_json::to_string(&record.tool_configuration)?,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert call")?;
        Ok(())
    }

    pub async fn get_call(&self, call_id: Uuid) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"SELECT id, call_sid, direction, from_number, to_number, input_data,
                          system_prompt, audio_format, tool_configuration, log_path,
                          end_reason, created_at
                   FROM calls WHERE id = ?1"#,
                params![call_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, String>(11)?,
                    ))
                },
            )
            .optional()
            .context("Failed to load call")?;

        let Some((
            id,
            call_sid,
            direction,
            from_number,
            to_number,
            input_data,
            system_prompt,
            audio_format,
            tool_configuration,
            log_path,
            end_reason,
            created_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(CallRecord {
            id: id.parse()?,
            call_sid,
            direction: enum_parse(&direction)?,
            from_number,
            to_number,
            input_data: serde_json::from_str(&input_data)?,
            system_prompt,
            audio_format: enum_parse(&audio_format)?,
            tool_configuration: serde_json::from_str(&tool_configuration)?,
            log_path,
            end_reason: end_reason.as_deref().map(enum_parse).transpose()?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        }))
    }

    /// The one-shot termination update: storage path and end reason.
    pub async fn record_call_end(
        &self,
        call_id: Uuid,
        log_path: Option<&str>,
        cause: TerminationCause,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE calls SET log_path = ?2, end_reason = ?3 WHERE id = ?1",
            params![call_id.to_string(), log_path, cause.as_str()],
        )
        .context("Failed to record call end")?;
        Ok(())
    }

    pub async fn insert_call_event(
        &self,
        call_id: Uuid,
        status: &str,
        duration_seconds: Option<u64>,
        sequence_number: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO call_events (call_id, status, duration_seconds, sequence_number, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                call_id.to_string(),
                status,
                duration_seconds.map(|d| d as i64),
                sequence_number,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert call event")?;
        Ok(())
    }

    pub async fn insert_text_message(
        &self,
        id: Uuid,
        call_id: Uuid,
        from_number: &str,
        to_number: &str,
        body: &str,
        provider_sid: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO text_messages (id, call_id, from_number, to_number, body, provider_sid, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                id.to_string(),
                call_id.to_string(),
                from_number,
                to_number,
                body,
                provider_sid,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert text message")?;
        Ok(())
    }

    pub async fn insert_document(
        &self,
        knowledge_base_id: Uuid,
        name: &str,
        text: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO documents (id, knowledge_base_id, name, text, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                Uuid::new_v4().to_string(),
                knowledge_base_id.to_string(),
                name,
                text,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert document")?;
        Ok(())
    }

    #[cfg(test)]
    async fn call_event_count(&self, call_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM call_events WHERE call_id = ?1",
            params![call_id.to_string()],
            |row| row.get(0),
        )?)
    }
}

#[async_trait]
impl DocumentSource for CallStore {
    async fn documents(&self, knowledge_base_ids: &[Uuid]) -> Result<Vec<Document>> {
        if knowledge_base_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; knowledge_base_ids.len()].join(",");
        let sql = format!(
            "SELECT name, text FROM documents WHERE knowledge_base_id IN ({placeholders}) ORDER BY name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = knowledge_base_ids.iter().map(Uuid::to_string).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(Document {
                name: row.get(0)?,
                text: row.get(1)?,
            })
        })?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }
}

/// Serialize a serde enum to its bare wire string.
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => anyhow::bail!("expected string-serializable enum, got {other}"),
    }
}

/// Parse a bare wire string back into a serde enum.
fn enum_parse<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        value.to_string(),
    ))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, CallDirection, ToolConfiguration};
    use serde_json::json;

    fn record(direction: CallDirection) -> CallRecord {
        CallRecord {
            id: Uuid::new_v4(),
            call_sid: Some("CA123".to_string()),
            direction,
            from_number: "+15550100".to_string(),
            to_number: "+15550101".to_string(),
            input_data: json!({"name": "Ada"}),
            system_prompt: "Talk to {user_info}".to_string(),
            audio_format: AudioFormat::G711Ulaw,
            tool_configuration: ToolConfiguration::default(),
            log_path: None,
            end_reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let store = CallStore::in_memory().await.unwrap();
        let rec = record(CallDirection::Outbound);
        store.insert_call(&rec).await.unwrap();

        let loaded = store.get_call(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.direction, CallDirection::Outbound);
        assert_eq!(loaded.audio_format, AudioFormat::G711Ulaw);
        assert_eq!(loaded.input_data["name"], "Ada");
        assert!(loaded.end_reason.is_none());

        assert!(store.get_call(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_call_end() {
        let store = CallStore::in_memory().await.unwrap();
        let rec = record(CallDirection::Inbound);
        store.insert_call(&rec).await.unwrap();

        store
            .record_call_end(
                rec.id,
                Some("logs/abc.zip"),
                TerminationCause::EndOfCallBot,
            )
            .await
            .unwrap();

        let loaded = store.get_call(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.log_path.as_deref(), Some("logs/abc.zip"));
        assert_eq!(loaded.end_reason, Some(TerminationCause::EndOfCallBot));
    }

    #[tokio::test]
    async fn test_call_events_and_messages() {
        let store = CallStore::in_memory().await.unwrap();
        let rec = record(CallDirection::Browser);
        store.insert_call(&rec).await.unwrap();

        store
            .insert_call_event(rec.id, "completed", Some(42), 1)
            .await
            .unwrap();
        assert_eq!(store.call_event_count(rec.id).await.unwrap(), 1);

        store
            .insert_text_message(
                Uuid::new_v4(),
                rec.id,
                "browser",
                "browser",
                "hello",
                "no-sid",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_document_source() {
        let store = CallStore::in_memory().await.unwrap();
        let kb_a = Uuid::new_v4();
        let kb_b = Uuid::new_v4();
        store.insert_document(kb_a, "a", "alpha").await.unwrap();
        store.insert_document(kb_b, "b", "beta").await.unwrap();
        store.insert_document(Uuid::new_v4(), "c", "gamma").await.unwrap();

        let docs = store.documents(&[kb_a, kb_b]).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].name, "a");
        assert_eq!(docs[1].name, "b");

        assert!(store.documents(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.db");
        let store = CallStore::new(&path).await.unwrap();
        let rec = record(CallDirection::Outbound);
        store.insert_call(&rec).await.unwrap();
        drop(store);

        let reopened = CallStore::new(&path).await.unwrap();
        assert!(reopened.get_call(rec.id).await.unwrap().is_some());
    }
}
