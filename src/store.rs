use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::model::{EscalationRecord, MessageDraft, Role, Source, ThreadRecord};

/// Escalation snippets are bounded so the review queue stays scannable.
const SNIPPET_MAX_CHARS: usize = 500;

/// A stored message considered for inclusion as retrieval context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub message_id: i64,
    pub thread_id: String,
    pub turn_index: i64,
    pub role: Role,
    pub stage: String,
    pub text: String,
    pub clean_text: String,
    pub source: Source,
    /// Vector similarity for vector-search hits; 0.0 for recency fallbacks.
    pub similarity: f64,
}

impl Candidate {
    pub fn best_text(&self) -> &str {
        if self.clean_text.trim().is_empty() {
            &self.text
        } else {
            &self.clean_text
        }
    }
}

/// Typed access to the three conversation collections: messages, threads,
/// escalations. One handle is constructed at startup and injected wherever
/// storage is needed; the connection lives for the whole process.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }

    /// Create or open the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                clean_text TEXT NOT NULL,
                timestamp TEXT,
                stage TEXT NOT NULL,
                entities TEXT NOT NULL DEFAULT '{}',
                embedding TEXT,
                embedding_model TEXT,
                embedding_version TEXT,
                source TEXT NOT NULL,
                pii_hashes TEXT NOT NULL DEFAULT '{}',
                UNIQUE(thread_id, turn_index)
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_stage_ts
             ON messages(stage, timestamp DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_role ON messages(role)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                first_ts TEXT,
                last_ts TEXT,
                summary TEXT NOT NULL DEFAULT ''
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS escalations (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                escalation_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                lead_message_snippet TEXT NOT NULL,
                ai_response_snippet TEXT NOT NULL,
                stage TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution_notes TEXT,
                resolved_at TEXT,
                resolved_by TEXT
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escalations_thread_ts
             ON escalations(thread_id, timestamp DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escalations_type
             ON escalations(escalation_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escalations_resolved_ts
             ON escalations(resolved, timestamp DESC)",
            [],
        )?;

        Ok(())
    }

    /// Append a message to its thread, reserving the next `turn_index`
    /// transactionally. The reserve and the insert happen inside one
    /// transaction on the single serialized connection, so concurrent turns
    /// on the same thread can never collide on an index. The thread
    /// aggregate is upserted in the same transaction.
    pub fn insert_message(&self, draft: &MessageDraft) -> Result<(i64, i64)> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let turn_index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(turn_index) + 1, 0) FROM messages WHERE thread_id = ?1",
            [&draft.thread_id],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"INSERT INTO messages
               (thread_id, turn_index, role, text, clean_text, timestamp, stage,
                entities, embedding, embedding_model, embedding_version, source, pii_hashes)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL, ?9, ?10)"#,
            params![
                draft.thread_id,
                turn_index,
                draft.role.as_str(),
                draft.text,
                draft.clean_text,
                now,
                draft.stage,
                draft.entities.to_string(),
                draft.source.as_str(),
                draft.pii_hashes.to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            r#"INSERT INTO threads (thread_id, stage, message_count, first_ts, last_ts, summary)
               VALUES (?1, ?2, 1, ?3, ?3, '')
               ON CONFLICT(thread_id) DO UPDATE SET
                   stage = excluded.stage,
                   message_count = threads.message_count + 1,
                   last_ts = excluded.last_ts"#,
            params![draft.thread_id, draft.stage, now],
        )?;

        tx.commit()?;
        Ok((id, turn_index))
    }

    /// Thread summary is advisory; last write wins.
    pub fn update_thread_summary(&self, thread_id: &str, summary: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE threads SET summary = ?2 WHERE thread_id = ?1",
            params![thread_id, summary],
        )?;
        Ok(())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT thread_id, stage, message_count, first_ts, last_ts, summary
             FROM threads WHERE thread_id = ?1",
            [thread_id],
            |row| {
                Ok(ThreadRecord {
                    thread_id: row.get(0)?,
                    stage: row.get(1)?,
                    message_count: row.get(2)?,
                    first_ts: parse_optional_ts(row.get::<_, Option<String>>(3)?, 3)?,
                    last_ts: parse_optional_ts(row.get::<_, Option<String>>(4)?, 4)?,
                    summary: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to load thread record")
    }

    /// Write back an embedding after generation. Best-effort callers swallow
    /// the error; the message row stays valid without a vector.
    pub fn update_message_embedding(
        &self,
        message_id: i64,
        embedding: &[f32],
        model: &str,
        version: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let encoded = serde_json::to_string(embedding)?;
        conn.execute(
            "UPDATE messages
             SET embedding = ?2, embedding_model = ?3, embedding_version = ?4
             WHERE id = ?1",
            params![message_id, encoded, model, version],
        )?;
        Ok(())
    }

    /// Ordered chat history for a thread, mapped to transport roles.
    pub fn thread_history(&self, thread_id: &str, limit: usize) -> Result<Vec<(Role, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, clean_text, text FROM messages
             WHERE thread_id = ?1
             ORDER BY turn_index ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![thread_id, limit as i64], |row| {
                let role: String = row.get(0)?;
                let clean: String = row.get(1)?;
                let raw: String = row.get(2)?;
                Ok((role, if clean.trim().is_empty() { raw } else { clean }))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(role, content)| {
                let role = Role::parse(&role)?;
                if content.trim().is_empty() {
                    None
                } else {
                    Some((role, content))
                }
            })
            .collect())
    }

    /// Most-recent messages within a thread, newest first. Recency fallback
    /// for the retrieval engine when vectors are unavailable.
    pub fn recent_in_thread(
        &self,
        thread_id: &str,
        limit: usize,
        agent_only: bool,
    ) -> Result<Vec<Candidate>> {
        let conn = self.lock_conn()?;
        let sql = if agent_only {
            "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source
             FROM messages
             WHERE thread_id = ?1 AND role = 'agent'
             ORDER BY turn_index DESC
             LIMIT ?2"
        } else {
            "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source
             FROM messages
             WHERE thread_id = ?1
             ORDER BY turn_index DESC
             LIMIT ?2"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![thread_id, limit as i64], candidate_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Most-recent messages across all threads, newest first.
    pub fn recent_global(&self, limit: usize, agent_only: bool) -> Result<Vec<Candidate>> {
        let conn = self.lock_conn()?;
        let sql = if agent_only {
            "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source
             FROM messages
             WHERE role = 'agent' AND clean_text != ''
             ORDER BY timestamp DESC
             LIMIT ?1"
        } else {
            "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source
             FROM messages
             WHERE clean_text != ''
             ORDER BY timestamp DESC
             LIMIT ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit as i64], candidate_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Top-N nearest neighbours over the `embedding` column by cosine
    /// similarity, optionally filtered to one thread. Rows without a vector
    /// are skipped.
    pub fn vector_search(
        &self,
        query: &[f32],
        thread_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock_conn()?;
        let mut scored: Vec<Candidate> = Vec::new();

        let mut scan = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> Result<()> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(args, |row| {
                    let embedding: String = row.get(8)?;
                    Ok((candidate_from_row(row)?, embedding))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (candidate, encoded) in rows {
                let Some(mut candidate) = candidate else {
                    continue;
                };
                let Ok(vector) = serde_json::from_str::<Vec<f32>>(&encoded) else {
                    continue;
                };
                candidate.similarity = cosine_similarity(query, &vector);
                scored.push(candidate);
            }
            Ok(())
        };

        match thread_id {
            Some(tid) => scan(
                "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source, embedding
                 FROM messages
                 WHERE embedding IS NOT NULL AND thread_id = ?1",
                &[&tid],
            )?,
            None => scan(
                "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source, embedding
                 FROM messages
                 WHERE embedding IS NOT NULL",
                &[],
            )?,
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// The nearest lead message preceding `turn_index` in the same thread.
    /// Used to assemble lead→agent dialogue pairs.
    pub fn preceding_lead_message(
        &self,
        thread_id: &str,
        turn_index: i64,
    ) -> Result<Option<Candidate>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, thread_id, turn_index, role, stage, text, clean_text, source
                 FROM messages
                 WHERE thread_id = ?1 AND turn_index < ?2 AND role = 'lead'
                 ORDER BY turn_index DESC
                 LIMIT 1",
                params![thread_id, turn_index],
                candidate_from_row,
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// Record a flagged turn for the human review queue.
    pub fn insert_escalation(
        &self,
        thread_id: &str,
        escalation_type: &str,
        reason: &str,
        lead_message: &str,
        ai_response: &str,
        stage: &str,
    ) -> Result<String> {
        let conn = self.lock_conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            r#"INSERT INTO escalations
               (id, thread_id, escalation_type, reason, lead_message_snippet,
                ai_response_snippet, stage, timestamp, resolved)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)"#,
            params![
                id,
                thread_id,
                escalation_type,
                if reason.is_empty() {
                    "No reason provided"
                } else {
                    reason
                },
                truncate_chars(lead_message, SNIPPET_MAX_CHARS),
                truncate_chars(ai_response, SNIPPET_MAX_CHARS),
                stage,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Mark an escalation handled. Driven by the resolution workflow, not by
    /// the turn pipeline.
    pub fn resolve_escalation(
        &self,
        escalation_id: &str,
        notes: &str,
        resolved_by: &str,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE escalations
             SET resolved = 1, resolution_notes = ?2, resolved_at = ?3, resolved_by = ?4
             WHERE id = ?1",
            params![escalation_id, notes, Utc::now().to_rfc3339(), resolved_by],
        )?;
        Ok(changed > 0)
    }

    pub fn unresolved_escalations(&self, limit: usize) -> Result<Vec<EscalationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, escalation_type, reason, lead_message_snippet,
                    ai_response_snippet, stage, timestamp, resolved,
                    resolution_notes, resolved_at, resolved_by
             FROM escalations
             WHERE resolved = 0
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EscalationRecord {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    escalation_type: row.get(2)?,
                    reason: row.get(3)?,
                    lead_message_snippet: row.get(4)?,
                    ai_response_snippet: row.get(5)?,
                    stage: row.get(6)?,
                    timestamp: parse_rfc3339(row.get::<_, String>(7)?, 7)?,
                    resolved: row.get::<_, i64>(8)? != 0,
                    resolution_notes: row.get(9)?,
                    resolved_at: parse_optional_ts(row.get::<_, Option<String>>(10)?, 10)?,
                    resolved_by: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn candidate_from_row(row: &Row<'_>) -> std::result::Result<Option<Candidate>, rusqlite::Error> {
    let role: String = row.get(3)?;
    let Some(role) = Role::parse(&role) else {
        return Ok(None);
    };
    let source: String = row.get(7)?;
    Ok(Some(Candidate {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        turn_index: row.get(2)?,
        role,
        stage: row.get(4)?,
        text: row.get(5)?,
        clean_text: row.get(6)?,
        source: Source::parse(&source),
        similarity: 0.0,
    }))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn parse_rfc3339(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_optional_ts(
    value: Option<String>,
    column: usize,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    match value {
        Some(raw) => parse_rfc3339(raw, column).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use std::sync::Arc;

    fn draft(thread: &str, role: Role, text: &str) -> MessageDraft {
        MessageDraft::new(thread, role, text, Stage::Qualifying, Source::Generated)
    }

    #[test]
    fn turn_index_is_dense_and_unique_per_thread() {
        let store = ConversationStore::in_memory().unwrap();

        for i in 0..5 {
            let (_, idx) = store
                .insert_message(&draft("t1", Role::Lead, &format!("msg {i}")))
                .unwrap();
            assert_eq!(idx, i);
        }
        let (_, other) = store.insert_message(&draft("t2", Role::Lead, "hi")).unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn interleaved_writers_never_collide_on_turn_index() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store
                            .insert_message(&draft("shared", Role::Lead, &format!("w{w} m{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let candidates = store.recent_in_thread("shared", 100, false).unwrap();
        let mut indexes: Vec<i64> = candidates.iter().map(|c| c.turn_index).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, (0..40).collect::<Vec<i64>>());
    }

    #[test]
    fn thread_upsert_tracks_count_and_stage() {
        let store = ConversationStore::in_memory().unwrap();
        store.insert_message(&draft("t1", Role::Lead, "hello")).unwrap();
        let mut second = draft("t1", Role::Agent, "hi there");
        second.stage = Stage::Working.as_str().to_string();
        store.insert_message(&second).unwrap();

        let thread = store.get_thread("t1").unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.stage, "working");
        assert!(thread.first_ts.is_some());
        assert!(thread.last_ts.is_some());
    }

    #[test]
    fn thread_summary_is_last_write_wins() {
        let store = ConversationStore::in_memory().unwrap();
        store.insert_message(&draft("t1", Role::Lead, "hello")).unwrap();
        store.update_thread_summary("t1", "first pass").unwrap();
        store.update_thread_summary("t1", "second pass").unwrap();
        let thread = store.get_thread("t1").unwrap().unwrap();
        assert_eq!(thread.summary, "second pass");
    }

    #[test]
    fn vector_search_orders_by_cosine_and_respects_thread_filter() {
        let store = ConversationStore::in_memory().unwrap();
        let (a, _) = store.insert_message(&draft("t1", Role::Agent, "near")).unwrap();
        let (b, _) = store.insert_message(&draft("t1", Role::Agent, "far")).unwrap();
        let (c, _) = store.insert_message(&draft("t2", Role::Agent, "other")).unwrap();

        store
            .update_message_embedding(a, &[1.0, 0.0, 0.0], "m", "v1")
            .unwrap();
        store
            .update_message_embedding(b, &[0.0, 1.0, 0.0], "m", "v1")
            .unwrap();
        store
            .update_message_embedding(c, &[0.9, 0.1, 0.0], "m", "v1")
            .unwrap();

        let hits = store.vector_search(&[1.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(hits[0].message_id, a);
        assert!(hits[0].similarity > hits[1].similarity);

        let scoped = store.vector_search(&[1.0, 0.0, 0.0], Some("t1"), 10).unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|c| c.thread_id == "t1"));
    }

    #[test]
    fn preceding_lead_message_finds_nearest_earlier_lead_turn() {
        let store = ConversationStore::in_memory().unwrap();
        store.insert_message(&draft("t1", Role::Lead, "first ask")).unwrap();
        store.insert_message(&draft("t1", Role::Agent, "reply one")).unwrap();
        store.insert_message(&draft("t1", Role::Lead, "second ask")).unwrap();
        store.insert_message(&draft("t1", Role::Agent, "reply two")).unwrap();

        let pair = store.preceding_lead_message("t1", 3).unwrap().unwrap();
        assert_eq!(pair.text, "second ask");
        assert!(store.preceding_lead_message("t1", 0).unwrap().is_none());
    }

    #[test]
    fn escalation_round_trip_and_resolution() {
        let store = ConversationStore::in_memory().unwrap();
        let long_message = "x".repeat(900);
        let id = store
            .insert_escalation("t1", "escalate_links", "", &long_message, "", "working")
            .unwrap();

        let open = store.unresolved_escalations(10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reason, "No reason provided");
        assert_eq!(open[0].lead_message_snippet.chars().count(), 500);

        assert!(store.resolve_escalation(&id, "handled", "system_agent").unwrap());
        assert!(store.unresolved_escalations(10).unwrap().is_empty());
        assert!(!store.resolve_escalation("missing", "", "nobody").unwrap());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.db");

        {
            let store = ConversationStore::new(&path).unwrap();
            store.insert_message(&draft("t1", Role::Lead, "hello")).unwrap();
        }

        let reopened = ConversationStore::new(&path).unwrap();
        let history = reopened.thread_history("t1", 10).unwrap();
        assert_eq!(history.len(), 1);
        let (_, idx) = reopened.insert_message(&draft("t1", Role::Agent, "hi")).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn thread_history_maps_roles_and_skips_empty_content() {
        let store = ConversationStore::in_memory().unwrap();
        store.insert_message(&draft("t1", Role::Lead, "hello")).unwrap();
        store.insert_message(&draft("t1", Role::Agent, "hi")).unwrap();
        store.insert_message(&draft("t1", Role::System, "note")).unwrap();
        store.insert_message(&draft("t1", Role::Lead, "   ")).unwrap();

        let history = store.thread_history("t1", 40).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].0, Role::Lead);
        assert_eq!(history[1].0, Role::Agent);
        assert_eq!(history[2].0, Role::System);
    }
}
