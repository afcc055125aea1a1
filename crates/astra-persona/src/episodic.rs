// Episodic memory bridge: a bounded sliding window of recent episodes in an
// auxiliary SQLite file, retrieved by recency-weighted token overlap.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use astra_core::error::Result;
use astra_types::ChatTurn;

use crate::tone::ToneAnalysis;

fn tokens(value: &str) -> HashSet<String> {
    let lowered = value.trim().to_lowercase();
    let mut out = HashSet::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || matches!(ch, '_' | '+' | '-') {
            current.push(ch);
        } else if !current.is_empty() {
            if current.chars().count() >= 3 {
                out.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() >= 3 {
        out.insert(current);
    }
    out
}

fn history_to_query(history: &[ChatTurn], limit: usize) -> String {
    let lines: Vec<String> = history
        .iter()
        .rev()
        .take(12)
        .filter(|turn| turn.role == "user")
        .map(|turn| turn.content.trim().to_string())
        .filter(|content| !content.is_empty())
        .take(limit)
        .collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicBlock {
    pub label: String,
    pub value: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub created_at: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodicRecall {
    pub query: String,
    pub hit_count: usize,
    pub blocks: Vec<EpisodicBlock>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicUpdate {
    pub updated: bool,
    pub digest: String,
    pub summary: String,
    pub tags: Vec<String>,
}

pub struct EpisodicStore {
    conn: Arc<Mutex<Connection>>,
    max_episodes: u32,
    db_path: PathBuf,
}

impl EpisodicStore {
    pub fn open(db_path: &Path, max_episodes: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodic_blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                digest TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                value TEXT NOT NULL,
                summary TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                meta_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_episodic_created_at
            ON episodic_blocks(created_at DESC);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_episodes: max_episodes.max(10),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn retrieve(
        &self,
        history: &[ChatTurn],
        query: Option<&str>,
        limit: usize,
    ) -> Result<EpisodicRecall> {
        let query_text = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| history_to_query(history, 5));
        let query_tokens = tokens(&query_text);

        let rows: Vec<(String, String, String, String, String, String)> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT label, value, summary, tags_json, meta_json, created_at
                 FROM episodic_blocks ORDER BY id DESC LIMIT 200",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let total = rows.len().max(1);
        let mut scored: Vec<(f64, usize)> = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            let hay_tokens = tokens(&format!("{} {}", row.2, row.1));
            let overlap = if query_tokens.is_empty() {
                0
            } else {
                query_tokens.intersection(&hay_tokens).count()
            };
            let recency = 1.0 - index as f64 / total as f64;
            let score = overlap as f64 + recency * 0.35;
            if !query_tokens.is_empty() && overlap == 0 {
                continue;
            }
            scored.push((score, index));
        }
        if query_tokens.is_empty() {
            scored = rows.iter().enumerate().map(|(index, _)| (1.0, index)).collect();
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit.max(1));

        let mut blocks = Vec::new();
        for (score, index) in scored {
            let row = &rows[index];
            blocks.push(EpisodicBlock {
                label: row.0.clone(),
                value: row.1.clone(),
                summary: row.2.clone(),
                tags: serde_json::from_str(&row.3).unwrap_or_default(),
                metadata: serde_json::from_str(&row.4).unwrap_or(Value::Null),
                created_at: row.5.clone(),
                score: (score * 10000.0).round() / 10000.0,
            });
        }

        let summary: String = blocks
            .iter()
            .filter(|block| !block.summary.is_empty())
            .map(|block| format!("- {}", block.summary))
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(1800)
            .collect();

        Ok(EpisodicRecall {
            query: query_text,
            hit_count: blocks.len(),
            blocks,
            summary,
        })
    }

    pub async fn update(
        &self,
        user_message: &str,
        history: &[ChatTurn],
        tone_analysis: Option<&ToneAnalysis>,
        assistant_message: Option<&str>,
    ) -> Result<EpisodicUpdate> {
        let text = user_message.trim();
        if text.is_empty() {
            return Ok(EpisodicUpdate {
                updated: false,
                digest: String::new(),
                summary: String::new(),
                tags: vec![],
            });
        }

        let tail = history_to_query(history, 2);
        let compact_assistant = assistant_message.unwrap_or("").trim();
        let blob: String = [text, compact_assistant, tail.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(2400)
            .collect();

        let summary: String = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(240)
            .collect();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(blob.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let mut tags = vec!["episodic".to_string()];
        let tone_type = tone_analysis.map(|analysis| analysis.tone_type.as_str().to_string());
        if let Some(tone) = &tone_type {
            tags.push(format!("tone:{}", tone));
        }

        let metadata = json!({
            "tone": tone_type,
            "task_complex": tone_analysis.map(|a| a.task_complex).unwrap_or(false),
        });

        let created_at = Utc::now().to_rfc3339();
        let created = {
            let conn = self.conn.lock().await;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO episodic_blocks (digest, label, value, summary, tags_json, meta_json, created_at)
                 VALUES (?1, 'episode', ?2, ?3, ?4, ?5, ?6)",
                params![
                    digest,
                    blob,
                    summary,
                    serde_json::to_string(&tags)?,
                    serde_json::to_string(&metadata)?,
                    created_at,
                ],
            )?;
            // Sliding window: keep only the newest max_episodes rows.
            conn.execute(
                "DELETE FROM episodic_blocks
                 WHERE id NOT IN (SELECT id FROM episodic_blocks ORDER BY id DESC LIMIT ?1)",
                params![self.max_episodes as i64],
            )?;
            inserted > 0
        };

        Ok(EpisodicUpdate {
            updated: created,
            digest,
            summary,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn update_then_retrieve_by_overlap() {
        let dir = tempdir().unwrap();
        let store = EpisodicStore::open(&dir.path().join("episodic.sqlite3"), 300).unwrap();

        let update = store
            .update("обсуждали план тренировок на месяц", &[], None, None)
            .await
            .unwrap();
        assert!(update.updated);

        let recall = store
            .retrieve(&[], Some("какой план тренировок"), 3)
            .await
            .unwrap();
        assert_eq!(recall.hit_count, 1);
        assert!(recall.summary.contains("тренировок"));

        let miss = store.retrieve(&[], Some("погода в париже"), 3).await.unwrap();
        assert_eq!(miss.hit_count, 0);
    }

    #[tokio::test]
    async fn duplicate_episode_is_ignored() {
        let dir = tempdir().unwrap();
        let store = EpisodicStore::open(&dir.path().join("episodic.sqlite3"), 300).unwrap();

        let first = store.update("одно и то же", &[], None, None).await.unwrap();
        assert!(first.updated);
        let second = store.update("одно и то же", &[], None, None).await.unwrap();
        assert!(!second.updated);
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let dir = tempdir().unwrap();
        let store = EpisodicStore::open(&dir.path().join("episodic.sqlite3"), 10).unwrap();
        for i in 0..25 {
            store
                .update(&format!("эпизод номер {}", i), &[], None, None)
                .await
                .unwrap();
        }
        let recall = store.retrieve(&[], None, 200).await.unwrap();
        assert!(recall.hit_count <= 10);
    }
}
