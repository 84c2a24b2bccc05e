//! # Transcript Store
//!
//! When a stream stops (or its connection drops) the conversation is written
//! out as pretty-printed JSON, one file per stream:
//!
//! ```text
//! <directory>/<peer or "unknown">/<YYYYMMDDTHHMMSS>-<streamSid>.json
//! ```
//!
//! Only text is kept. Audio never outlives the session.

use super::{ChatTurn, Speaker};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One line of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl TranscriptTurn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn as_chat_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.speaker,
            content: self.text.clone(),
        }
    }
}

/// Everything kept about one finished stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub stream_id: String,
    pub call_sid: Option<String>,
    pub peer: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub turns: Vec<TranscriptTurn>,
}

/// Writes transcript records under one directory.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    directory: PathBuf,
}

impl TranscriptStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Where a record will be written.
    pub fn path_for(&self, record: &TranscriptRecord) -> PathBuf {
        let peer = record
            .peer
            .as_deref()
            .map(sanitize_component)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let file = format!(
            "{}-{}.json",
            record.started_at.format("%Y%m%dT%H%M%S"),
            sanitize_component(&record.stream_id)
        );
        self.directory.join(peer).join(file)
    }

    /// Persist a record, creating directories as needed.
    pub async fn save(&self, record: &TranscriptRecord) -> Result<PathBuf> {
        let path = self.path_for(record);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create transcript directory {}", parent.display()))?;
        }

        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write transcript {}", path.display()))?;

        tracing::info!(
            stream_id = %record.stream_id,
            turns = record.turns.len(),
            path = %path.display(),
            "Transcript saved"
        );
        Ok(path)
    }
}

/// Keep a path component to characters that are safe on every filesystem.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer: Option<&str>) -> TranscriptRecord {
        let now = Utc::now();
        TranscriptRecord {
            stream_id: "MZ/../42".to_string(),
            call_sid: Some("CA1".to_string()),
            peer: peer.map(str::to_string),
            started_at: now,
            ended_at: now,
            turns: vec![
                TranscriptTurn::new(Speaker::User, "hello"),
                TranscriptTurn::new(Speaker::Assistant, "hi there"),
            ],
        }
    }

    #[test]
    fn test_path_is_sanitized_and_keyed_by_peer() {
        let store = TranscriptStore::new("/tmp/transcripts");
        let path = store.path_for(&record(Some("+15550102000")));
        assert!(path.starts_with("/tmp/transcripts/+15550102000"));
        assert!(path.to_string_lossy().ends_with("-MZ42.json"));

        let anonymous = store.path_for(&record(None));
        assert!(anonymous.starts_with("/tmp/transcripts/unknown"));
    }

    #[actix_web::test]
    async fn test_save_writes_pretty_json() {
        let directory = std::env::temp_dir().join(format!("transcripts-{}", uuid::Uuid::new_v4()));
        let store = TranscriptStore::new(&directory);
        let original = record(Some("+15550102000"));

        let path = store.save(&original).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains('\n'));

        let loaded: TranscriptRecord = serde_json::from_str(&contents).unwrap();
        assert_eq!(loaded, original);

        let _ = tokio::fs::remove_dir_all(&directory).await;
    }

    #[test]
    fn test_turn_converts_to_chat_history() {
        let turn = TranscriptTurn::new(Speaker::Assistant, "sure");
        assert_eq!(
            turn.as_chat_turn(),
            ChatTurn {
                role: Speaker::Assistant,
                content: "sure".to_string()
            }
        );
    }
}
