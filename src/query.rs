//! Read-side aggregation over the item store

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::store::{Answer, ItemStore, Question, now_timestamp};

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_questions: usize,
    pub total_answers: usize,
    pub questions_dir: String,
    pub answers_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub state: Value,
    pub stats: SessionStats,
}

/// Placeholder context served until the delegate writes `context_state.json`
pub fn default_context() -> Value {
    json!({
        "estimated_questions_remaining": 99,
        "context_integrity_percent": 20,
        "current_focus": "Initialization",
        "key_insights": [],
        "risks": [],
        "last_updated": now_timestamp(),
        "session_id": "session_001"
    })
}

#[derive(Debug, Clone)]
pub struct QueryLayer {
    store: ItemStore,
    questions_label: String,
    answers_label: String,
}

impl QueryLayer {
    pub fn new(store: ItemStore) -> Self {
        let label = |p: &std::path::Path| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.display().to_string())
        };
        Self {
            questions_label: label(store.questions_dir()),
            answers_label: label(store.answers_dir()),
            store,
        }
    }

    pub async fn list_questions(&self) -> Result<Vec<Question>> {
        self.store.list_questions().await
    }

    pub async fn list_answers(&self) -> Result<Vec<Answer>> {
        self.store.list_answers().await
    }

    pub async fn get_question(&self, id: &str) -> Result<Option<Question>> {
        self.store.read_question(id).await
    }

    pub async fn get_status(&self) -> Result<StatusReport> {
        let state = self
            .store
            .read_state()
            .await?
            .unwrap_or_else(|| json!({}));
        Ok(StatusReport {
            status: "ok",
            state,
            stats: SessionStats {
                total_questions: self.store.count_questions().await?,
                total_answers: self.store.count_answers().await?,
                questions_dir: self.questions_label.clone(),
                answers_dir: self.answers_label.clone(),
            },
        })
    }

    pub async fn get_context(&self) -> Result<Value> {
        Ok(self
            .store
            .read_context()
            .await?
            .unwrap_or_else(default_context))
    }
}
