//! Persistent item store: one JSON file per question/answer record.
//!
//! The delegate creates and deletes every record. The only write made here is
//! [`ItemStore::write_question`], which replaces a question file atomically.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{QnaError, Result};
use crate::output::is_identifier;

pub const QUESTION_SUFFIX: &str = "_question.json";
pub const ANSWER_SUFFIX: &str = "_answer.json";

/// A question record. Only `id` is required; every other field belongs to the
/// delegate and is republished verbatim, whatever its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Question {
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }

    /// Options, when the record carries them as an array of strings
    pub fn options(&self) -> Option<Vec<&str>> {
        self.fields
            .get("options")?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.fields.get("timestamp").and_then(Value::as_str)
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Replace the options and stamp the record with the current time
    pub fn set_options(&mut self, options: Vec<String>) {
        self.fields.insert("options".into(), Value::from(options));
        self.fields
            .insert("timestamp".into(), Value::String(now_timestamp()));
    }
}

/// An answer record: `id` plus whatever the delegate wrote (question id,
/// selected option, custom text, comment, answer type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Answer {
    pub fn question_id(&self) -> Option<&str> {
        self.fields.get("question_id").and_then(Value::as_str)
    }
}

/// Records that can be listed and sorted by identifier
pub trait Record: DeserializeOwned {
    const SUFFIX: &'static str;
    fn id(&self) -> &str;
}

impl Record for Question {
    const SUFFIX: &'static str = QUESTION_SUFFIX;
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Answer {
    const SUFFIX: &'static str = ANSWER_SUFFIX;
    fn id(&self) -> &str {
        &self.id
    }
}

/// RFC 3339 timestamp with millisecond precision, as written into records
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct ItemStore {
    questions_dir: PathBuf,
    answers_dir: PathBuf,
    state_file: PathBuf,
    context_file: PathBuf,
}

impl ItemStore {
    pub fn new(
        questions_dir: impl Into<PathBuf>,
        answers_dir: impl Into<PathBuf>,
        state_file: impl Into<PathBuf>,
        context_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            questions_dir: questions_dir.into(),
            answers_dir: answers_dir.into(),
            state_file: state_file.into(),
            context_file: context_file.into(),
        }
    }

    /// Store rooted at `dir` with the default file names
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(
            dir.join("questions"),
            dir.join("answers"),
            dir.join("state.json"),
            dir.join("context_state.json"),
        )
    }

    pub fn questions_dir(&self) -> &Path {
        &self.questions_dir
    }

    pub fn answers_dir(&self) -> &Path {
        &self.answers_dir
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.questions_dir).await?;
        tokio::fs::create_dir_all(&self.answers_dir).await?;
        Ok(())
    }

    /// Path of a question record, or `None` when `id` is not identifier-shaped
    pub fn question_path(&self, id: &str) -> Option<PathBuf> {
        is_identifier(id).then(|| self.questions_dir.join(format!("{}{}", id, QUESTION_SUFFIX)))
    }

    pub async fn read_question(&self, id: &str) -> Result<Option<Question>> {
        match self.question_path(id) {
            Some(path) => read_json(&path).await,
            None => Ok(None),
        }
    }

    /// Replace the record stored under `id` in full: write a sibling temp file,
    /// then rename it over the original so readers see the old or the new
    /// record, never a partial one. The target is the file `id` names, not the
    /// `id` field inside the record.
    pub async fn write_question(&self, id: &str, question: &Question) -> Result<()> {
        let path = self
            .question_path(id)
            .ok_or_else(|| QnaError::not_found("Question not found"))?;
        write_json_atomic(&path, question).await
    }

    pub async fn list_questions(&self) -> Result<Vec<Question>> {
        list_records(&self.questions_dir).await
    }

    pub async fn list_answers(&self) -> Result<Vec<Answer>> {
        list_records(&self.answers_dir).await
    }

    pub async fn count_questions(&self) -> Result<usize> {
        count_records(&self.questions_dir, QUESTION_SUFFIX).await
    }

    pub async fn count_answers(&self) -> Result<usize> {
        count_records(&self.answers_dir, ANSWER_SUFFIX).await
    }

    /// Session state document, verbatim
    pub async fn read_state(&self) -> Result<Option<Value>> {
        read_json(&self.state_file).await
    }

    /// Context document, verbatim
    pub async fn read_context(&self) -> Result<Option<Value>> {
        read_json(&self.context_file).await
    }
}

/// Read and parse a JSON file. Missing or unparseable files read as `None`.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            tracing::warn!("Skipping unreadable record {}: {}", path.display(), e);
            return Ok(None);
        }
    };
    match serde_json::from_str(&data) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Skipping malformed record {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| QnaError::persistence(format!("invalid path {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&temp_path, &content).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(QnaError::persistence(format!(
            "failed to write {}: {}",
            temp_path.display(),
            e
        )));
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(QnaError::persistence(format!(
            "failed to replace {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

async fn record_paths(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(QnaError::persistence(format!(
                "failed to list {}: {}",
                dir.display(),
                e
            )));
        }
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| n.ends_with(suffix)) {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

async fn list_records<R: Record>(dir: &Path) -> Result<Vec<R>> {
    let mut records = Vec::new();
    for path in record_paths(dir, R::SUFFIX).await? {
        if let Some(record) = read_json::<R>(&path).await? {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.id().cmp(b.id()));
    Ok(records)
}

async fn count_records(dir: &Path, suffix: &str) -> Result<usize> {
    Ok(record_paths(dir, suffix).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn put(dir: &Path, name: &str, value: Value) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(dir.join(name), value.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_sorted_regardless_of_creation_order() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        for id in ["q_010", "q_002", "q_100", "q_001"] {
            put(
                store.questions_dir(),
                &format!("{}_question.json", id),
                json!({"id": id, "text": format!("text {}", id)}),
            )
            .await;
        }

        let ids: Vec<String> = store
            .list_questions()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec!["q_001", "q_002", "q_010", "q_100"]);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_and_foreign_files() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        put(
            store.answers_dir(),
            "a_2_answer.json",
            json!({"id": "a_2", "question_id": "q_1", "selected_option": "blue"}),
        )
        .await;
        put(store.answers_dir(), "notes.json", json!({"id": "x", "question_id": "q"})).await;
        tokio::fs::write(store.answers_dir().join("a_1_answer.json"), "{not json")
            .await
            .unwrap();

        let answers = store.list_answers().await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].fields["selected_option"], "blue");
        assert_eq!(answers[0].question_id(), Some("q_1"));
        assert_eq!(store.count_answers().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_directories_list_empty() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path().join("nowhere"));
        assert!(store.list_questions().await.unwrap().is_empty());
        assert_eq!(store.count_questions().await.unwrap(), 0);
        assert!(store.read_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_question_rejects_path_escape() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        put(dir.path(), "secret_question.json", json!({"id": "secret", "text": "x"})).await;

        assert!(store.read_question("../secret").await.unwrap().is_none());
        assert!(store.read_question("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_question_replaces_file_and_keeps_extra_fields() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        put(
            store.questions_dir(),
            "q_1_question.json",
            json!({"id": "q_1", "text": "Pick", "timestamp": "2020-01-01T00:00:00Z", "round": 3}),
        )
        .await;

        let mut q = store.read_question("q_1").await.unwrap().unwrap();
        q.set_options(vec!["red".into(), "blue".into()]);
        store.write_question("q_1", &q).await.unwrap();

        let reread = store.read_question("q_1").await.unwrap().unwrap();
        assert_eq!(reread.options().unwrap(), ["red", "blue"]);
        assert_eq!(reread.fields["round"], 3);
        assert_ne!(reread.timestamp(), Some("2020-01-01T00:00:00Z"));

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(store.questions_dir()).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["q_1_question.json"]);
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_records_with_unusual_field_shapes_are_kept() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        put(
            store.questions_dir(),
            "q_1_question.json",
            json!({"id": "q_1", "text": "Pick", "timestamp": 1714557600000u64}),
        )
        .await;
        put(
            store.questions_dir(),
            "q_2_question.json",
            json!({"id": "q_2", "text": "Pick", "options": [{"label": "a"}]}),
        )
        .await;
        put(store.questions_dir(), "q_3_question.json", json!({"text": "no id"})).await;

        let q1 = store.read_question("q_1").await.unwrap().unwrap();
        assert_eq!(q1.fields["timestamp"], 1714557600000u64);
        assert!(q1.timestamp_utc().is_none());

        let q2 = store.read_question("q_2").await.unwrap().unwrap();
        assert!(q2.options().is_none());
        assert_eq!(
            serde_json::to_value(&q2).unwrap(),
            json!({"id": "q_2", "text": "Pick", "options": [{"label": "a"}]})
        );

        let listed = store.list_questions().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(store.read_question("q_3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_question_targets_the_file_it_was_read_from() {
        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        put(
            store.questions_dir(),
            "q_1_question.json",
            json!({"id": "Q-1", "text": "Pick"}),
        )
        .await;

        let mut q = store.read_question("q_1").await.unwrap().unwrap();
        q.set_options(vec!["red".into()]);
        store.write_question("q_1", &q).await.unwrap();

        assert_eq!(file_names(store.questions_dir()).await, vec!["q_1_question.json"]);
        let reread = store.read_question("q_1").await.unwrap().unwrap();
        assert_eq!(reread.id, "Q-1");
        assert_eq!(reread.options().unwrap(), ["red"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reader_never_sees_partial_record() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempdir().unwrap();
        let store = ItemStore::in_dir(dir.path());
        let long_text = "x".repeat(64 * 1024);
        put(
            store.questions_dir(),
            "q_1_question.json",
            json!({"id": "q_1", "text": long_text}),
        )
        .await;
        let path = store.question_path("q_1").unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = done.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let mut reads = 0usize;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let data = tokio::fs::read_to_string(&path).await.unwrap();
                    let q: Question = serde_json::from_str(&data)
                        .unwrap_or_else(|e| panic!("partial record after {} reads: {}", reads, e));
                    assert_eq!(q.text().map(str::len), Some(64 * 1024));
                    reads += 1;
                    if finished {
                        break reads;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut q = store.read_question("q_1").await.unwrap().unwrap();
        for i in 0..200 {
            q.set_options(vec![format!("option {}", i)]);
            store.write_question("q_1", &q).await.unwrap();
        }
        done.store(true, Ordering::SeqCst);

        assert!(reader.await.unwrap() > 0);
        assert_eq!(file_names(store.questions_dir()).await, vec!["q_1_question.json"]);
    }
}
