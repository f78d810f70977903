//! # Problem Context
//!
//! One-shot lookup of the interview problem a session is about. The result is
//! immutable for the life of the session; an unknown id or a failed lookup both give
//! `None`, and the reply generator apologizes instead of inventing a problem.
//!
//! ## Backends:
//! - `HttpProblemStore`: `GET {base}/api/problem/{id}` on the web app
//! - `FileProblemStore`: a local JSON file, handy for development
//!
//! Stored records are not consistently named, so both backends go through
//! `ProblemRecord`, which accepts `solution`/`solution_code` and
//! `hints`/`structured_hints`.

use crate::config::{ProblemSource, ProblemsConfig};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// What the interviewer knows about the problem.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemContext {
    pub title: String,
    pub description: String,
    pub reference_solution: Option<String>,
    pub hints: Option<String>,
    pub transcript: Option<String>,
}

/// A problem as the store returns it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProblemRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub solution_code: Option<String>,
    #[serde(default)]
    pub hints: Option<Value>,
    #[serde(default)]
    pub structured_hints: Option<Value>,
    #[serde(default)]
    pub transcript: Option<String>,
}

fn first_non_empty(candidates: [Option<String>; 2]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

/// Render hints stored either as text or as a list (of strings or objects).
fn render_hints(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Array(items) => {
            let lines: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .map(|line| format!("- {}", line))
                .collect();
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
        other => Some(other.to_string()),
    }
}

impl From<ProblemRecord> for ProblemContext {
    fn from(record: ProblemRecord) -> Self {
        let hints = first_non_empty([
            record.hints.and_then(render_hints),
            record.structured_hints.and_then(render_hints),
        ]);
        Self {
            title: record.title,
            description: record.description,
            reference_solution: first_non_empty([record.solution, record.solution_code]),
            hints,
            transcript: record.transcript,
        }
    }
}

fn id_matches(value: &Value, problem_id: &str) -> bool {
    match value {
        Value::String(id) => id == problem_id,
        Value::Number(id) => id.to_string() == problem_id,
        _ => false,
    }
}

#[async_trait]
pub trait ProblemStore: Send + Sync {
    /// `Ok(None)` means the id is unknown.
    async fn fetch(&self, problem_id: &str) -> Result<Option<ProblemContext>, ProviderError>;
}

/// Look up a problem, folding failures into "not found".
pub async fn load_problem_context(store: &dyn ProblemStore, problem_id: &str) -> Option<ProblemContext> {
    match store.fetch(problem_id).await {
        Ok(Some(context)) => {
            info!(problem_id, title = %context.title, "Loaded problem context");
            Some(context)
        }
        Ok(None) => {
            warn!(problem_id, "Problem not found");
            None
        }
        Err(err) => {
            warn!(problem_id, error = %err, "Problem lookup failed");
            None
        }
    }
}

pub struct HttpProblemStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProblemStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn problem_url(&self, problem_id: &str) -> Result<reqwest::Url, ProviderError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Connection(format!("invalid problem store url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Connection("problem store url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "problem", problem_id]);
        Ok(url)
    }
}

#[async_trait]
impl ProblemStore for HttpProblemStore {
    async fn fetch(&self, problem_id: &str) -> Result<Option<ProblemContext>, ProviderError> {
        let response = self.client.get(self.problem_url(problem_id)?).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: ProblemRecord = response.error_for_status()?.json().await?;
        Ok(Some(record.into()))
    }
}

/// Problems read from a JSON file, either an object keyed by id or an array of
/// records carrying `problemId`.
pub struct FileProblemStore {
    path: String,
}

impl FileProblemStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn find(document: Value, problem_id: &str) -> Result<Option<ProblemRecord>, ProviderError> {
        let parse = |value: Value| {
            serde_json::from_value::<ProblemRecord>(value)
                .map_err(|e| ProviderError::Protocol(e.to_string()))
        };

        match document {
            Value::Object(mut by_id) => by_id.remove(problem_id).map(parse).transpose(),
            Value::Array(records) => records
                .into_iter()
                .find(|record| {
                    record
                        .get("problemId")
                        .is_some_and(|id| id_matches(id, problem_id))
                })
                .map(parse)
                .transpose(),
            _ => Err(ProviderError::Protocol(
                "problem file must hold an object or an array".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ProblemStore for FileProblemStore {
    async fn fetch(&self, problem_id: &str) -> Result<Option<ProblemContext>, ProviderError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ProviderError::Connection(format!("{}: {}", self.path, e)))?;
        let document: Value =
            serde_json::from_str(&raw).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(Self::find(document, problem_id)?.map(ProblemContext::from))
    }
}

/// Fixed problems, keyed by id.
#[cfg(test)]
#[derive(Default)]
pub struct StaticProblemStore {
    problems: std::collections::HashMap<String, ProblemContext>,
}

#[cfg(test)]
impl StaticProblemStore {
    pub fn with(mut self, problem_id: impl Into<String>, context: ProblemContext) -> Self {
        self.problems.insert(problem_id.into(), context);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ProblemStore for StaticProblemStore {
    async fn fetch(&self, problem_id: &str) -> Result<Option<ProblemContext>, ProviderError> {
        Ok(self.problems.get(problem_id).cloned())
    }
}

/// Build the configured store.
pub fn build_store(client: reqwest::Client, config: &ProblemsConfig) -> Arc<dyn ProblemStore> {
    match config.source {
        ProblemSource::Http => Arc::new(HttpProblemStore::new(client, config.base_url.clone())),
        ProblemSource::File => Arc::new(FileProblemStore::new(config.file_path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_prefers_solution_then_solution_code() {
        let record: ProblemRecord = serde_json::from_value(json!({
            "title": "Two Sum",
            "description": "...",
            "solution": "",
            "solution_code": "def two_sum(): ...",
            "structured_hints": ["Use a hash map", "One pass is enough"]
        }))
        .unwrap();

        let context = ProblemContext::from(record);
        assert_eq!(context.reference_solution.as_deref(), Some("def two_sum(): ..."));
        assert_eq!(
            context.hints.as_deref(),
            Some("- Use a hash map\n- One pass is enough")
        );
        assert_eq!(context.transcript, None);
    }

    #[test]
    fn test_plain_hints_win_over_structured() {
        let record: ProblemRecord = serde_json::from_value(json!({
            "title": "T",
            "description": "D",
            "hints": "Think about sorting.",
            "structured_hints": ["ignored"]
        }))
        .unwrap();
        let context = ProblemContext::from(record);
        assert_eq!(context.hints.as_deref(), Some("Think about sorting."));
    }

    #[test]
    fn test_file_document_lookup_by_key_and_array() {
        let keyed = json!({ "7": { "title": "Keyed", "description": "" } });
        let record = FileProblemStore::find(keyed, "7").unwrap().unwrap();
        assert_eq!(record.title, "Keyed");

        let listed = json!([
            { "problemId": 1, "title": "Numeric id", "description": "" },
            { "problemId": "two", "title": "String id", "description": "" }
        ]);
        assert_eq!(
            FileProblemStore::find(listed.clone(), "1").unwrap().unwrap().title,
            "Numeric id"
        );
        assert!(FileProblemStore::find(listed, "3").unwrap().is_none());
    }

    #[test]
    fn test_http_problem_url() {
        let store = HttpProblemStore::new(reqwest::Client::new(), "http://web:3000/");
        assert_eq!(
            store.problem_url("42").unwrap().as_str(),
            "http://web:3000/api/problem/42"
        );
    }

    #[tokio::test]
    async fn test_missing_file_folds_to_none() {
        let store = FileProblemStore::new("/nonexistent/problems.json");
        assert!(store.fetch("1").await.is_err());
        assert!(load_problem_context(&store, "1").await.is_none());
    }
}
