use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use evallab_types::{EvaluationReport, Interaction};

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Interaction>>;
}

pub struct VecDataSource {
    interactions: Vec<Interaction>,
}

impl VecDataSource {
    pub fn new(interactions: Vec<Interaction>) -> Self {
        Self { interactions }
    }
}

#[async_trait]
impl DataSource for VecDataSource {
    async fn load(&self) -> Result<Vec<Interaction>> {
        Ok(self.interactions.clone())
    }
}

fn trailing_comma() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").ok()).as_ref()
}

/// Parse hand-edited JSON: whole-line `//` comments and trailing commas
/// before `]` or `}` are removed first.
pub fn parse_lenient_json(content: &str) -> Result<Value> {
    let without_comments: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect();
    let joined = without_comments.join("\n");
    let cleaned = match trailing_comma() {
        Some(re) => re.replace_all(&joined, "$1").into_owned(),
        None => joined,
    };
    serde_json::from_str(&cleaned).context("Invalid JSON after cleanup")
}

/// A JSON array of interactions:
/// `[{"id": "...", "question": ..., "context": ..., "response": ..., "reference": ...}]`
pub struct JsonDataSource {
    path: PathBuf,
}

impl JsonDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for JsonDataSource {
    async fn load(&self) -> Result<Vec<Interaction>> {
        let content = tokio_fs_read_to_string(&self.path).await?;
        let value = parse_lenient_json(&content)
            .with_context(|| format!("Failed to parse {:?}", self.path))?;
        let items = value
            .as_array()
            .ok_or_else(|| anyhow!("{:?}: expected a JSON array of interactions", self.path))?;
        items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                Interaction::deserialize(item)
                    .with_context(|| format!("Item {}: not an interaction", idx + 1))
            })
            .collect()
    }
}

/// One interaction object per line.
pub struct JsonlDataSource {
    path: PathBuf,
}

impl JsonlDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for JsonlDataSource {
    async fn load(&self) -> Result<Vec<Interaction>> {
        let content = tokio_fs_read_to_string(&self.path).await?;
        let mut interactions = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let interaction: Interaction = serde_json::from_str(line)
                .with_context(|| format!("Invalid interaction on line {}", idx + 1))?;
            interactions.push(interaction);
        }
        Ok(interactions)
    }
}

/// Interactions stored in a previously emitted report, either a JSON array of
/// flat records or one flat record per line.
pub struct RecordedDataSource {
    path: PathBuf,
}

impl RecordedDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The full recorded report, check results included.
    pub async fn load_report(&self) -> Result<EvaluationReport> {
        let content = tokio_fs_read_to_string(&self.path).await?;
        let trimmed = content.trim_start();
        let values: Vec<Value> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)
                .with_context(|| format!("Invalid JSON array in {:?}", self.path))?
        } else {
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| {
                    serde_json::from_str::<Value>(line)
                        .with_context(|| format!("Invalid JSON on line {}", idx + 1))
                })
                .collect::<Result<_>>()?
        };
        EvaluationReport::from_flat_records(&values)
            .with_context(|| format!("{:?} is not a recorded report", self.path))
    }
}

#[async_trait]
impl DataSource for RecordedDataSource {
    async fn load(&self) -> Result<Vec<Interaction>> {
        let report = self.load_report().await?;
        Ok(report.records.into_iter().map(|r| r.interaction).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ConversationFile {
    #[serde(default)]
    chat_id: Option<Value>,
    #[serde(default)]
    conversation_turns: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct Turn {
    #[serde(default)]
    turn: Option<Value>,
    #[serde(default)]
    role: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct VectorsFile {
    #[serde(default)]
    data: VectorsData,
}

#[derive(Debug, Default, Deserialize)]
struct VectorsData {
    #[serde(default)]
    vector_data: Vec<Vector>,
    #[serde(default)]
    sources: Sources,
}

#[derive(Debug, Clone, Deserialize)]
struct Vector {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    source_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Sources {
    #[serde(default)]
    vectors_used: Vec<i64>,
    #[serde(default)]
    vectors_info: Vec<VectorInfo>,
}

#[derive(Debug, Deserialize)]
struct VectorInfo {
    vector_id: i64,
    #[serde(default)]
    score: f64,
}

const USER_ROLE: &str = "User";
const ASSISTANT_ROLE: &str = "AI/Chatbot";
const MAX_RANKED_VECTORS: usize = 10;
const MAX_UNRANKED_VECTORS: usize = 15;

/// A chat transcript plus the retrieval results that fed it.
///
/// Every assistant turn directly preceded by a user turn becomes one
/// interaction. All of them share the same context, built from the retrieved
/// vectors: the ones the assistant actually used first, then the best scored
/// remaining ones.
pub struct ConversationDataSource {
    conversation: PathBuf,
    vectors: PathBuf,
    turn: Option<u64>,
}

impl ConversationDataSource {
    pub fn new(conversation: impl Into<PathBuf>, vectors: impl Into<PathBuf>) -> Self {
        Self {
            conversation: conversation.into(),
            vectors: vectors.into(),
            turn: None,
        }
    }

    /// Only yield the assistant reply with this turn number.
    pub fn turn(mut self, turn: u64) -> Self {
        self.turn = Some(turn);
        self
    }
}

fn select_vectors(data: &VectorsData) -> Vec<Vector> {
    let used = &data.sources.vectors_used;
    if used.is_empty() {
        return data
            .vector_data
            .iter()
            .take(MAX_UNRANKED_VECTORS)
            .cloned()
            .collect();
    }

    let scores: HashMap<i64, f64> = data
        .sources
        .vectors_info
        .iter()
        .map(|info| (info.vector_id, info.score))
        .collect();
    let is_used = |v: &Vector| v.id.map_or(false, |id| used.contains(&id));

    let mut selected: Vec<Vector> = data.vector_data.iter().filter(|v| is_used(v)).cloned().collect();
    let mut others: Vec<&Vector> = data.vector_data.iter().filter(|v| !is_used(v)).collect();
    let score_of = |v: &Vector| v.id.and_then(|id| scores.get(&id).copied()).unwrap_or(0.0);
    others.sort_by(|a, b| score_of(b).total_cmp(&score_of(a)));
    selected.extend(others.into_iter().take(MAX_RANKED_VECTORS).cloned());
    selected
}

fn format_context(vectors: &[Vector]) -> String {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            format!(
                "[Source {}] {}\n{}",
                i + 1,
                v.source_url.as_deref().unwrap_or("Unknown source"),
                v.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn id_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DataSource for ConversationDataSource {
    async fn load(&self) -> Result<Vec<Interaction>> {
        let conversation: ConversationFile = serde_json::from_value(parse_lenient_json(
            &tokio_fs_read_to_string(&self.conversation).await?,
        )?)
        .with_context(|| format!("{:?} is not a conversation file", self.conversation))?;
        let vectors: VectorsFile = serde_json::from_value(parse_lenient_json(
            &tokio_fs_read_to_string(&self.vectors).await?,
        )?)
        .with_context(|| format!("{:?} is not a context vectors file", self.vectors))?;

        let selected = select_vectors(&vectors.data);
        let context = format_context(&selected);
        debug!(
            vectors = vectors.data.vector_data.len(),
            selected = selected.len(),
            "built conversation context"
        );

        let chat = conversation.chat_id.as_ref().map(id_part);
        let wanted = self.turn.map(|t| t.to_string());
        let turns = &conversation.conversation_turns;
        let interactions: Vec<Interaction> = turns
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].role == USER_ROLE && pair[1].role == ASSISTANT_ROLE)
            .map(|(idx, pair)| {
                let turn = pair[1]
                    .turn
                    .as_ref()
                    .map(id_part)
                    .unwrap_or_else(|| (idx + 1).to_string());
                (turn, pair)
            })
            .filter(|(turn, _)| wanted.as_ref().map_or(true, |w| w == turn))
            .map(|(turn, pair)| {
                let id = match &chat {
                    Some(chat) => format!("{chat}-{turn}"),
                    None => turn,
                };
                Interaction::new(pair[0].message.clone(), context.clone(), pair[1].message.clone())
                    .with_id(id)
            })
            .collect();
        if let (Some(turn), true) = (self.turn, interactions.is_empty()) {
            warn!(turn, path = ?self.conversation, "no assistant reply with that turn number");
        }
        Ok(interactions)
    }
}

#[cfg(not(feature = "sync-fs"))]
async fn tokio_fs_read_to_string(path: &PathBuf) -> Result<String> {
    use tokio::fs;
    fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}

#[cfg(feature = "sync-fs")]
async fn tokio_fs_read_to_string(path: &PathBuf) -> Result<String> {
    use std::fs;
    use tokio::task;
    let path_clone = path.clone();
    let content = task::spawn_blocking(move || {
        fs::read_to_string(&path_clone).with_context(|| format!("Failed to read {:?}", path_clone))
    })
    .await
    .map_err(|e| anyhow!(e))??;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_lenient_json_cleanup() {
        let v = parse_lenient_json("// header\n[\n  {\"a\": 1,},\n  // note\n  [2, 3,],\n]").unwrap();
        assert_eq!(v, serde_json::json!([{"a": 1}, [2, 3]]));
    }

    #[tokio::test]
    async fn test_json_source_accepts_aliases() {
        let file = write_temp(
            r#"[
                {"question": "q1", "context": "c1", "response": "r1"},
                // legacy field names
                {"user_query": "q2", "ai_response": "r2"},
            ]"#,
        );
        let items = JsonDataSource::new(file.path()).load().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].question, "q2");
        assert_eq!(items[1].context, "");
    }

    #[tokio::test]
    async fn test_jsonl_source_reports_line() {
        let file = write_temp("{\"question\": \"q\", \"response\": \"r\"}\n\n{\"question\": 1}\n");
        let err = JsonlDataSource::new(file.path()).load().await.unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[tokio::test]
    async fn test_conversation_source() {
        let conversation = write_temp(
            r#"{
                "chat_id": 78128,
                "conversation_turns": [
                    {"turn": 1, "role": "AI/Chatbot", "message": "Hello!"},
                    {"turn": 2, "role": "User", "message": "Which ocean is largest?"},
                    {"turn": 3, "role": "AI/Chatbot", "message": "The Pacific."},
                    {"turn": 4, "role": "User", "message": "Thanks"},
                ]
            }"#,
        );
        let vectors = write_temp(
            r#"{
                "data": {
                    "vector_data": [
                        {"id": 1, "text": "Deserts are dry."},
                        {"id": 2, "text": "The Pacific is the largest ocean.", "source_url": "https://example.org/pacific"},
                        {"id": 3, "text": "Oceans cover 71% of Earth."}
                    ],
                    "sources": {
                        "vectors_used": [2],
                        "vectors_info": [{"vector_id": 1, "score": 0.1}, {"vector_id": 3, "score": 0.7}]
                    }
                }
            }"#,
        );
        let items = ConversationDataSource::new(conversation.path(), vectors.path())
            .load()
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        let i = &items[0];
        assert_eq!(i.id.as_deref(), Some("78128-3"));
        assert_eq!(i.question, "Which ocean is largest?");
        assert_eq!(i.response, "The Pacific.");
        assert!(i.context.starts_with("[Source 1] https://example.org/pacific\nThe Pacific"));
        let oceans = i.context.find("Oceans cover").unwrap();
        let deserts = i.context.find("Deserts").unwrap();
        assert!(oceans < deserts);
    }

    #[tokio::test]
    async fn test_conversation_single_turn() {
        let conversation = write_temp(
            r#"{
                "chat_id": "c1",
                "conversation_turns": [
                    {"turn": 1, "role": "User", "message": "Largest ocean?"},
                    {"turn": 2, "role": "AI/Chatbot", "message": "The Pacific."},
                    {"turn": 3, "role": "User", "message": "Smallest?"},
                    {"turn": 4, "role": "AI/Chatbot", "message": "The Arctic."}
                ]
            }"#,
        );
        let vectors = write_temp(
            r#"{"data": {"vector_data": [{"id": 1, "text": "Ocean facts."}], "sources": {}}}"#,
        );
        let all = ConversationDataSource::new(conversation.path(), vectors.path())
            .load()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let one = ConversationDataSource::new(conversation.path(), vectors.path())
            .turn(4)
            .load()
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id.as_deref(), Some("c1-4"));
        assert_eq!(one[0].response, "The Arctic.");

        let none = ConversationDataSource::new(conversation.path(), vectors.path())
            .turn(3)
            .load()
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
