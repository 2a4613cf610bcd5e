use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use evallab_types::EvaluationReport;

/// Destination for finished reports.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn emit(&self, report: &EvaluationReport) -> Result<()>;
}

/// Writes the report as a pretty-printed JSON array of flat records,
/// replacing the file.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn emit(&self, report: &EvaluationReport) -> Result<()> {
        let body = serde_json::to_string_pretty(&report.to_flat_records())?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write {:?}", self.path))?;
        info!(path = ?self.path, records = report.len(), "wrote JSON report");
        Ok(())
    }
}

/// Writes one flat record per line. With `append`, successive reports
/// accumulate in the same file.
pub struct JsonlFileSink {
    path: PathBuf,
    append: bool,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: false,
        }
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

#[async_trait]
impl ResultSink for JsonlFileSink {
    async fn emit(&self, report: &EvaluationReport) -> Result<()> {
        let mut body = String::new();
        for record in report.to_flat_records() {
            body.push_str(&serde_json::to_string(&record)?);
            body.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {:?}", self.path))?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        info!(path = ?self.path, records = report.len(), "wrote JSONL report");
        Ok(())
    }
}

/// Keeps every emitted report in memory.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<EvaluationReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Result<Vec<EvaluationReport>> {
        Ok(self
            .reports
            .lock()
            .map_err(|_| anyhow!("memory sink poisoned"))?
            .clone())
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn emit(&self, report: &EvaluationReport) -> Result<()> {
        self.reports
            .lock()
            .map_err(|_| anyhow!("memory sink poisoned"))?
            .push(report.clone());
        Ok(())
    }
}

/// Persists reports to SQLite, one run per sink.
#[cfg(feature = "persistence")]
pub struct SqliteSink {
    store: evallab_store::Store,
    run_id: i64,
    name: String,
}

#[cfg(feature = "persistence")]
impl SqliteSink {
    pub fn open(path: impl AsRef<std::path::Path>, name: impl Into<String>) -> Result<Self> {
        let store = evallab_store::Store::open(path)?;
        Self::with_store(store, name)
    }

    pub fn with_store(store: evallab_store::Store, name: impl Into<String>) -> Result<Self> {
        let run_id = store.create_run(None)?;
        Ok(Self {
            store,
            run_id,
            name: name.into(),
        })
    }

    pub fn store(&self) -> &evallab_store::Store {
        &self.store
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }
}

#[cfg(feature = "persistence")]
#[async_trait]
impl ResultSink for SqliteSink {
    async fn emit(&self, report: &EvaluationReport) -> Result<()> {
        let store = self.store.clone();
        let run_id = self.run_id;
        let name = self.name.clone();
        let report = report.clone();
        let report_id =
            tokio::task::spawn_blocking(move || store.save_report(run_id, &name, &report))
                .await
                .map_err(|e| anyhow!(e))??;
        info!(run_id, report_id, "saved report to SQLite");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::datasource::{DataSource, RecordedDataSource};
    use evallab_types::{CheckErrorKind, CheckResult, EvaluationRecord, Interaction};

    fn report() -> EvaluationReport {
        let mut results = BTreeMap::new();
        results.insert("chrf".to_string(), CheckResult::scored(0.5, "chrf"));
        results.insert(
            "relevance".to_string(),
            CheckResult::failed(CheckErrorKind::OracleUnavailable, "503"),
        );
        EvaluationReport::new(vec![EvaluationRecord {
            interaction: Interaction::new("q", "c", "r").with_id("1"),
            results,
            overall_score: Some(0.5),
        }])
    }

    #[tokio::test]
    async fn test_json_sink_round_trips_through_recorded_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = report();
        JsonFileSink::new(&path).emit(&report).await.unwrap();

        let loaded = RecordedDataSource::new(&path).load_report().await.unwrap();
        assert_eq!(loaded.records, report.records);
        let interactions = RecordedDataSource::new(&path).load().await.unwrap();
        assert_eq!(interactions[0].id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_jsonl_sink_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let sink = JsonlFileSink::new(&path).append(true);
        sink.emit(&report()).await.unwrap();
        sink.emit(&report()).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);

        JsonlFileSink::new(&path).emit(&report()).await.unwrap();
        let loaded = RecordedDataSource::new(&path).load_report().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.emit(&report()).await.unwrap();
        assert_eq!(sink.reports().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_reports_poisoned_lock() {
        let sink = MemorySink::new();
        sink.emit(&report()).await.unwrap();
        std::thread::scope(|s| {
            let held = s.spawn(|| {
                let _guard = sink.reports.lock().unwrap();
                panic!("writer died holding the lock");
            });
            assert!(held.join().is_err());
        });
        assert!(sink.reports().is_err());
        assert!(sink.emit(&report()).await.is_err());
    }
}
