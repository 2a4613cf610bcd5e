use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use evallab_types::{CheckErrorKind, CheckResult, EvaluationRecord, EvaluationReport, Interaction};

/// SQLite persistence for evaluation reports.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntity {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntity {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub records: usize,
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("Invalid timestamp {text:?}"))?
        .with_timezone(&Utc))
}

impl Store {
    /// Open (or create) a store at the given path, e.g. "evallab.db".
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store connection poisoned by a panicked writer"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                summary TEXT,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            );
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY,
                report_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                interaction_id TEXT,
                question TEXT NOT NULL,
                context TEXT NOT NULL,
                response TEXT NOT NULL,
                reference TEXT,
                overall_score REAL,
                FOREIGN KEY(report_id) REFERENCES reports(id)
            );
            CREATE TABLE IF NOT EXISTS check_results (
                id INTEGER PRIMARY KEY,
                record_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                score REAL,
                explanation TEXT NOT NULL,
                error TEXT,
                passed BOOLEAN,
                partial BOOLEAN NOT NULL,
                details TEXT,
                FOREIGN KEY(record_id) REFERENCES records(id)
            );",
        )?;
        Ok(())
    }

    /// Create a new run entry
    pub fn create_run(&self, metadata: Option<serde_json::Value>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (created_at, metadata) VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), metadata.map(|v| v.to_string())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunEntity> {
        let conn = self.conn()?;
        let (created_at, metadata): (String, Option<String>) = conn
            .query_row(
                "SELECT created_at, metadata FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("Run {run_id} not found"))?;
        Ok(RunEntity {
            id: run_id,
            created_at: parse_time(&created_at)?,
            metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        })
    }

    /// Save a full report, records and check results, in one transaction.
    pub fn save_report(&self, run_id: i64, name: &str, report: &EvaluationReport) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO reports (run_id, name, generated_at, summary) VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                name,
                report.generated_at.to_rfc3339(),
                serde_json::to_string(&report.summary()).ok()
            ],
        )?;
        let report_id = tx.last_insert_rowid();

        for (position, record) in report.records.iter().enumerate() {
            let i = &record.interaction;
            tx.execute(
                "INSERT INTO records (report_id, position, interaction_id, question, context, response, reference, overall_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    report_id,
                    position as i64,
                    i.id,
                    i.question,
                    i.context,
                    i.response,
                    i.reference,
                    record.overall_score
                ],
            )?;
            let record_id = tx.last_insert_rowid();

            for (check, result) in &record.results {
                tx.execute(
                    "INSERT INTO check_results (record_id, name, score, explanation, error, passed, partial, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        record_id,
                        check,
                        result.score,
                        result.explanation,
                        result.error.map(|e| e.as_str()),
                        result.passed,
                        result.partial,
                        result.details.as_ref().map(|d| d.to_string())
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(report_id)
    }

    pub fn list_reports(&self, run_id: i64) -> Result<Vec<ReportEntity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.generated_at, COUNT(rec.id)
             FROM reports r LEFT JOIN records rec ON rec.report_id = r.id
             WHERE r.run_id = ?1 GROUP BY r.id ORDER BY r.id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut reports = Vec::new();
        for row in rows {
            let (id, name, generated_at, records) = row?;
            reports.push(ReportEntity {
                id,
                run_id,
                name,
                generated_at: parse_time(&generated_at)?,
                records: records as usize,
            });
        }
        Ok(reports)
    }

    /// Rebuild a saved report, record order preserved.
    pub fn load_report(&self, report_id: i64) -> Result<EvaluationReport> {
        let conn = self.conn()?;
        let generated_at: String = conn
            .query_row(
                "SELECT generated_at FROM reports WHERE id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .with_context(|| format!("Report {report_id} not found"))?;

        let mut record_stmt = conn.prepare(
            "SELECT id, interaction_id, question, context, response, reference, overall_score
             FROM records WHERE report_id = ?1 ORDER BY position",
        )?;
        let mut check_stmt = conn.prepare(
            "SELECT name, score, explanation, error, passed, partial, details
             FROM check_results WHERE record_id = ?1",
        )?;

        let rows = record_stmt.query_map(params![report_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                Interaction {
                    id: row.get(1)?,
                    question: row.get(2)?,
                    context: row.get(3)?,
                    response: row.get(4)?,
                    reference: row.get(5)?,
                },
                row.get::<_, Option<f64>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (record_id, interaction, overall_score) = row?;
            let mut results = BTreeMap::new();
            let checks = check_stmt.query_map(params![record_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<bool>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;
            for check in checks {
                let (name, score, explanation, error, passed, partial, details) = check?;
                let error = error
                    .map(|e| {
                        serde_json::from_value::<CheckErrorKind>(serde_json::Value::String(e.clone()))
                            .with_context(|| format!("Unknown error kind {e:?} for check {name}"))
                    })
                    .transpose()?;
                let details = details.map(|d| serde_json::from_str(&d)).transpose()?;
                results.insert(
                    name,
                    CheckResult {
                        score,
                        explanation,
                        error,
                        passed,
                        partial,
                        details,
                    },
                );
            }
            records.push(EvaluationRecord {
                interaction,
                results,
                overall_score,
            });
        }

        Ok(EvaluationReport {
            generated_at: parse_time(&generated_at)?,
            records,
        })
    }
}
