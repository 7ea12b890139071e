/*
[INPUT]:  schema.sql, JobRecord/JobStage/JobStatus types
[OUTPUT]: SQLite-backed JobStore pool with narrow CRUD operations
[POS]:    Persistence layer - durable job state behind the gateway and sweep
[UPDATE]: When schema.sql or the job record shape changes
*/

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;

use crate::job::{JobRecord, JobStage, JobStatus};

/// Durable store of job records.
///
/// This is the narrow interface the pipeline workers write through and the
/// recovery sweep and push gateway read through.
pub struct JobStore {
    pool: r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>,
}

impl JobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = r2d2_sqlite::SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });

        let pool = r2d2::Pool::new(manager).context("create sqlite pool")?;
        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store, for tests and ephemeral runs
    pub fn in_memory() -> Result<Self> {
        let manager = r2d2_sqlite::SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .context("create sqlite pool")?;
        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let conn = self.pool.get().context("get sqlite connection")?;
        let stage = encode_enum(&job.stage)?;
        let status = encode_enum(&job.status)?;

        conn.execute(
            "INSERT INTO jobs (job_id, document_id, file_name, stage, status, error, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.job_id,
                job.document_id,
                job.file_name,
                stage,
                status,
                job.error,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .context("insert job")?;

        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.pool.get().context("get sqlite connection")?;

        let row = conn
            .query_row(
                "SELECT job_id, document_id, file_name, stage, status, error, created_at, updated_at FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| JobRow::from_row(row),
            )
            .optional()
            .context("fetch job")?;

        row.map(JobRecord::try_from).transpose()
    }

    /// Move a processing job to its next pipeline stage
    pub fn advance_stage(&self, job_id: &str, stage: JobStage) -> Result<()> {
        let conn = self.pool.get().context("get sqlite connection")?;
        let stage = encode_enum(&stage)?;

        conn.execute(
            "UPDATE jobs SET stage = ?1, updated_at = ?2 WHERE job_id = ?3",
            params![stage, Utc::now().to_rfc3339(), job_id],
        )
        .context("advance job stage")?;

        Ok(())
    }

    pub fn mark_success(&self, job_id: &str, document_id: &str) -> Result<()> {
        let conn = self.pool.get().context("get sqlite connection")?;
        let stage = encode_enum(&JobStage::Done)?;
        let status = encode_enum(&JobStatus::Success)?;

        conn.execute(
            "UPDATE jobs SET stage = ?1, status = ?2, document_id = ?3, error = NULL, updated_at = ?4 WHERE job_id = ?5",
            params![stage, status, document_id, Utc::now().to_rfc3339(), job_id],
        )
        .context("mark job success")?;

        Ok(())
    }

    pub fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let conn = self.pool.get().context("get sqlite connection")?;
        let status = encode_enum(&JobStatus::Failed)?;

        conn.execute(
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE job_id = ?4",
            params![status, error, Utc::now().to_rfc3339(), job_id],
        )
        .context("mark job failed")?;

        Ok(())
    }

    pub fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let conn = self.pool.get().context("get sqlite connection")?;
        let status = encode_enum(&status)?;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, document_id, file_name, stage, status, error, created_at, updated_at FROM jobs WHERE status = ?1 ORDER BY created_at",
            )
            .context("prepare job list")?;

        let rows = stmt
            .query_map(params![status], |row| JobRow::from_row(row))
            .context("query job list")?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(JobRecord::try_from(row?)?);
        }

        Ok(jobs)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.pool.get().context("get sqlite connection")?;
        conn.execute_batch(include_str!("schema.sql"))
            .context("apply schema.sql")?;
        Ok(())
    }
}

struct JobRow {
    job_id: String,
    document_id: Option<String>,
    file_name: String,
    stage: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            document_id: row.get(1)?,
            file_name: row.get(2)?,
            stage: row.get(3)?,
            status: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let stage = decode_enum(&row.stage)?;
        let status = decode_enum(&row.status)?;
        let created_at = parse_timestamp(&row.created_at)?;
        let updated_at = parse_timestamp(&row.updated_at)?;

        Ok(Self {
            job_id: row.job_id,
            document_id: row.document_id,
            file_name: row.file_name,
            stage,
            status,
            error: row.error,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parse timestamp: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn encode_enum<T: Serialize>(value: &T) -> Result<String> {
    let serialized = serde_json::to_value(value).context("serialize enum")?;
    serialized
        .as_str()
        .map(str::to_string)
        .context("enum serialized as non-string")
}

fn decode_enum<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).context("deserialize enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_round_trips() {
        let store = JobStore::in_memory().unwrap();
        let job = JobRecord::new(Some("doc-1".to_string()), "report.pdf");
        store.insert_job(&job).unwrap();

        let fetched = store.get_job(&job.job_id).unwrap().expect("job exists");
        assert_eq!(fetched, job);
        assert!(store.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn advance_stage_keeps_processing() {
        let store = JobStore::in_memory().unwrap();
        let job = JobRecord::new(None, "report.pdf");
        store.insert_job(&job).unwrap();

        store.advance_stage(&job.job_id, JobStage::Embed).unwrap();

        let fetched = store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(fetched.stage, JobStage::Embed);
        assert_eq!(fetched.status, JobStatus::Processing);
    }

    #[test]
    fn mark_success_sets_done_and_document() {
        let store = JobStore::in_memory().unwrap();
        let job = JobRecord::new(None, "report.pdf");
        store.insert_job(&job).unwrap();

        store.mark_success(&job.job_id, "doc-9").unwrap();

        let fetched = store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Success);
        assert_eq!(fetched.stage, JobStage::Done);
        assert_eq!(fetched.document_id.as_deref(), Some("doc-9"));
    }

    #[test]
    fn mark_failed_records_the_reason() {
        let store = JobStore::in_memory().unwrap();
        let job = JobRecord::new(None, "report.pdf");
        store.insert_job(&job).unwrap();

        store
            .mark_failed(&job.job_id, "classification timeout")
            .unwrap();

        let fetched = store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("classification timeout"));
    }

    #[test]
    fn list_filters_by_status() {
        let store = JobStore::in_memory().unwrap();
        let processing = JobRecord::new(None, "a.pdf");
        let failed = JobRecord::new(None, "b.pdf");
        store.insert_job(&processing).unwrap();
        store.insert_job(&failed).unwrap();
        store.mark_failed(&failed.job_id, "boom").unwrap();

        let listed = store.list_jobs_by_status(JobStatus::Processing).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id, processing.job_id);
    }
}
