#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, params};

const SCHEMA_VERSION: &str = "1";

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          jid TEXT PRIMARY KEY,
          user TEXT NOT NULL,
          job_state TEXT NOT NULL
            CHECK (job_state IN ('RUNNING', 'FINISHED')),
          nodes TEXT NOT NULL,
          monitor_state TEXT NOT NULL
            CHECK (monitor_state IN ('PENDING', 'RUNNING', 'COMPLETED')),
          retrieval_state TEXT
            CHECK (retrieval_state IS NULL OR retrieval_state IN ('PENDING', 'COMPLETED')),
          process_names TEXT NOT NULL DEFAULT '',
          job_start_ms INTEGER,
          monitor_start_ms INTEGER,
          job_end_ms INTEGER,
          monitor_end_ms INTEGER,
          anon_jid TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_phase
          ON jobs(job_state, monitor_state, retrieval_state);
        CREATE INDEX IF NOT EXISTS idx_jobs_anon
          ON jobs(anon_jid);
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}
