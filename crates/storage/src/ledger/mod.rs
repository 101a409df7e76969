#![forbid(unsafe_code)]

mod error;
mod jobs;
mod schema;
mod types;

pub use error::StoreError;
pub use types::*;

use nw_core::{JobRecord, JobState, MonitorState, RetrievalState};
use rusqlite::{Connection, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "nodewatch.db";
const NODE_SEPARATOR: char = ',';

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILE_NAME))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::install_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

const JOB_COLUMNS: &str = "jid, user, job_state, nodes, monitor_state, retrieval_state, \
     process_names, job_start_ms, monitor_start_ms, job_end_ms, monitor_end_ms, anon_jid";

fn job_from_row(row: &Row<'_>) -> Result<JobRecord, StoreError> {
    let jid = row.get::<_, String>(0)?;
    let corrupt = |reason: String| StoreError::CorruptRow {
        jid: jid.clone(),
        reason,
    };

    let job_state = row
        .get::<_, String>(2)?
        .parse::<JobState>()
        .map_err(|e| corrupt(e.to_string()))?;
    let monitor_state = row
        .get::<_, String>(4)?
        .parse::<MonitorState>()
        .map_err(|e| corrupt(e.to_string()))?;
    let retrieval_state = RetrievalState::from_column(row.get::<_, Option<String>>(5)?.as_deref())
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(JobRecord {
        user: row.get(1)?,
        job_state,
        nodes: split_nodes(&row.get::<_, String>(3)?),
        monitor_state,
        retrieval_state,
        process_names: row.get(6)?,
        job_start_ms: row.get(7)?,
        monitor_start_ms: row.get(8)?,
        job_end_ms: row.get(9)?,
        monitor_end_ms: row.get(10)?,
        anonymized_job_id: row.get(11)?,
        jid,
    })
}

fn join_nodes(nodes: &[String]) -> String {
    nodes.join(&NODE_SEPARATOR.to_string())
}

fn split_nodes(raw: &str) -> Vec<String> {
    raw.split(NODE_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
