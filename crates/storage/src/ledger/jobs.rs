#![forbid(unsafe_code)]

use super::*;
use nw_core::{Phase, Stamp, Transition};
use rusqlite::{OptionalExtension, Transaction, params, params_from_iter, types::Value};
use std::collections::BTreeSet;

const MAX_LIST_LIMIT: usize = 1_000;
const MAX_PROCESS_NAMES_LEN: usize = 64_000;

fn validate_new_record(record: &JobRecord) -> Result<(), StoreError> {
    if record.jid.trim().is_empty() {
        return Err(StoreError::InvalidInput("job.jid must not be empty"));
    }
    if record.user.trim().is_empty() {
        return Err(StoreError::InvalidInput("job.user must not be empty"));
    }
    if record.nodes.is_empty() {
        return Err(StoreError::InvalidInput("job.nodes must not be empty"));
    }
    if record
        .nodes
        .iter()
        .any(|n| n.is_empty() || n.contains(NODE_SEPARATOR))
    {
        return Err(StoreError::InvalidInput("job.nodes contains an invalid name"));
    }
    if record.anonymized_job_id.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "job.anonymized_job_id must not be empty",
        ));
    }
    Ok(())
}

fn phase_tx(tx: &Transaction<'_>, jid: &str) -> Result<Phase, StoreError> {
    let row = tx
        .query_row(
            "SELECT job_state, monitor_state, retrieval_state FROM jobs WHERE jid=?1",
            params![jid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((job, monitor, retrieval)) = row else {
        return Err(StoreError::UnknownJob(jid.to_string()));
    };
    let corrupt = |reason: String| StoreError::CorruptRow {
        jid: jid.to_string(),
        reason,
    };
    Ok(Phase {
        job: job
            .parse::<JobState>()
            .map_err(|e| corrupt(e.to_string()))?,
        monitor: monitor
            .parse::<MonitorState>()
            .map_err(|e| corrupt(e.to_string()))?,
        retrieval: RetrievalState::from_column(retrieval.as_deref())
            .map_err(|e| corrupt(e.to_string()))?,
    })
}

impl SqliteStore {
    /// Inserts a newly observed job. Returns `false` without touching the
    /// existing row when `jid` is already recorded: identity, nodes, start time
    /// and lifecycle state are first-write-wins.
    pub fn upsert_if_absent(&mut self, record: &JobRecord, now_ms: i64) -> Result<bool, StoreError> {
        validate_new_record(record)?;
        let job_start_ms = record.job_start_ms.unwrap_or(now_ms);

        let inserted = self.conn.execute(
            "INSERT INTO jobs(jid, user, job_state, nodes, monitor_state, retrieval_state, \
               process_names, job_start_ms, monitor_start_ms, job_end_ms, monitor_end_ms, \
               anon_jid, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13) \
             ON CONFLICT(jid) DO NOTHING",
            params![
                record.jid,
                record.user,
                record.job_state.as_str(),
                join_nodes(&record.nodes),
                record.monitor_state.as_str(),
                record.retrieval_state.as_column(),
                record.process_names,
                job_start_ms,
                record.monitor_start_ms,
                record.job_end_ms,
                record.monitor_end_ms,
                record.anonymized_job_id,
                now_ms,
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Marks every RUNNING job whose id is not in `observed` as FINISHED and
    /// returns the ids it finished.
    pub fn mark_finished_if_missing(
        &mut self,
        observed: &BTreeSet<String>,
        now_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let tx = self.conn.transaction()?;
        let running = {
            let mut stmt =
                tx.prepare("SELECT jid FROM jobs WHERE job_state=?1 ORDER BY created_at_ms, jid")?;
            let rows = stmt.query_map(params![JobState::Running.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut finished = Vec::new();
        for jid in running {
            if observed.contains(&jid) {
                continue;
            }
            if apply_transition_tx(&tx, &jid, Transition::JobFinished, now_ms)? {
                finished.push(jid);
            }
        }
        tx.commit()?;
        Ok(finished)
    }

    pub fn select_by_phase(&self, query: PhaseQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut clauses = Vec::<&str>::new();
        let mut values = Vec::<Value>::new();
        if let Some(job) = query.job {
            clauses.push("job_state=?");
            values.push(Value::Text(job.as_str().to_string()));
        }
        if let Some(monitor) = query.monitor {
            clauses.push("monitor_state=?");
            values.push(Value::Text(monitor.as_str().to_string()));
        }
        if let Some(retrieval) = query.retrieval {
            match retrieval.as_column() {
                Some(value) => {
                    clauses.push("retrieval_state=?");
                    values.push(Value::Text(value.to_string()));
                }
                None => clauses.push("retrieval_state IS NULL"),
            }
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at_ms ASC, jid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(job_from_row(row)?);
        }
        Ok(out)
    }

    /// Applies one lifecycle transition to one job as its own transaction.
    ///
    /// Returns `false` when the record is not in the phase the transition
    /// requires (already advanced, or not yet eligible); nothing is written in
    /// that case.
    pub fn apply_transition(
        &mut self,
        jid: &str,
        transition: Transition,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let applied = apply_transition_tx(&tx, jid, transition, now_ms)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Appends a diagnostic fragment to the job's process-name annotation.
    pub fn append_process_names(&mut self, jid: &str, fragment: &str) -> Result<(), StoreError> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT length(process_names) FROM jobs WHERE jid=?1",
                params![jid],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownJob(jid.to_string()))?;

        let room = MAX_PROCESS_NAMES_LEN.saturating_sub(usize::try_from(current).unwrap_or(0));
        let fragment = fragment.chars().take(room).collect::<String>();
        if !fragment.is_empty() {
            tx.execute(
                "UPDATE jobs SET process_names = process_names || ?2 WHERE jid=?1",
                params![jid, fragment],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn job_get(&self, jid: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE jid=?1"))?;
        let mut rows = stmt.query(params![jid])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub fn jobs_list(&self, request: JobsListRequest) -> Result<Vec<JobRecord>, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT) as i64;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at_ms DESC, jid DESC LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(job_from_row(row)?);
        }
        Ok(out)
    }
}

fn apply_transition_tx(
    tx: &Transaction<'_>,
    jid: &str,
    transition: Transition,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let current = phase_tx(tx, jid)?;
    let Some(next) = transition.apply(current) else {
        return Ok(false);
    };

    let stamp_column = match transition.stamp() {
        Stamp::JobEnd => Some("job_end_ms"),
        Stamp::MonitorStart => Some("monitor_start_ms"),
        Stamp::MonitorEnd => Some("monitor_end_ms"),
        Stamp::None => None,
    };
    let stamp_sql = stamp_column
        .map(|column| format!(", {column}=?5"))
        .unwrap_or_default();

    // Compare-and-set on the phase read above.
    let sql = format!(
        "UPDATE jobs SET job_state=?2, monitor_state=?3, retrieval_state=?4, updated_at_ms=?5{stamp_sql} \
         WHERE jid=?1 AND job_state=?6 AND monitor_state=?7 AND retrieval_state IS ?8"
    );
    let changed = tx.execute(
        &sql,
        params![
            jid,
            next.job.as_str(),
            next.monitor.as_str(),
            next.retrieval.as_column(),
            now_ms,
            current.job.as_str(),
            current.monitor.as_str(),
            current.retrieval.as_column(),
        ],
    )?;
    Ok(changed == 1)
}
