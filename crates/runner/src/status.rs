#![forbid(unsafe_code)]

use nw_core::JobRecord;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn ts_ms_to_rfc3339(ts_ms: i64) -> String {
    let nanos = (ts_ms as i128) * 1_000_000i128;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn ts_cell(ts_ms: Option<i64>) -> String {
    ts_ms.map(ts_ms_to_rfc3339).unwrap_or_else(|| "-".to_string())
}

pub(crate) fn job_json(job: &JobRecord) -> Value {
    json!({
        "jid": job.jid,
        "user": job.user,
        "job_state": job.job_state.as_str(),
        "monitor_state": job.monitor_state.as_str(),
        "retrieval_state": job.retrieval_state.as_column(),
        "nodes": job.nodes,
        "job_start_ms": job.job_start_ms,
        "monitor_start_ms": job.monitor_start_ms,
        "job_end_ms": job.job_end_ms,
        "monitor_end_ms": job.monitor_end_ms,
        "process_names": job.process_names,
        "anonymized_job_id": job.anonymized_job_id,
    })
}

pub(crate) fn render_table(jobs: &[JobRecord]) -> String {
    let mut out = format!(
        "{:<12} {:<12} {:<34} {:>5} {:<24} {:<24}\n",
        "JID", "USER", "PHASE", "NODES", "JOB_START", "JOB_END"
    );
    for job in jobs {
        out.push_str(&format!(
            "{:<12} {:<12} {:<34} {:>5} {:<24} {:<24}\n",
            job.jid,
            job.user,
            job.phase().to_string(),
            job.nodes.len(),
            ts_cell(job.job_start_ms),
            ts_cell(job.job_end_ms),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_core::Transition;

    fn job() -> JobRecord {
        let mut job = JobRecord::observed(
            "1001",
            "alice",
            vec!["nid00010".to_string(), "nid00011".to_string()],
            "ab12",
        );
        job.job_start_ms = Some(0);
        job
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(ts_ms_to_rfc3339(0), "1970-01-01T00:00:00Z");
        assert_eq!(ts_cell(None), "-");
    }

    #[test]
    fn table_lists_phase_and_node_count() {
        let table = render_table(&[job()]);
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("JID"));
        assert!(lines[1].contains("(RUNNING, PENDING, NULL)"), "{}", lines[1]);
        assert!(lines[1].contains("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn json_uses_null_for_undue_retrieval() {
        let value = job_json(&job());
        assert_eq!(value["retrieval_state"], Value::Null);
        assert_eq!(value["nodes"][1], "nid00011");

        let mut started = job();
        let phase = Transition::MonitorStarted
            .apply(started.phase())
            .expect("start");
        started.monitor_state = phase.monitor;
        started.retrieval_state = phase.retrieval;
        assert_eq!(job_json(&started)["retrieval_state"], "PENDING");
    }
}
