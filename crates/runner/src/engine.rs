#![forbid(unsafe_code)]

//! One poll cycle: snapshot, merge, finish detection, then the owed monitor
//! start / stop / log fetch actions, each applied as its own ledger
//! transaction.

use crate::actuator::{ActuationError, RemoteActuator, for_each_host, process_names_fragment};
use crate::scheduler::{SchedulerError, SchedulerQuery};
use nw_core::{JobRecord, SnapshotBuilder, Transition};
use nw_storage::{PhaseQuery, SqliteStore, StoreError};
use std::collections::HashSet;
use tracing::{info, info_span, warn};

#[derive(Debug, thiserror::Error)]
pub(crate) enum CycleError {
    #[error("scheduler query failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("ledger unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineSettings {
    pub(crate) fanout: usize,
    /// Require every host to acknowledge a start or stop before a job
    /// advances. Otherwise a job advances once the command reached every host,
    /// even if some host rejected it. Log retrieval always needs every host.
    pub(crate) strict_actuation: bool,
}

/// What one cycle did, by job id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) observed: usize,
    pub(crate) inserted: Vec<String>,
    pub(crate) excluded: Vec<String>,
    pub(crate) malformed: Vec<String>,
    pub(crate) finished: Vec<String>,
    pub(crate) started: Vec<String>,
    pub(crate) stopped: Vec<String>,
    pub(crate) fetched: Vec<String>,
    /// Jobs whose owed action failed and stays owed.
    pub(crate) deferred: Vec<(String, Transition)>,
}

impl CycleReport {
    pub(crate) fn transitions(&self) -> usize {
        self.finished.len() + self.started.len() + self.stopped.len() + self.fetched.len()
    }
}

pub(crate) struct ReconciliationEngine<S, A> {
    scheduler: S,
    actuator: A,
    builder: SnapshotBuilder,
    settings: EngineSettings,
}

impl<S: SchedulerQuery, A: RemoteActuator> ReconciliationEngine<S, A> {
    pub(crate) fn new(
        scheduler: S,
        actuator: A,
        builder: SnapshotBuilder,
        settings: EngineSettings,
    ) -> Self {
        Self {
            scheduler,
            actuator,
            builder,
            settings,
        }
    }

    #[cfg(test)]
    pub(crate) fn actuator(&self) -> &A {
        &self.actuator
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub(crate) fn run_cycle(
        &self,
        store: &mut SqliteStore,
        now_ms: i64,
    ) -> Result<CycleReport, CycleError> {
        let rows = self.scheduler.running_jobs()?;
        let snapshot = self.builder.build(&rows);

        let mut report = CycleReport {
            observed: snapshot.observed.len(),
            excluded: snapshot.excluded.clone(),
            malformed: snapshot.malformed.iter().map(|m| m.job_id.clone()).collect(),
            ..CycleReport::default()
        };
        if !snapshot.excluded.is_empty() {
            warn!(
                jobs = ?snapshot.excluded,
                nodes = ?snapshot.contested_nodes,
                "skipping jobs on shared nodes"
            );
        }
        for bad in &snapshot.malformed {
            warn!(jid = %bad.job_id, error = %bad.error, "skipping job with malformed node range");
        }

        for record in &snapshot.jobs {
            if store.upsert_if_absent(record, now_ms)? {
                info!(jid = %record.jid, user = %record.user, nodes = record.nodes.len(), "job recorded");
                report.inserted.push(record.jid.clone());
            }
        }

        // A job moves at most one lifecycle step per cycle.
        let mut advanced = HashSet::<String>::new();

        report.finished = store.mark_finished_if_missing(&snapshot.observed, now_ms)?;
        for jid in &report.finished {
            info!(jid = %jid, "job finished");
            advanced.insert(jid.clone());
        }

        for job in store.select_by_phase(PhaseQuery::owing(Transition::MonitorStarted))? {
            if advanced.contains(&job.jid) {
                continue;
            }
            let _span = info_span!("start", jid = %job.jid).entered();
            let results = for_each_host(&job.nodes, self.settings.fanout, |host| {
                self.actuator.start(host, &job.user, &job.anonymized_job_id)
            });
            if !self.settle(&job, Transition::MonitorStarted, &results, store, now_ms, &mut report)? {
                continue;
            }
            advanced.insert(job.jid.clone());
            report.started.push(job.jid.clone());
            self.annotate_processes(&job, &results, store)?;
        }

        for job in store.select_by_phase(PhaseQuery::owing(Transition::MonitorStopped))? {
            if advanced.contains(&job.jid) {
                continue;
            }
            let _span = info_span!("stop", jid = %job.jid).entered();
            let results = for_each_host(&job.nodes, self.settings.fanout, |host| {
                self.actuator.stop(host)
            });
            if self.settle(&job, Transition::MonitorStopped, &results, store, now_ms, &mut report)? {
                advanced.insert(job.jid.clone());
                report.stopped.push(job.jid.clone());
            }
        }

        for job in store.select_by_phase(PhaseQuery::owing(Transition::LogsRetrieved))? {
            if advanced.contains(&job.jid) {
                continue;
            }
            let _span = info_span!("fetch", jid = %job.jid).entered();
            let results = for_each_host(&job.nodes, self.settings.fanout, |host| {
                self.actuator.fetch(host, &job.anonymized_job_id)
            });
            for (host, result) in &results {
                if let Ok(path) = result {
                    info!(host = %host, path = %path.display(), "artifact collected");
                }
            }
            if self.settle(&job, Transition::LogsRetrieved, &results, store, now_ms, &mut report)? {
                advanced.insert(job.jid.clone());
                report.fetched.push(job.jid.clone());
            }
        }

        Ok(report)
    }

    fn acknowledged<T>(
        &self,
        transition: Transition,
        results: &[(String, Result<T, ActuationError>)],
    ) -> bool {
        // A fetch that reached a host but failed still leaves its log behind.
        if self.settings.strict_actuation || transition == Transition::LogsRetrieved {
            results.iter().all(|(_, r)| r.is_ok())
        } else {
            results
                .iter()
                .all(|(_, r)| r.as_ref().err().is_none_or(|e| !e.is_unissued()))
        }
    }

    /// Logs per-host failures and applies `transition` when the actuation
    /// policy accepts `results`. Returns whether the job advanced.
    fn settle<T>(
        &self,
        job: &JobRecord,
        transition: Transition,
        results: &[(String, Result<T, ActuationError>)],
        store: &mut SqliteStore,
        now_ms: i64,
        report: &mut CycleReport,
    ) -> Result<bool, StoreError> {
        for (_, result) in results {
            if let Err(err) = result {
                warn!(action = transition.as_str(), error = %err, "remote actuation failed");
            }
        }
        if !self.acknowledged(transition, results) {
            warn!(action = transition.as_str(), "left owed for the next cycle");
            report.deferred.push((job.jid.clone(), transition));
            return Ok(false);
        }
        if !store.apply_transition(&job.jid, transition, now_ms)? {
            return Ok(false);
        }
        let next = transition.apply(job.phase()).unwrap_or(job.phase());
        info!(action = transition.as_str(), phase = %next, "job advanced");
        Ok(true)
    }

    /// Records which of the user's programs run on each host that accepted
    /// the monitor. Failures here never block the lifecycle.
    fn annotate_processes(
        &self,
        job: &JobRecord,
        started: &[(String, Result<(), ActuationError>)],
        store: &mut SqliteStore,
    ) -> Result<(), StoreError> {
        let hosts = started
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(host, _)| host.clone())
            .collect::<Vec<_>>();
        let listed = for_each_host(&hosts, self.settings.fanout, |host| {
            self.actuator.process_names(host, &job.user)
        });
        let mut fragment = String::new();
        for (host, result) in listed {
            match result {
                Ok(names) => fragment.push_str(&process_names_fragment(&host, &names)),
                Err(err) => warn!(error = %err, "process listing failed"),
            }
        }
        store.append_process_names(&job.jid, &fragment)
    }
}
