#![forbid(unsafe_code)]

//! Job / monitor / log-retrieval lifecycle.
//!
//! Every state enum is monotonic and the only way to move a record forward is a
//! [`Transition`], whose guard names the exact phase it may be applied to.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseStateError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    Running,
    Finished,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
        }
    }
}

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "RUNNING" => Ok(JobState::Running),
            "FINISHED" => Ok(JobState::Finished),
            other => Err(ParseStateError {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MonitorState {
    Pending,
    Running,
    Completed,
}

impl MonitorState {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorState::Pending => "PENDING",
            MonitorState::Running => "RUNNING",
            MonitorState::Completed => "COMPLETED",
        }
    }
}

impl FromStr for MonitorState {
    type Err = ParseStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(MonitorState::Pending),
            "RUNNING" => Ok(MonitorState::Running),
            "COMPLETED" => Ok(MonitorState::Completed),
            other => Err(ParseStateError {
                kind: "monitor state",
                value: other.to_string(),
            }),
        }
    }
}

/// Log retrieval is not owed until a monitor has been launched; that state is
/// stored as SQL `NULL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetrievalState {
    NotDue,
    Pending,
    Completed,
}

impl RetrievalState {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalState::NotDue => "NULL",
            RetrievalState::Pending => "PENDING",
            RetrievalState::Completed => "COMPLETED",
        }
    }

    pub fn as_column(self) -> Option<&'static str> {
        match self {
            RetrievalState::NotDue => None,
            other => Some(other.as_str()),
        }
    }

    pub fn from_column(value: Option<&str>) -> Result<Self, ParseStateError> {
        match value {
            None => Ok(RetrievalState::NotDue),
            Some("PENDING") => Ok(RetrievalState::Pending),
            Some("COMPLETED") => Ok(RetrievalState::Completed),
            Some(other) => Err(ParseStateError {
                kind: "retrieval state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Phase {
    pub job: JobState,
    pub monitor: MonitorState,
    pub retrieval: RetrievalState,
}

impl Phase {
    pub const CREATED: Phase = Phase {
        job: JobState::Running,
        monitor: MonitorState::Pending,
        retrieval: RetrievalState::NotDue,
    };

    pub fn is_terminal(&self) -> bool {
        self.job == JobState::Finished
            && self.monitor == MonitorState::Completed
            && self.retrieval == RetrievalState::Completed
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.job.as_str(),
            self.monitor.as_str(),
            self.retrieval.as_str()
        )
    }
}

/// Which timestamp a transition stamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stamp {
    JobEnd,
    MonitorStart,
    MonitorEnd,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    /// The job vanished from a fresh scheduler snapshot.
    JobFinished,
    /// The monitor was launched on every node.
    MonitorStarted,
    /// The monitor was stopped on every node.
    MonitorStopped,
    /// Logs were pulled from every node.
    LogsRetrieved,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::JobFinished => "job_finished",
            Transition::MonitorStarted => "monitor_started",
            Transition::MonitorStopped => "monitor_stopped",
            Transition::LogsRetrieved => "logs_retrieved",
        }
    }

    /// Phase constraints the record must satisfy. `None` means "any".
    pub fn guard(
        self,
    ) -> (
        Option<JobState>,
        Option<MonitorState>,
        Option<RetrievalState>,
    ) {
        match self {
            Transition::JobFinished => (Some(JobState::Running), None, None),
            Transition::MonitorStarted => (
                Some(JobState::Running),
                Some(MonitorState::Pending),
                None,
            ),
            Transition::MonitorStopped => (
                Some(JobState::Finished),
                Some(MonitorState::Running),
                None,
            ),
            Transition::LogsRetrieved => (
                None,
                Some(MonitorState::Completed),
                Some(RetrievalState::Pending),
            ),
        }
    }

    pub fn permits(self, phase: Phase) -> bool {
        let (job, monitor, retrieval) = self.guard();
        job.is_none_or(|s| s == phase.job)
            && monitor.is_none_or(|s| s == phase.monitor)
            && retrieval.is_none_or(|s| s == phase.retrieval)
    }

    /// The phase after applying this transition, or `None` if the guard fails.
    pub fn apply(self, phase: Phase) -> Option<Phase> {
        if !self.permits(phase) {
            return None;
        }
        let mut next = phase;
        match self {
            Transition::JobFinished => next.job = JobState::Finished,
            Transition::MonitorStarted => {
                next.monitor = MonitorState::Running;
                next.retrieval = RetrievalState::Pending;
            }
            Transition::MonitorStopped => next.monitor = MonitorState::Completed,
            Transition::LogsRetrieved => next.retrieval = RetrievalState::Completed,
        }
        Some(next)
    }

    pub fn stamp(self) -> Stamp {
        match self {
            Transition::JobFinished => Stamp::JobEnd,
            Transition::MonitorStarted => Stamp::MonitorStart,
            Transition::MonitorStopped => Stamp::MonitorEnd,
            Transition::LogsRetrieved => Stamp::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub jid: String,
    pub user: String,
    pub job_state: JobState,
    pub nodes: Vec<String>,
    pub monitor_state: MonitorState,
    pub retrieval_state: RetrievalState,
    pub job_start_ms: Option<i64>,
    pub monitor_start_ms: Option<i64>,
    pub job_end_ms: Option<i64>,
    pub monitor_end_ms: Option<i64>,
    pub process_names: String,
    pub anonymized_job_id: String,
}

impl JobRecord {
    /// A freshly observed job: running, monitor pending, no timestamps.
    pub fn observed(
        jid: impl Into<String>,
        user: impl Into<String>,
        nodes: Vec<String>,
        anonymized_job_id: impl Into<String>,
    ) -> Self {
        Self {
            jid: jid.into(),
            user: user.into(),
            job_state: Phase::CREATED.job,
            nodes,
            monitor_state: Phase::CREATED.monitor,
            retrieval_state: Phase::CREATED.retrieval,
            job_start_ms: None,
            monitor_start_ms: None,
            job_end_ms: None,
            monitor_end_ms: None,
            process_names: String::new(),
            anonymized_job_id: anonymized_job_id.into(),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase {
            job: self.job_state,
            monitor: self.monitor_state,
            retrieval: self.retrieval_state,
        }
    }
}
