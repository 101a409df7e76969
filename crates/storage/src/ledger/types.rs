#![forbid(unsafe_code)]

use nw_core::{JobState, MonitorState, RetrievalState, Transition};

/// Phase predicate for [`crate::SqliteStore::select_by_phase`]. `None` fields
/// match any value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseQuery {
    pub job: Option<JobState>,
    pub monitor: Option<MonitorState>,
    pub retrieval: Option<RetrievalState>,
}

impl PhaseQuery {
    /// Records a transition may currently be applied to.
    pub fn owing(transition: Transition) -> Self {
        let (job, monitor, retrieval) = transition.guard();
        Self {
            job,
            monitor,
            retrieval,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobsListRequest {
    pub limit: usize,
}
