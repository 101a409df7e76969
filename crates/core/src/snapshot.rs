#![forbid(unsafe_code)]

use crate::artifact::Anonymizer;
use crate::exclusivity::{NodeOwner, filter_exclusive};
use crate::model::JobRecord;
use crate::nodes::{NodeRangeError, NodeRangeExpander};
use std::collections::BTreeSet;

/// One line of the scheduler's running-job listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerRow {
    pub job_id: String,
    pub user: String,
    pub state: String,
    pub node_range: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedRow {
    pub job_id: String,
    pub error: NodeRangeError,
}

/// A normalized view of one scheduler poll.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Running, exclusively-owned jobs in their created phase.
    pub jobs: Vec<JobRecord>,
    /// Every running job id the scheduler reported, admitted or not. Finish
    /// detection is keyed on this set, so a job that becomes contended or
    /// unparsable mid-life is not mistaken for a finished one.
    pub observed: BTreeSet<String>,
    pub excluded: Vec<String>,
    pub contested_nodes: BTreeSet<String>,
    pub malformed: Vec<MalformedRow>,
}

impl Snapshot {
    pub fn job_ids(&self) -> BTreeSet<&str> {
        self.jobs.iter().map(|job| job.jid.as_str()).collect()
    }
}

impl NodeOwner for JobRecord {
    fn owner_id(&self) -> &str {
        &self.jid
    }

    fn owned_nodes(&self) -> &[String] {
        &self.nodes
    }
}

#[derive(Clone, Debug)]
pub struct SnapshotBuilder {
    expander: NodeRangeExpander,
    anonymizer: Anonymizer,
}

impl SnapshotBuilder {
    pub fn new(expander: NodeRangeExpander, anonymizer: Anonymizer) -> Self {
        Self {
            expander,
            anonymizer,
        }
    }

    pub fn build(&self, rows: &[SchedulerRow]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        let mut candidates = Vec::<JobRecord>::new();

        for row in rows {
            if !row.state.eq_ignore_ascii_case("RUNNING") {
                continue;
            }
            // The listing should not repeat a job; if it does, the first line wins.
            if !snapshot.observed.insert(row.job_id.clone()) {
                continue;
            }
            match self.expander.expand(&row.node_range) {
                Ok(nodes) => candidates.push(JobRecord::observed(
                    row.job_id.clone(),
                    row.user.clone(),
                    nodes,
                    self.anonymizer.job_id(&row.job_id),
                )),
                Err(error) => snapshot.malformed.push(MalformedRow {
                    job_id: row.job_id.clone(),
                    error,
                }),
            }
        }

        let exclusivity = filter_exclusive(candidates);
        snapshot.excluded = exclusivity
            .excluded_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        snapshot.contested_nodes = exclusivity.contested_nodes;
        snapshot.jobs = exclusivity.retained;
        snapshot
    }
}
