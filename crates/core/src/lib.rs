#![forbid(unsafe_code)]

//! I/O-free reconciliation logic: node-range canonicalization, node exclusivity,
//! scheduler snapshot normalization and the job/monitor lifecycle model.

pub mod artifact;
pub mod exclusivity;
pub mod model;
pub mod nodes;
pub mod snapshot;

pub use artifact::{Anonymizer, artifact_file_name};
pub use exclusivity::{Exclusivity, NodeOwner, filter_exclusive};
pub use model::{
    JobRecord, JobState, MonitorState, ParseStateError, Phase, RetrievalState, Stamp, Transition,
};
pub use nodes::{DEFAULT_INDEX_WIDTH, NodeRangeError, NodeRangeExpander};
pub use snapshot::{MalformedRow, SchedulerRow, Snapshot, SnapshotBuilder};
