#![forbid(unsafe_code)]

//! Monitoring is only meaningful when a job owns its nodes outright. Any node
//! listed by more than one job in the same snapshot is contested, and every job
//! touching a contested node is dropped from that snapshot.

use std::collections::{BTreeMap, BTreeSet};

pub trait NodeOwner {
    fn owner_id(&self) -> &str;
    fn owned_nodes(&self) -> &[String];
}

impl NodeOwner for (String, Vec<String>) {
    fn owner_id(&self) -> &str {
        &self.0
    }

    fn owned_nodes(&self) -> &[String] {
        &self.1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exclusivity<J> {
    pub retained: Vec<J>,
    pub excluded: Vec<J>,
    pub contested_nodes: BTreeSet<String>,
}

impl<J: NodeOwner> Exclusivity<J> {
    pub fn excluded_ids(&self) -> Vec<&str> {
        self.excluded.iter().map(NodeOwner::owner_id).collect()
    }
}

/// Splits `jobs` into exclusive and contended owners, preserving input order on
/// both sides. A node repeated inside one job's own list is not contention.
pub fn filter_exclusive<J: NodeOwner>(jobs: Vec<J>) -> Exclusivity<J> {
    let mut owners_per_node = BTreeMap::<&str, usize>::new();
    for job in &jobs {
        let distinct = job
            .owned_nodes()
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<_>>();
        for node in distinct {
            *owners_per_node.entry(node).or_default() += 1;
        }
    }

    let contested_nodes = owners_per_node
        .into_iter()
        .filter(|(_, owners)| *owners > 1)
        .map(|(node, _)| node.to_string())
        .collect::<BTreeSet<_>>();

    let (excluded, retained) = jobs.into_iter().partition::<Vec<_>, _>(|job| {
        job.owned_nodes()
            .iter()
            .any(|node| contested_nodes.contains(node))
    });

    Exclusivity {
        retained,
        excluded,
        contested_nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, nodes: &[&str]) -> (String, Vec<String>) {
        (
            id.to_string(),
            nodes.iter().map(|n| n.to_string()).collect(),
        )
    }

    #[test]
    fn overlapping_jobs_are_both_excluded() {
        let out = filter_exclusive(vec![
            job("A", &["n1", "n2"]),
            job("B", &["n2", "n3"]),
            job("C", &["n4"]),
        ]);
        assert_eq!(out.excluded_ids(), vec!["A", "B"]);
        assert_eq!(out.retained, vec![job("C", &["n4"])]);
        assert_eq!(
            out.contested_nodes,
            BTreeSet::from(["n2".to_string()])
        );
    }

    #[test]
    fn every_owner_of_a_contested_node_is_excluded() {
        let out = filter_exclusive(vec![
            job("A", &["n1"]),
            job("B", &["n1", "n5"]),
            job("C", &["n1"]),
            job("D", &["n5"]),
        ]);
        assert_eq!(out.excluded_ids(), vec!["A", "B", "C", "D"]);
        assert!(out.retained.is_empty());
    }

    #[test]
    fn lone_job_is_retained() {
        let out = filter_exclusive(vec![job("C", &["n4"])]);
        assert!(out.excluded.is_empty());
        assert!(out.contested_nodes.is_empty());
        assert_eq!(out.retained.len(), 1);
    }

    #[test]
    fn self_repeated_node_is_not_contention() {
        let out = filter_exclusive(vec![job("A", &["n1", "n1"]), job("B", &["n2"])]);
        assert!(out.excluded.is_empty());
    }
}
