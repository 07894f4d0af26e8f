//! Orphan detection for the self-healing pass.
//!
//! A consumer identity is an orphan when no live connection announces its
//! name. Orphans holding pending entries get those entries claimed; orphans
//! that are empty and idle long enough get their registration deleted.

use crate::store::ConsumerInfo;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// What one cleanup pass saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Every consumer registered in the group
    pub consumer_names: Vec<String>,
    /// Consumers with at least one pending entry
    pub pending_consumer_names: Vec<String>,
    /// Consumers with nothing pending and idle past the deletion threshold
    pub empty_consumer_names: Vec<String>,
    /// Names announced by live connections
    pub active_workers: Vec<String>,
    /// Pending consumers without a live connection
    pub orphan_workers: Vec<String>,
    /// Empty consumers without a live connection
    pub orphan_empty_workers: Vec<String>,
    /// Entries claimed per orphan
    pub claim_info: BTreeMap<String, usize>,
    /// Orphans whose registration was deleted
    pub delete_info: Vec<String>,
}

impl CleanupReport {
    /// Partition the group's consumers against the live connection names.
    ///
    /// `idle_threshold` is the idle time an empty consumer must exceed before
    /// it is considered for deletion.
    pub fn plan(
        consumers: &[ConsumerInfo],
        live_names: &[String],
        idle_threshold: Duration,
    ) -> Self {
        let active: BTreeSet<&str> = live_names.iter().map(String::as_str).collect();

        let mut report = Self {
            active_workers: active.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };

        for consumer in consumers {
            report.consumer_names.push(consumer.name.clone());
            let orphan = !active.contains(consumer.name.as_str());

            if consumer.pending > 0 {
                report.pending_consumer_names.push(consumer.name.clone());
                if orphan {
                    report.orphan_workers.push(consumer.name.clone());
                }
            } else if consumer.idle > idle_threshold {
                report.empty_consumer_names.push(consumer.name.clone());
                if orphan {
                    report.orphan_empty_workers.push(consumer.name.clone());
                }
            }
        }

        report
    }

    /// Total number of entries claimed in this pass.
    pub fn claimed(&self) -> usize {
        self.claim_info.values().sum()
    }
}
