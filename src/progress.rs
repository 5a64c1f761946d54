//! Node operation progress accounting.
//!
//! Node agents report progress as a simple counter record. The coordinator
//! merges the per-node records into one cluster-wide view which is what the
//! status API serves for backup and restore operations.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub handled: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(rename = "final", default)]
    pub final_: bool,
}

impl Progress {
    pub fn finished_successfully(&self) -> bool {
        self.final_ && self.failed == 0
    }

    pub fn finished_failed(&self) -> bool {
        self.final_ && self.failed > 0
    }

    /// Merge per-node progress records into a cluster-wide record.
    ///
    /// Counters are summed; the merged record is final only once every
    /// input record is final. Merging nothing yields a final record so
    /// that an operation with no participating nodes terminates.
    pub fn merge<'a, I: IntoIterator<Item = &'a Progress>>(iter: I) -> Progress {
        let mut merged = Progress { final_: true, ..Default::default() };
        for progress in iter {
            merged.handled += progress.handled;
            merged.failed += progress.failed;
            merged.total += progress.total;
            merged.final_ = merged.final_ && progress.final_;
        }
        merged
    }
}
