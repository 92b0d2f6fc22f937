//! The per-region download status machine and aggregate derivation.

/// Download status of a region.
///
/// Leaves move along the edges validated by [`RegionStatus::can_become`];
/// `Mixed` never appears on a leaf; it is the aggregate answer for a
/// non-leaf whose descendants disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionStatus {
    /// Not on disk, no active job. Partial bytes may exist for resume.
    Downloadable,
    /// A job exists but is queued behind the worker-pool bound.
    Enqueued,
    /// Bytes are moving.
    InProgress,
    /// Fully downloaded and current.
    Done,
    /// The last attempt failed; retry resumes from the confirmed offset.
    Failed,
    /// On disk, but the region list advertises a newer data version.
    Updatable,
    /// Aggregate-only: descendants have heterogeneous statuses.
    Mixed,
}

impl RegionStatus {
    /// Short stable name for logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionStatus::Downloadable => "downloadable",
            RegionStatus::Enqueued => "enqueued",
            RegionStatus::InProgress => "in-progress",
            RegionStatus::Done => "done",
            RegionStatus::Failed => "failed",
            RegionStatus::Updatable => "updatable",
            RegionStatus::Mixed => "mixed",
        }
    }

    /// Whether a job is live for this status (queued or transferring).
    pub fn is_active(&self) -> bool {
        matches!(self, RegionStatus::Enqueued | RegionStatus::InProgress)
    }

    /// Whether a finished file is on disk.
    pub fn is_on_disk(&self) -> bool {
        matches!(self, RegionStatus::Done | RegionStatus::Updatable)
    }

    /// Validates a leaf status transition.
    ///
    /// Every edge here matches a command or scheduler outcome; anything
    /// else is a programming error upstream and is rejected so that
    /// observers never see an invalid edge (`Failed → Done` and the
    /// like).
    pub fn can_become(&self, next: RegionStatus) -> bool {
        use RegionStatus::*;
        matches!(
            (self, next),
            (Downloadable, Enqueued)
                | (Enqueued, InProgress)
                | (Enqueued, Downloadable)   // cancel before a worker picked it up
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Downloadable) // cancel keeps partial bytes
                | (Failed, Enqueued)         // retry
                | (Failed, Downloadable)     // delete partial
                | (Done, Updatable)          // newer remote version detected
                | (Done, Downloadable)       // delete
                | (Updatable, Enqueued)      // update
                | (Updatable, Downloadable)  // delete
        )
    }
}

impl std::fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives a non-leaf region's status from its leaf descendants.
///
/// Precedence: `InProgress` beats `Enqueued` (display shows activity),
/// activity beats `Failed`, and `Failed` beats everything settled. With
/// nothing active and nothing failed, a uniform set keeps its status and
/// a non-uniform set is `Mixed`. An empty set is `Downloadable`.
pub fn aggregate_status<I>(leaves: I) -> RegionStatus
where
    I: IntoIterator<Item = RegionStatus>,
{
    let mut any_enqueued = false;
    let mut any_failed = false;
    let mut uniform: Option<RegionStatus> = None;
    let mut mixed = false;

    for status in leaves {
        match status {
            RegionStatus::InProgress => return RegionStatus::InProgress,
            RegionStatus::Enqueued => any_enqueued = true,
            RegionStatus::Failed => any_failed = true,
            other => match uniform {
                None => uniform = Some(other),
                Some(seen) if seen == other => {}
                Some(_) => mixed = true,
            },
        }
    }

    if any_enqueued {
        RegionStatus::Enqueued
    } else if any_failed {
        RegionStatus::Failed
    } else if mixed {
        RegionStatus::Mixed
    } else {
        uniform.unwrap_or(RegionStatus::Downloadable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use RegionStatus::*;

    #[test]
    fn test_valid_edges_accepted() {
        assert!(Downloadable.can_become(Enqueued));
        assert!(Enqueued.can_become(InProgress));
        assert!(InProgress.can_become(Done));
        assert!(InProgress.can_become(Downloadable));
        assert!(InProgress.can_become(Failed));
        assert!(Failed.can_become(Enqueued));
        assert!(Done.can_become(Updatable));
        assert!(Updatable.can_become(Enqueued));
        assert!(Done.can_become(Downloadable));
    }

    #[test]
    fn test_invalid_edges_rejected() {
        assert!(!Failed.can_become(Done));
        assert!(!Downloadable.can_become(Done));
        assert!(!Downloadable.can_become(InProgress));
        assert!(!Done.can_become(Failed));
        assert!(!Enqueued.can_become(Done));
        assert!(!Mixed.can_become(Done));
    }

    #[test]
    fn test_aggregate_all_done_is_done() {
        assert_eq!(aggregate_status([Done, Done, Done]), Done);
    }

    #[test]
    fn test_aggregate_any_failed_none_active_is_failed() {
        // The worked example: {Done, Done, Failed} => Failed.
        assert_eq!(aggregate_status([Done, Done, Failed]), Failed);
    }

    #[test]
    fn test_aggregate_activity_beats_failure() {
        assert_eq!(aggregate_status([Failed, Enqueued, Done]), Enqueued);
        assert_eq!(aggregate_status([Failed, InProgress, Done]), InProgress);
    }

    #[test]
    fn test_aggregate_in_progress_beats_enqueued() {
        assert_eq!(aggregate_status([Enqueued, InProgress]), InProgress);
    }

    #[test]
    fn test_aggregate_heterogeneous_settled_is_mixed() {
        assert_eq!(aggregate_status([Done, Downloadable]), Mixed);
        assert_eq!(aggregate_status([Updatable, Done]), Mixed);
    }

    #[test]
    fn test_aggregate_uniform_settled_keeps_status() {
        assert_eq!(aggregate_status([Downloadable, Downloadable]), Downloadable);
        assert_eq!(aggregate_status([Updatable, Updatable]), Updatable);
    }

    #[test]
    fn test_aggregate_empty_is_downloadable() {
        assert_eq!(aggregate_status([]), Downloadable);
    }

    fn leaf_status() -> impl Strategy<Value = RegionStatus> {
        prop_oneof![
            Just(Downloadable),
            Just(Enqueued),
            Just(InProgress),
            Just(Done),
            Just(Failed),
            Just(Updatable),
        ]
    }

    proptest! {
        /// Mixed appears iff settled statuses are non-uniform and no
        /// activity/failure takes precedence.
        #[test]
        fn prop_mixed_iff_nonuniform_settled(leaves in prop::collection::vec(leaf_status(), 1..12)) {
            let agg = aggregate_status(leaves.iter().copied());

            let any_active = leaves.iter().any(|s| s.is_active());
            let any_failed = leaves.contains(&Failed);
            let settled: Vec<_> = leaves
                .iter()
                .filter(|s| !s.is_active() && **s != Failed)
                .collect();
            let uniform = settled.windows(2).all(|w| w[0] == w[1]);

            if any_active || any_failed {
                prop_assert_ne!(agg, Mixed);
            } else {
                prop_assert_eq!(agg == Mixed, !uniform);
            }
        }

        /// The aggregate is never an invalid leaf-only artifact: with any
        /// InProgress leaf the aggregate is InProgress, with none but some
        /// Enqueued it is Enqueued.
        #[test]
        fn prop_activity_precedence(leaves in prop::collection::vec(leaf_status(), 1..12)) {
            let agg = aggregate_status(leaves.iter().copied());
            if leaves.contains(&InProgress) {
                prop_assert_eq!(agg, InProgress);
            } else if leaves.contains(&Enqueued) {
                prop_assert_eq!(agg, Enqueued);
            } else if leaves.contains(&Failed) {
                prop_assert_eq!(agg, Failed);
            }
        }
    }
}
