//! One-shot migration from the legacy storage layout.
//!
//! Old installs keep their maps in a per-country multi-file layout; the
//! current layout is one file per region. Migration downloads the
//! current-layout file set once, prefetching the region nearest the
//! device's last known location first so the user keeps a usable map
//! while the rest converts.
//!
//! The controller is an explicitly constructed, dependency-injected
//! instance with a single-owner lifecycle (created at process start,
//! torn down at shutdown), not an ambient global, so tests can build as
//! many independent ones as they like. It models a single active UI
//! surface: at most one observer may be attached, and attaching twice
//! is a programmer error that fails fast.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::coord::LatLon;
use crate::error::MigrationError;
use crate::region::RegionTree;
use crate::storage::FreeSpace;

/// Migration lifecycle states.
///
/// `NotNecessary` is terminal: either this install never used the
/// legacy layout, or migration already completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    NotNecessary,
    Ready,
    InProgress,
    Error(MigrationError),
}

/// The single attachable UI surface.
pub trait MigrationContainer: Send + Sync {
    fn on_progress(&self, percent: u8);
    fn on_error(&self, error: &MigrationError);
    fn on_complete(&self);
}

/// The transfer layer driven by the controller. `begin` receives the
/// id of the region to fetch first.
///
/// `abort` is fire-and-forget: the controller's own state transition
/// never waits for the underlying I/O to actually stop.
pub trait MigrationTransfer: Send + Sync {
    fn begin(&self, prefetch_region: Option<&str>, keep_old_data: bool);
    fn abort(&self);
}

/// Construction preconditions.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Whether the install still runs the legacy layout.
    pub legacy_mode: bool,
    /// Free bytes required before migration may start.
    pub required_bytes: u64,
}

/// The migration state machine. At most one migration is in progress
/// per process; this is enforced by the single-owner lifecycle, not by
/// hidden global state.
pub struct MigrationController {
    legacy_mode: bool,
    required_bytes: u64,
    state: MigrationState,
    progress_percent: u8,
    prefetch_region: Option<String>,
    transfer: Arc<dyn MigrationTransfer>,
    container: Option<Arc<dyn MigrationContainer>>,
}

impl MigrationController {
    /// Evaluates the preconditions and fixes the starting state:
    /// legacy mode off means permanently `NotNecessary`; legacy mode on
    /// without enough free space starts at `Error(OutOfMemory)`.
    pub fn new(
        config: MigrationConfig,
        free_space: &dyn FreeSpace,
        maps_dir: &Path,
        transfer: Arc<dyn MigrationTransfer>,
    ) -> Self {
        let state = if !config.legacy_mode {
            MigrationState::NotNecessary
        } else {
            match free_space.free_bytes(maps_dir) {
                Ok(free) if free >= config.required_bytes => MigrationState::Ready,
                Ok(free) => {
                    warn!(free, required = config.required_bytes, "not enough space for migration");
                    MigrationState::Error(MigrationError::OutOfMemory)
                }
                Err(e) => {
                    warn!(error = %e, "free-space probe failed");
                    MigrationState::Error(MigrationError::Other(e.to_string()))
                }
            }
        };
        Self {
            legacy_mode: config.legacy_mode,
            required_bytes: config.required_bytes,
            state,
            progress_percent: 0,
            prefetch_region: None,
            transfer,
            container: None,
        }
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    /// Region chosen for prefetch on the last `start`, if any.
    pub fn prefetch_region(&self) -> Option<&str> {
        self.prefetch_region.as_deref()
    }

    /// Whether this install still needs to migrate.
    pub fn is_pending(&self) -> bool {
        self.state != MigrationState::NotNecessary
    }

    /// Whether the install still runs the legacy layout. Flips off
    /// once migration completes.
    pub fn is_legacy_mode_active(&self) -> bool {
        self.legacy_mode
    }

    /// Re-probes free space against the configured requirement. A
    /// failed probe counts as no space.
    pub fn has_space_for_migration(&self, free_space: &dyn FreeSpace, maps_dir: &Path) -> bool {
        free_space
            .free_bytes(maps_dir)
            .is_ok_and(|free| free >= self.required_bytes)
    }

    /// Attaches the single observer. Panics when one is already
    /// attached: two live UI surfaces for one migration is a bug, not a
    /// condition to limp through.
    pub fn attach(&mut self, container: Arc<dyn MigrationContainer>) {
        assert!(
            self.container.is_none(),
            "migration container already attached"
        );
        self.container = Some(container);
    }

    pub fn detach(&mut self) {
        self.container = None;
    }

    /// Begins migrating. Picks the prefetch region nearest the last
    /// known location (null island when unknown) and hands off to the
    /// transfer layer. A no-op unless the state is `Ready`; in
    /// particular, calling `start` again mid-migration or from an error
    /// state changes nothing.
    ///
    /// Returns the display name of the prefetch region, when one was
    /// selected.
    pub fn start(
        &mut self,
        tree: &RegionTree,
        last_location: Option<LatLon>,
        keep_old_data: bool,
    ) -> Option<String> {
        if self.state != MigrationState::Ready {
            warn!(state = ?self.state, "migration start ignored");
            return None;
        }

        let position = last_location.unwrap_or(LatLon::ZERO);
        let node = tree.nearest_leaf(position);
        let prefetch_id = node.map(|n| n.id.clone());
        let prefetch_name = node.map(|n| n.name.clone());
        self.prefetch_region = prefetch_name.clone();
        self.state = MigrationState::InProgress;
        self.progress_percent = 0;
        info!(prefetch = ?prefetch_id, keep_old_data, "migration started");

        self.transfer.begin(prefetch_id.as_deref(), keep_old_data);
        prefetch_name
    }

    /// Progress callback from the transfer layer.
    pub fn on_progress(&mut self, percent: u8) {
        if self.state != MigrationState::InProgress {
            return;
        }
        self.progress_percent = percent.min(100);
        if let Some(container) = &self.container {
            container.on_progress(self.progress_percent);
        }
    }

    /// Failure callback. The error blocks all further progress until
    /// resolved or cancelled; there is no partially-migrated state.
    pub fn on_error(&mut self, error: MigrationError) {
        warn!(%error, "migration failed");
        self.state = MigrationState::Error(error.clone());
        if let Some(container) = &self.container {
            container.on_error(&error);
        }
    }

    /// Completion callback. Migration is one-shot for the lifetime of
    /// the install; the state becomes `NotNecessary` permanently.
    pub fn on_complete(&mut self) {
        info!("migration complete");
        self.state = MigrationState::NotNecessary;
        self.legacy_mode = false;
        self.progress_percent = 100;
        if let Some(container) = &self.container {
            container.on_complete();
        }
    }

    /// Cancels an in-progress migration. The controller returns to
    /// `Ready` immediately; the abort signal to the transfer layer is
    /// fire-and-forget.
    pub fn cancel(&mut self) {
        if self.state != MigrationState::InProgress {
            return;
        }
        self.state = MigrationState::Ready;
        self.progress_percent = 0;
        self.transfer.abort();
        info!("migration cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Rect;
    use crate::region::RegionSpec;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSpace(u64);

    impl FreeSpace for FixedSpace {
        fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct FakeTransfer {
        begun: Mutex<Vec<(Option<String>, bool)>>,
        aborts: AtomicUsize,
    }

    impl MigrationTransfer for FakeTransfer {
        fn begin(&self, prefetch_region: Option<&str>, keep_old_data: bool) {
            self.begun
                .lock()
                .push((prefetch_region.map(str::to_string), keep_old_data));
        }
        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tree() -> RegionTree {
        RegionTree::build(vec![
            RegionSpec::leaf("France", None, 1000, Rect::new(41.0, 51.0, -5.0, 9.0), 2),
            RegionSpec::leaf("Spain", None, 800, Rect::new(36.0, 43.0, -9.5, 3.5), 2),
        ])
        .unwrap()
    }

    fn controller(legacy: bool, free: u64) -> (Arc<FakeTransfer>, MigrationController) {
        let transfer = Arc::new(FakeTransfer::default());
        let controller = MigrationController::new(
            MigrationConfig {
                legacy_mode: legacy,
                required_bytes: 1_000_000,
            },
            &FixedSpace(free),
            Path::new("/tmp/maps"),
            transfer.clone(),
        );
        (transfer, controller)
    }

    struct Recorder {
        progress: Mutex<Vec<u8>>,
        errors: Mutex<Vec<MigrationError>>,
        completions: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                progress: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                completions: AtomicUsize::new(0),
            })
        }
    }

    impl MigrationContainer for Recorder {
        fn on_progress(&self, percent: u8) {
            self.progress.lock().push(percent);
        }
        fn on_error(&self, error: &MigrationError) {
            self.errors.lock().push(error.clone());
        }
        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_legacy_off_is_permanently_not_necessary() {
        let (transfer, mut controller) = controller(false, u64::MAX);
        assert_eq!(*controller.state(), MigrationState::NotNecessary);
        assert!(controller.start(&tree(), None, false).is_none());
        assert!(transfer.begun.lock().is_empty());
    }

    #[test]
    fn test_no_space_starts_in_error_and_start_is_noop() {
        // The worked example: legacy on, no space => Error(OutOfMemory),
        // and start() leaves the state alone.
        let (transfer, mut controller) = controller(true, 0);
        assert_eq!(
            *controller.state(),
            MigrationState::Error(MigrationError::OutOfMemory)
        );
        assert!(controller.start(&tree(), None, true).is_none());
        assert_eq!(
            *controller.state(),
            MigrationState::Error(MigrationError::OutOfMemory)
        );
        assert!(transfer.begun.lock().is_empty());
    }

    #[test]
    fn test_start_selects_nearest_region_and_reports_progress() {
        let (transfer, mut controller) = controller(true, u64::MAX);
        let observer = Recorder::new();
        controller.attach(observer.clone());

        let name = controller.start(&tree(), Some(LatLon::new(48.8, 2.3)), true);
        assert_eq!(name.as_deref(), Some("France"));
        assert_eq!(*controller.state(), MigrationState::InProgress);
        assert_eq!(
            transfer.begun.lock().as_slice(),
            [(Some("France".to_string()), true)]
        );

        // A second start mid-migration is a no-op.
        assert!(controller.start(&tree(), None, false).is_none());
        assert_eq!(transfer.begun.lock().len(), 1);

        controller.on_progress(40);
        controller.on_progress(250); // clamped
        assert_eq!(observer.progress.lock().as_slice(), [40, 100]);

        controller.on_complete();
        assert_eq!(*controller.state(), MigrationState::NotNecessary);
        assert_eq!(observer.completions.load(Ordering::SeqCst), 1);

        // One-shot: never startable again.
        assert!(controller.start(&tree(), None, false).is_none());
    }

    #[test]
    fn test_precondition_queries_reflect_config_and_space() {
        let (_t1, legacy) = controller(true, u64::MAX);
        assert!(legacy.is_legacy_mode_active());
        assert!(legacy.has_space_for_migration(&FixedSpace(2_000_000), Path::new("/tmp/maps")));
        assert!(!legacy.has_space_for_migration(&FixedSpace(10), Path::new("/tmp/maps")));

        let (_t2, clean) = controller(false, u64::MAX);
        assert!(!clean.is_legacy_mode_active());
    }

    #[test]
    fn test_completion_clears_legacy_mode() {
        let (_transfer, mut migrating) = controller(true, u64::MAX);
        migrating.start(&tree(), None, false);
        migrating.on_complete();
        assert!(!migrating.is_legacy_mode_active());
        assert!(!migrating.is_pending());
    }

    #[test]
    fn test_unknown_location_falls_back_to_null_island() {
        let (_transfer, mut controller) = controller(true, u64::MAX);
        // Nearest leaf to (0,0) in the fixture is Spain.
        let name = controller.start(&tree(), None, false);
        assert_eq!(name.as_deref(), Some("Spain"));
    }

    #[test]
    fn test_cancel_returns_to_ready_and_aborts_transfer() {
        let (transfer, mut controller) = controller(true, u64::MAX);
        controller.start(&tree(), None, false);
        controller.on_progress(30);

        controller.cancel();
        assert_eq!(*controller.state(), MigrationState::Ready);
        assert_eq!(controller.progress_percent(), 0);
        assert_eq!(transfer.aborts.load(Ordering::SeqCst), 1);

        // Cancel outside InProgress does nothing.
        controller.cancel();
        assert_eq!(transfer.aborts.load(Ordering::SeqCst), 1);

        // Ready again: a new start works.
        assert!(controller.start(&tree(), None, false).is_some());
    }

    #[test]
    fn test_error_callback_classifies_and_notifies() {
        let (_transfer, mut controller) = controller(true, u64::MAX);
        let observer = Recorder::new();
        controller.attach(observer.clone());
        controller.start(&tree(), None, false);

        controller.on_error(MigrationError::NoInternet);
        assert_eq!(
            *controller.state(),
            MigrationState::Error(MigrationError::NoInternet)
        );
        assert_eq!(
            observer.errors.lock().as_slice(),
            [MigrationError::NoInternet]
        );
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_double_attach_fails_fast() {
        let (_transfer, mut controller) = controller(true, u64::MAX);
        controller.attach(Recorder::new());
        controller.attach(Recorder::new());
    }

    #[test]
    fn test_detach_then_attach_is_fine() {
        let (_transfer, mut controller) = controller(true, u64::MAX);
        controller.attach(Recorder::new());
        controller.detach();
        controller.attach(Recorder::new());
    }
}
