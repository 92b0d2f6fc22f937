//! The authoritative region state model and command surface.
//!
//! `MapStorage` lives on the coordination context: commands come in from
//! the UI, transfer events come back from the scheduler over a channel,
//! and every state mutation flows through here. The struct itself holds
//! no locks; concurrency ends at the channel boundary, which is what
//! lets the state machine stay a plain `HashMap`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::item::{Category, RegionItem, UpdateInfo};
use super::status::{aggregate_status, RegionStatus};
use super::tree::{RegionNode, RegionTree};
use crate::bus::{SlotId, StorageObserver, SubscriptionBus};
use crate::coord::LatLon;
use crate::error::{CommandError, DownloadError};
use crate::storage::MapFilesStore;

/// Default User-Agent for map-file requests.
pub const DEFAULT_USER_AGENT: &str = concat!("mapstore/", env!("CARGO_PKG_VERSION"));

/// Settings for building map-file URLs and requests.
#[derive(Debug, Clone)]
pub struct MapStorageConfig {
    /// Base URL of the map-file server, without trailing slash.
    pub base_url: String,
    /// User-Agent sent with every transfer.
    pub user_agent: String,
}

impl MapStorageConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// One logical "download this region's file" request handed to the
/// transfer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub region_id: String,
    pub url: String,
    /// Remote size when the region list knows it; integrity check.
    pub expected_total_size: Option<u64>,
    /// Byte offset to resume from (current partial-file size).
    pub resume_offset: u64,
}

/// Seam between the model and the transfer layer.
///
/// The production implementation is the scheduler; tests substitute a
/// recording fake.
pub trait TransferBackend: Send + Sync {
    /// Starts (or queues) a transfer. Idempotent per target URL.
    fn enqueue(&self, request: TransferRequest);

    /// Cooperatively cancels the region's transfer, keeping the partial
    /// file.
    fn cancel(&self, region_id: &str);
}

/// Transfer-layer events applied to the model, in order, on the
/// coordination context.
#[derive(Debug)]
pub enum StorageEvent {
    /// A worker picked the job up; bytes are about to move.
    Started { region_id: String },
    /// Buffer-granularity byte progress.
    Progress {
        region_id: String,
        bytes_local: u64,
        bytes_total: u64,
    },
    /// The final byte hit the partial file.
    Completed { region_id: String },
    /// Terminal failure; the partial file is retained for retry.
    Failed {
        region_id: String,
        error: DownloadError,
    },
    /// The cancel took effect in the transfer layer.
    Cancelled { region_id: String },
}

impl StorageEvent {
    pub fn region_id(&self) -> &str {
        match self {
            StorageEvent::Started { region_id }
            | StorageEvent::Progress { region_id, .. }
            | StorageEvent::Completed { region_id }
            | StorageEvent::Failed { region_id, .. }
            | StorageEvent::Cancelled { region_id } => region_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LeafState {
    status: RegionStatus,
    downloaded_bytes: u64,
    /// A cancelled job still owes its terminal event; stale progress
    /// from it is ignored until that event lands.
    draining: bool,
}

/// The region model. See the module docs for the threading contract.
pub struct MapStorage {
    tree: RegionTree,
    store: MapFilesStore,
    config: MapStorageConfig,
    backend: Arc<dyn TransferBackend>,
    bus: SubscriptionBus,
    states: HashMap<String, LeafState>,
    last_location: Option<LatLon>,
}

impl MapStorage {
    /// Builds the model, recovering leaf states from the on-disk file
    /// set: finished files are `Done` (or `Updatable` when the region
    /// list advertises a newer version), partial files keep their byte
    /// count as the resume anchor.
    pub fn new(
        tree: RegionTree,
        store: MapFilesStore,
        config: MapStorageConfig,
        backend: Arc<dyn TransferBackend>,
    ) -> Self {
        let mut states = HashMap::new();
        for root in tree.children(None) {
            for leaf in tree.leaf_descendants(&root.id) {
                let state = if store.has_map(&leaf.id) {
                    let stale = store
                        .local_version(&leaf.id)
                        .is_none_or(|v| v < leaf.remote_version);
                    LeafState {
                        status: if stale {
                            RegionStatus::Updatable
                        } else {
                            RegionStatus::Done
                        },
                        downloaded_bytes: leaf.size_bytes,
                        draining: false,
                    }
                } else {
                    LeafState {
                        status: RegionStatus::Downloadable,
                        downloaded_bytes: store.partial_size(&leaf.id).min(leaf.size_bytes),
                        draining: false,
                    }
                };
                states.insert(leaf.id.clone(), state);
            }
        }
        info!(regions = states.len(), "map storage initialized");
        Self {
            tree,
            store,
            config,
            backend,
            bus: SubscriptionBus::new(),
            states,
            last_location: None,
        }
    }

    /// Last known device location, used for the NearMe category and
    /// migration prefetch.
    pub fn set_last_location(&mut self, location: LatLon) {
        self.last_location = Some(location);
    }

    pub fn tree(&self) -> &RegionTree {
        &self.tree
    }

    pub fn files(&self) -> &MapFilesStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Subscription surface
    // ------------------------------------------------------------------

    pub fn subscribe(&self, observer: Arc<dyn StorageObserver>) -> SlotId {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe(&self, slot: SlotId) {
        self.bus.unsubscribe(slot)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current status; derived for non-leaf regions.
    pub fn status_of(&self, region_id: &str) -> Result<RegionStatus, CommandError> {
        if !self.tree.contains(region_id) {
            return Err(CommandError::UnknownRegion(region_id.to_string()));
        }
        if let Some(state) = self.states.get(region_id) {
            return Ok(state.status);
        }
        Ok(aggregate_status(
            self.tree
                .leaf_descendants(region_id)
                .iter()
                .map(|leaf| self.states[&leaf.id].status),
        ))
    }

    /// Direct children of `parent` (roots for `None`), materialized.
    pub fn list_items(&self, parent: Option<&str>) -> Result<Vec<RegionItem>, CommandError> {
        if let Some(id) = parent {
            if !self.tree.contains(id) {
                return Err(CommandError::UnknownRegion(id.to_string()));
            }
        }
        Ok(self
            .tree
            .children(parent)
            .into_iter()
            .map(|node| self.materialize(node))
            .collect())
    }

    /// Summary of updatable regions, `None` when everything is current.
    pub fn get_update_info(&self) -> Option<UpdateInfo> {
        let mut info = UpdateInfo {
            file_count: 0,
            total_size_bytes: 0,
        };
        for root in self.tree.children(None) {
            for leaf in self.tree.leaf_descendants(&root.id) {
                if self.states[&leaf.id].status == RegionStatus::Updatable {
                    info.file_count += 1;
                    info.total_size_bytes += leaf.size_bytes;
                }
            }
        }
        (info.file_count > 0).then_some(info)
    }

    /// Leaf region covering the given location, if any.
    pub fn find_region_by_location(&self, lat: f64, lon: f64) -> Option<String> {
        self.tree
            .find_by_location(LatLon::new(lat, lon))
            .map(|n| n.id.clone())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Starts downloading a region (all downloadable leaves of a
    /// group). A second download of an already-active region is a
    /// no-op, not an error.
    pub fn download(&mut self, region_id: &str) -> Result<(), CommandError> {
        self.start_transfer(region_id, "download", RegionStatus::Downloadable, true)
    }

    /// Re-downloads a region whose data version is out of date.
    pub fn update(&mut self, region_id: &str) -> Result<(), CommandError> {
        self.start_transfer(region_id, "update", RegionStatus::Updatable, false)
    }

    /// Re-enqueues a failed download, resuming from the confirmed
    /// offset.
    pub fn retry(&mut self, region_id: &str) -> Result<(), CommandError> {
        self.start_transfer(region_id, "retry", RegionStatus::Failed, false)
    }

    fn start_transfer(
        &mut self,
        region_id: &str,
        command: &'static str,
        eligible: RegionStatus,
        idempotent_when_active: bool,
    ) -> Result<(), CommandError> {
        let targets = self.leaf_targets(region_id)?;

        let mut started = 0usize;
        let mut active = 0usize;
        for id in &targets {
            let status = self.states[id].status;
            if status == eligible {
                self.set_status(id, RegionStatus::Enqueued);
                let request = self.request_for(id);
                debug!(region = id.as_str(), command, offset = request.resume_offset, "enqueueing transfer");
                self.backend.enqueue(request);
                started += 1;
            } else if status.is_active() {
                active += 1;
            }
        }

        if started > 0 || (idempotent_when_active && active > 0) {
            return Ok(());
        }
        Err(self.invalid_transition(region_id, command))
    }

    /// Cooperatively cancels a region's transfer(s). The partial file
    /// is kept; the region returns to `Downloadable` immediately.
    pub fn cancel(&mut self, region_id: &str) -> Result<(), CommandError> {
        let targets = self.leaf_targets(region_id)?;
        let mut cancelled = 0usize;
        for id in &targets {
            if self.states[id].status.is_active() {
                self.backend.cancel(id);
                let partial = self.store.partial_size(id);
                self.set_downloaded_bytes(id, partial);
                self.set_status(id, RegionStatus::Downloadable);
                self.set_draining(id);
                cancelled += 1;
            }
        }
        if cancelled == 0 {
            return Err(self.invalid_transition(region_id, "cancel"));
        }
        Ok(())
    }

    /// Removes a region's local files. An active transfer is cancelled
    /// first; the final, partial and version files all go.
    pub fn delete(&mut self, region_id: &str) -> Result<(), CommandError> {
        let targets = self.leaf_targets(region_id)?;
        let mut deleted = 0usize;
        for id in &targets {
            let status = self.states[id].status;
            let has_artifacts = status.is_on_disk()
                || status == RegionStatus::Failed
                || self.store.partial_size(id) > 0;
            if !status.is_active() && !has_artifacts {
                continue;
            }
            if status.is_active() {
                self.backend.cancel(id);
                self.set_draining(id);
            }
            if let Err(e) = self.store.delete_region(id) {
                error!(region = id.as_str(), error = %e, "failed to delete region files");
            }
            self.set_downloaded_bytes(id, 0);
            self.set_status(id, RegionStatus::Downloadable);
            deleted += 1;
        }
        if deleted == 0 {
            return Err(self.invalid_transition(region_id, "delete"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Applies one transfer-layer event. Events arrive in order per
    /// region; an unknown region id is logged and dropped (the tree is
    /// the authority, the channel is not).
    pub fn handle_event(&mut self, event: StorageEvent) {
        let region_id = event.region_id().to_string();
        if !self.states.contains_key(&region_id) {
            warn!(region = region_id.as_str(), ?event, "event for unknown region dropped");
            return;
        }
        match event {
            StorageEvent::Started { .. } | StorageEvent::Progress { .. }
                if self.states[&region_id].draining =>
            {
                // The cancelled job is still winding down; only its
                // terminal event settles the region.
                debug!(region = region_id.as_str(), "stale event from cancelled transfer ignored");
            }
            StorageEvent::Started { .. } => {
                self.ensure_in_progress(&region_id);
            }
            StorageEvent::Progress {
                bytes_local,
                bytes_total,
                ..
            } => {
                self.ensure_in_progress(&region_id);
                self.set_downloaded_bytes(&region_id, bytes_local);
                let clamped = self.states[&region_id].downloaded_bytes;
                self.bus.notify_progress(&region_id, clamped, bytes_total);
            }
            StorageEvent::Completed { .. } => {
                if self.take_draining(&region_id)
                    && self.states[&region_id].status != RegionStatus::Enqueued
                {
                    // Cancel raced the final byte; honor the cancel. The
                    // finished partial stays on disk, so a later download
                    // promotes it without refetching.
                    let partial = self.store.partial_size(&region_id);
                    self.set_downloaded_bytes(&region_id, partial);
                    return;
                }
                // Never skip an edge: a completion observed while still
                // Enqueued passes through InProgress first.
                self.ensure_in_progress(&region_id);
                let version = self
                    .tree
                    .get(&region_id)
                    .map(|n| n.remote_version)
                    .unwrap_or(0);
                match self.store.promote(&region_id, version) {
                    Ok(()) => {
                        let size = self.tree.get(&region_id).map(|n| n.size_bytes).unwrap_or(0);
                        self.set_downloaded_bytes(&region_id, size);
                        self.set_status(&region_id, RegionStatus::Done);
                        info!(region = region_id.as_str(), "download complete");
                    }
                    Err(e) => {
                        error!(region = region_id.as_str(), error = %e, "failed to promote partial file");
                        self.set_status(&region_id, RegionStatus::Failed);
                    }
                }
            }
            StorageEvent::Failed { error, .. } => {
                if self.take_draining(&region_id) {
                    // The failure belongs to a job the user cancelled;
                    // the region must not surface as Failed.
                    if self.states[&region_id].status == RegionStatus::Enqueued {
                        self.restart_transfer(&region_id);
                    } else {
                        let partial = self.store.partial_size(&region_id);
                        self.set_downloaded_bytes(&region_id, partial);
                    }
                    return;
                }
                warn!(region = region_id.as_str(), error = %error, "download failed");
                self.ensure_in_progress(&region_id);
                let partial = self.store.partial_size(&region_id);
                self.set_downloaded_bytes(&region_id, partial);
                self.set_status(&region_id, RegionStatus::Failed);
            }
            StorageEvent::Cancelled { .. } => {
                if self.take_draining(&region_id)
                    && self.states[&region_id].status == RegionStatus::Enqueued
                {
                    self.restart_transfer(&region_id);
                    return;
                }
                if self.states[&region_id].status.is_active() {
                    // The transfer layer cancelled on its own (teardown);
                    // no command moved the region yet.
                    let partial = self.store.partial_size(&region_id);
                    self.set_downloaded_bytes(&region_id, partial);
                    self.set_status(&region_id, RegionStatus::Downloadable);
                } else {
                    // Refresh the resume anchor: the job may have written
                    // past the snapshot the cancel command took.
                    let partial = self.store.partial_size(&region_id);
                    self.set_downloaded_bytes(&region_id, partial);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn leaf_targets(&self, region_id: &str) -> Result<Vec<String>, CommandError> {
        if !self.tree.contains(region_id) {
            return Err(CommandError::UnknownRegion(region_id.to_string()));
        }
        Ok(self
            .tree
            .leaf_descendants(region_id)
            .iter()
            .map(|n| n.id.clone())
            .collect())
    }

    fn invalid_transition(&self, region_id: &str, command: &'static str) -> CommandError {
        let status = self
            .status_of(region_id)
            .map(|s| s.as_str())
            .unwrap_or("unknown");
        CommandError::InvalidTransition {
            region: region_id.to_string(),
            command,
            status,
        }
    }

    fn request_for(&self, region_id: &str) -> TransferRequest {
        let node = self.tree.get(region_id).expect("target validated");
        TransferRequest {
            region_id: region_id.to_string(),
            url: format!(
                "{}/{}/{}.mwm",
                self.config.base_url.trim_end_matches('/'),
                node.remote_version,
                node.id
            ),
            expected_total_size: (node.size_bytes > 0).then_some(node.size_bytes),
            resume_offset: self.store.partial_size(region_id),
        }
    }

    fn set_downloaded_bytes(&mut self, region_id: &str, bytes: u64) {
        let size = self.tree.get(region_id).map(|n| n.size_bytes).unwrap_or(0);
        if let Some(state) = self.states.get_mut(region_id) {
            // Clamped, never panicking: a lying server must not poison
            // the progress math.
            state.downloaded_bytes = if size > 0 { bytes.min(size) } else { bytes };
        }
    }

    fn set_draining(&mut self, region_id: &str) {
        if let Some(state) = self.states.get_mut(region_id) {
            state.draining = true;
        }
    }

    /// Clears the draining flag, returning whether it was set.
    fn take_draining(&mut self, region_id: &str) -> bool {
        match self.states.get_mut(region_id) {
            Some(state) if state.draining => {
                state.draining = false;
                true
            }
            _ => false,
        }
    }

    /// Re-issues a transfer for a region that was re-enqueued while its
    /// cancelled predecessor still held the scheduler's job-table slot;
    /// that enqueue was absorbed as a duplicate. The terminal event just
    /// applied means the slot is free again.
    fn restart_transfer(&mut self, region_id: &str) {
        let request = self.request_for(region_id);
        debug!(
            region = region_id,
            offset = request.resume_offset,
            "restarting transfer after cancel drain"
        );
        self.backend.enqueue(request);
    }

    fn ensure_in_progress(&mut self, region_id: &str) {
        if self.states[region_id].status == RegionStatus::Enqueued {
            self.set_status(region_id, RegionStatus::InProgress);
        }
    }

    /// Applies a validated leaf transition and notifies observers, for
    /// the leaf itself and for every ancestor whose derived status
    /// changed with it.
    fn set_status(&mut self, region_id: &str, next: RegionStatus) {
        let current = self.states[region_id].status;
        if current == next {
            return;
        }
        if !current.can_become(next) {
            warn!(
                region = region_id,
                from = current.as_str(),
                to = next.as_str(),
                "refusing invalid status transition"
            );
            return;
        }

        let ancestors = self.ancestors_of(region_id);
        let before: Vec<RegionStatus> = ancestors
            .iter()
            .map(|id| self.status_of(id).expect("ancestor exists"))
            .collect();

        self.states.get_mut(region_id).expect("leaf exists").status = next;
        self.bus.notify_status(region_id, next);

        for (id, old) in ancestors.iter().zip(before) {
            let new = self.status_of(id).expect("ancestor exists");
            if new != old {
                self.bus.notify_status(id, new);
            }
        }
    }

    fn ancestors_of(&self, region_id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut cursor = self.tree.get(region_id).and_then(|n| n.parent.clone());
        while let Some(id) = cursor {
            cursor = self.tree.get(&id).and_then(|n| n.parent.clone());
            result.push(id);
        }
        result
    }

    fn materialize(&self, node: &RegionNode) -> RegionItem {
        let leaves = self.tree.leaf_descendants(&node.id);
        let (status, size_bytes, downloaded_bytes) = if self.tree.is_leaf(&node.id) {
            let state = self.states[&node.id];
            (state.status, node.size_bytes, state.downloaded_bytes)
        } else {
            let status = aggregate_status(leaves.iter().map(|l| self.states[&l.id].status));
            let size: u64 = leaves.iter().map(|l| l.size_bytes).sum();
            let downloaded: u64 = leaves
                .iter()
                .map(|l| self.states[&l.id].downloaded_bytes)
                .sum();
            (status, size, downloaded)
        };

        let near_me = self.last_location.is_some_and(|p| {
            leaves
                .iter()
                .any(|l| l.rect.is_some_and(|r| r.contains(p)))
        });
        let category = if near_me {
            Category::NearMe
        } else if leaves
            .iter()
            .any(|l| self.states[&l.id].status.is_on_disk())
        {
            Category::Downloaded
        } else {
            Category::Other
        };

        RegionItem {
            id: node.id.clone(),
            parent_id: node.parent.clone(),
            name: node.name.clone(),
            parent_name: node
                .parent
                .as_deref()
                .and_then(|p| self.tree.get(p))
                .map(|n| n.name.clone()),
            size_bytes,
            downloaded_bytes,
            child_count: self.tree.child_count(&node.id),
            total_child_count: self.tree.total_child_count(&node.id),
            category,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Rect;
    use crate::region::RegionSpec;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeBackend {
        enqueued: Mutex<Vec<TransferRequest>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl TransferBackend for FakeBackend {
        fn enqueue(&self, request: TransferRequest) {
            self.enqueued.lock().push(request);
        }
        fn cancel(&self, region_id: &str) {
            self.cancelled.lock().push(region_id.to_string());
        }
    }

    fn sample_tree() -> RegionTree {
        RegionTree::build(vec![
            RegionSpec::group("Europe", None),
            RegionSpec::leaf(
                "France",
                Some("Europe"),
                1000,
                Rect::new(41.0, 51.0, -5.0, 9.0),
                2,
            ),
            RegionSpec::leaf(
                "Spain",
                Some("Europe"),
                800,
                Rect::new(36.0, 43.0, -9.5, 3.5),
                2,
            ),
        ])
        .unwrap()
    }

    fn storage() -> (TempDir, Arc<FakeBackend>, MapStorage) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let model = MapStorage::new(
            sample_tree(),
            MapFilesStore::open(dir.path()).unwrap(),
            MapStorageConfig::new("http://maps.test/maps"),
            backend.clone(),
        );
        (dir, backend, model)
    }

    struct Recorder(Mutex<Vec<(String, RegionStatus)>>);

    impl StorageObserver for Recorder {
        fn on_status_changed(&self, region_id: &str, status: RegionStatus) {
            self.0.lock().push((region_id.to_string(), status));
        }
        fn on_progress(&self, _region_id: &str, _local: u64, _remote: u64) {}
    }

    #[test]
    fn test_download_enqueues_with_resume_offset_zero() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);
        let jobs = backend.enqueued.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].region_id, "France");
        assert_eq!(jobs[0].url, "http://maps.test/maps/2/France.mwm");
        assert_eq!(jobs[0].resume_offset, 0);
        assert_eq!(jobs[0].expected_total_size, Some(1000));
    }

    #[test]
    fn test_duplicate_download_is_noop_with_single_job() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });

        model.download("France").unwrap();
        assert_eq!(backend.enqueued.lock().len(), 1);
        assert_eq!(model.status_of("France").unwrap(), RegionStatus::InProgress);
    }

    #[test]
    fn test_unknown_region_rejected() {
        let (_dir, _backend, mut model) = storage();
        assert!(matches!(
            model.download("Atlantis").unwrap_err(),
            CommandError::UnknownRegion(id) if id == "Atlantis"
        ));
        assert!(matches!(
            model.list_items(Some("Atlantis")).unwrap_err(),
            CommandError::UnknownRegion(_)
        ));
    }

    #[test]
    fn test_retry_requires_failed() {
        let (_dir, _backend, mut model) = storage();
        assert!(matches!(
            model.retry("France").unwrap_err(),
            CommandError::InvalidTransition { command: "retry", .. }
        ));
    }

    #[test]
    fn test_cancel_resume_scenario() {
        // The worked example: 1000-byte region, 400 bytes land, cancel,
        // re-download resumes at offset 400.
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });

        // 400 bytes hit the partial file.
        fs::write(model.files().partial_path("France"), vec![0u8; 400]).unwrap();
        model.handle_event(StorageEvent::Progress {
            region_id: "France".into(),
            bytes_local: 400,
            bytes_total: 1000,
        });

        model.cancel("France").unwrap();
        assert_eq!(
            model.status_of("France").unwrap(),
            RegionStatus::Downloadable
        );
        assert_eq!(backend.cancelled.lock().as_slice(), ["France"]);
        assert_eq!(model.files().partial_size("France"), 400);

        model.download("France").unwrap();
        let jobs = backend.enqueued.lock();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].resume_offset, 400);
    }

    #[test]
    fn test_redownload_during_cancel_drain_restarts_transfer() {
        // Cancel, then download again before the cancelled job emits
        // its terminal event. The second enqueue is absorbed by the
        // scheduler's idempotent job table, so the model must re-issue
        // it once the Cancelled event lands.
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 300]).unwrap();

        model.cancel("France").unwrap();
        model.download("France").unwrap();
        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);

        // Stale progress from the old job must not disturb the new one.
        model.handle_event(StorageEvent::Progress {
            region_id: "France".into(),
            bytes_local: 310,
            bytes_total: 1000,
        });
        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);

        let before = backend.enqueued.lock().len();
        model.handle_event(StorageEvent::Cancelled {
            region_id: "France".into(),
        });

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);
        let jobs = backend.enqueued.lock();
        assert_eq!(jobs.len(), before + 1);
        let restarted = jobs.last().unwrap();
        assert_eq!(restarted.region_id, "France");
        assert_eq!(restarted.resume_offset, 300);
    }

    #[test]
    fn test_cancel_drain_without_redownload_stays_downloadable() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        model.cancel("France").unwrap();

        let before = backend.enqueued.lock().len();
        model.handle_event(StorageEvent::Cancelled {
            region_id: "France".into(),
        });

        assert_eq!(
            model.status_of("France").unwrap(),
            RegionStatus::Downloadable
        );
        assert_eq!(backend.enqueued.lock().len(), before);
    }

    #[test]
    fn test_failure_of_cancelled_job_never_surfaces_as_failed() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        model.cancel("France").unwrap();
        model.download("France").unwrap();

        // The old job happened to die with an error instead of a clean
        // cancel; the newer download command still wins.
        model.handle_event(StorageEvent::Failed {
            region_id: "France".into(),
            error: DownloadError::Io("socket closed".into()),
        });

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);
        assert_eq!(backend.enqueued.lock().last().unwrap().region_id, "France");
    }

    #[test]
    fn test_completion_promotes_and_reaches_done() {
        let (_dir, _backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 1000]).unwrap();
        model.handle_event(StorageEvent::Completed {
            region_id: "France".into(),
        });

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Done);
        assert!(model.files().has_map("France"));
        assert_eq!(model.files().local_version("France"), Some(2));
    }

    #[test]
    fn test_completion_while_enqueued_passes_through_in_progress() {
        let (_dir, _backend, mut model) = storage();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        model.subscribe(recorder.clone());

        model.download("France").unwrap();
        fs::write(model.files().partial_path("France"), vec![0u8; 1000]).unwrap();
        // No Started event: the completion must still show the
        // InProgress edge to observers.
        model.handle_event(StorageEvent::Completed {
            region_id: "France".into(),
        });

        let seen: Vec<RegionStatus> = recorder
            .0
            .lock()
            .iter()
            .filter(|(id, _)| id == "France")
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(
            seen,
            [
                RegionStatus::Enqueued,
                RegionStatus::InProgress,
                RegionStatus::Done
            ]
        );
    }

    #[test]
    fn test_failure_and_retry_resume() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 250]).unwrap();
        model.handle_event(StorageEvent::Failed {
            region_id: "France".into(),
            error: DownloadError::Io("connection reset".into()),
        });

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Failed);

        model.retry("France").unwrap();
        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);
        assert_eq!(backend.enqueued.lock()[1].resume_offset, 250);
    }

    #[test]
    fn test_delete_while_in_progress_cancels_first() {
        let (_dir, backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 100]).unwrap();

        model.delete("France").unwrap();
        assert_eq!(backend.cancelled.lock().as_slice(), ["France"]);
        assert_eq!(
            model.status_of("France").unwrap(),
            RegionStatus::Downloadable
        );
        assert_eq!(model.files().partial_size("France"), 0);
    }

    #[test]
    fn test_delete_done_returns_to_downloadable() {
        let (_dir, _backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 1000]).unwrap();
        model.handle_event(StorageEvent::Completed {
            region_id: "France".into(),
        });

        model.delete("France").unwrap();
        assert!(!model.files().has_map("France"));
        assert_eq!(
            model.status_of("France").unwrap(),
            RegionStatus::Downloadable
        );
        // Nothing left to delete now.
        assert!(model.delete("France").is_err());
    }

    #[test]
    fn test_group_download_fans_out_and_aggregates() {
        let (_dir, backend, mut model) = storage();
        model.download("Europe").unwrap();
        assert_eq!(backend.enqueued.lock().len(), 2);
        assert_eq!(model.status_of("Europe").unwrap(), RegionStatus::Enqueued);

        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        // InProgress takes precedence over the still-enqueued Spain.
        assert_eq!(model.status_of("Europe").unwrap(), RegionStatus::InProgress);
    }

    #[test]
    fn test_list_items_direct_children_with_aggregate_row() {
        let (_dir, _backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        fs::write(model.files().partial_path("France"), vec![0u8; 1000]).unwrap();
        model.handle_event(StorageEvent::Completed {
            region_id: "France".into(),
        });

        let roots = model.list_items(None).unwrap();
        assert_eq!(roots.len(), 1);
        let europe = &roots[0];
        assert_eq!(europe.id, "Europe");
        assert_eq!(europe.status, RegionStatus::Mixed);
        assert_eq!(europe.size_bytes, 1800);
        assert_eq!(europe.downloaded_bytes, 1000);
        assert_eq!(europe.child_count, 2);
        assert_eq!(europe.total_child_count, 2);
        assert_eq!(europe.category, Category::Downloaded);

        let children = model.list_items(Some("Europe")).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].status, RegionStatus::Done);
        assert_eq!(children[0].parent_name.as_deref(), Some("Europe"));
        assert_eq!(children[1].status, RegionStatus::Downloadable);
    }

    #[test]
    fn test_near_me_category_follows_location() {
        let (_dir, _backend, mut model) = storage();
        model.set_last_location(LatLon::new(48.8, 2.3));
        let children = model.list_items(Some("Europe")).unwrap();
        let france = children.iter().find(|i| i.id == "France").unwrap();
        let spain = children.iter().find(|i| i.id == "Spain").unwrap();
        assert_eq!(france.category, Category::NearMe);
        assert_eq!(spain.category, Category::Other);
    }

    #[test]
    fn test_update_info_counts_stale_regions() {
        let dir = TempDir::new().unwrap();
        let store = MapFilesStore::open(dir.path()).unwrap();
        // France downloaded at an older data version.
        fs::write(store.partial_path("France"), vec![0u8; 1000]).unwrap();
        store.promote("France", 1).unwrap();

        let model = MapStorage::new(
            sample_tree(),
            store,
            MapStorageConfig::new("http://maps.test/maps"),
            Arc::new(FakeBackend::default()),
        );

        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Updatable);
        let info = model.get_update_info().unwrap();
        assert_eq!(info.file_count, 1);
        assert_eq!(info.total_size_bytes, 1000);
    }

    #[test]
    fn test_update_command_on_updatable_region() {
        let dir = TempDir::new().unwrap();
        let store = MapFilesStore::open(dir.path()).unwrap();
        fs::write(store.partial_path("France"), vec![0u8; 1000]).unwrap();
        store.promote("France", 1).unwrap();

        let backend = Arc::new(FakeBackend::default());
        let mut model = MapStorage::new(
            sample_tree(),
            store,
            MapStorageConfig::new("http://maps.test/maps"),
            backend.clone(),
        );

        model.update("France").unwrap();
        assert_eq!(model.status_of("France").unwrap(), RegionStatus::Enqueued);
        assert_eq!(backend.enqueued.lock().len(), 1);
    }

    #[test]
    fn test_progress_clamped_to_region_size() {
        let (_dir, _backend, mut model) = storage();
        model.download("France").unwrap();
        model.handle_event(StorageEvent::Started {
            region_id: "France".into(),
        });
        model.handle_event(StorageEvent::Progress {
            region_id: "France".into(),
            bytes_local: 5000,
            bytes_total: 1000,
        });
        let children = model.list_items(Some("Europe")).unwrap();
        let france = children.iter().find(|i| i.id == "France").unwrap();
        assert_eq!(france.downloaded_bytes, 1000);
    }

    #[test]
    fn test_find_region_by_location() {
        let (_dir, _backend, model) = storage();
        assert_eq!(
            model.find_region_by_location(48.8, 2.3).as_deref(),
            Some("France")
        );
        assert_eq!(model.find_region_by_location(0.0, 0.0), None);
    }
}
