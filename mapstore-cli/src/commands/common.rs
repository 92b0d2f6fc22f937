//! Shared wiring for the subcommands: session construction, the region
//! list parser, the event-drain loop, and the progress display.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::debug;

use mapstore::bus::StorageObserver;
use mapstore::region::{RegionSpec, StorageEvent};
use mapstore::scheduler::{SchedulerConfig, TransferScheduler};
use mapstore::{MapFilesStore, MapStorage, MapStorageConfig, Rect, RegionStatus, RegionTree};

use crate::error::CliError;

/// Options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub maps_dir: PathBuf,
    pub region_list: PathBuf,
    pub base_url: String,
    pub workers: usize,
}

/// One wired-up command session: runtime, model, and the channels the
/// event loop drains.
pub struct Session {
    pub runtime: tokio::runtime::Runtime,
    pub model: MapStorage,
    pub events: mpsc::Receiver<StorageEvent>,
    pub interrupt: mpsc::Receiver<()>,
}

/// Builds the full stack for one command run: region tree from the
/// region list, file store over the maps directory, scheduler, model,
/// and a Ctrl+C channel.
pub fn open_session(opts: &GlobalOpts) -> Result<Session, CliError> {
    let specs = load_region_list(&opts.region_list)?;
    let tree = RegionTree::build(specs).map_err(|e| CliError::RegionList(e.to_string()))?;
    let store = MapFilesStore::open(&opts.maps_dir)
        .map_err(|e| CliError::Config(format!("cannot open {}: {e}", opts.maps_dir.display())))?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::Config(format!("failed to start runtime: {e}")))?;

    let (event_tx, events) = mpsc::channel(256);
    let scheduler = TransferScheduler::new(
        SchedulerConfig {
            worker_count: opts.workers.max(1),
            ..SchedulerConfig::default()
        },
        store.clone(),
        event_tx,
    );

    let model = MapStorage::new(
        tree,
        store,
        MapStorageConfig::new(opts.base_url.clone()),
        Arc::new(scheduler),
    );

    let (int_tx, interrupt) = mpsc::channel(1);
    ctrlc::set_handler(move || {
        let _ = int_tx.try_send(());
    })
    .map_err(|e| CliError::Config(format!("failed to install signal handler: {e}")))?;

    debug!(maps_dir = %opts.maps_dir.display(), base_url = opts.base_url.as_str(), "session opened");
    Ok(Session {
        runtime,
        model,
        events,
        interrupt,
    })
}

/// Parses the region list: one region per line,
/// `id;parent;size_bytes;version[;min_lat,max_lat,min_lon,max_lon]`.
/// An empty parent field marks a root; `#` starts a comment.
pub fn load_region_list(path: &Path) -> Result<Vec<RegionSpec>, CliError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CliError::RegionList(format!("cannot read {}: {e}", path.display())))?;

    let mut specs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let spec = parse_region_line(line).map_err(|msg| {
            CliError::RegionList(format!("{}:{}: {msg}", path.display(), lineno + 1))
        })?;
        specs.push(spec);
    }
    if specs.is_empty() {
        return Err(CliError::RegionList(format!(
            "{} lists no regions",
            path.display()
        )));
    }
    Ok(specs)
}

fn parse_region_line(line: &str) -> Result<RegionSpec, String> {
    let fields: Vec<&str> = line.split(';').collect();
    if fields.len() < 4 {
        return Err("expected id;parent;size;version[;bbox]".to_string());
    }
    let id = fields[0].trim();
    if id.is_empty() {
        return Err("missing region id".to_string());
    }
    let parent = fields[1].trim();
    let size_bytes: u64 = fields[2]
        .trim()
        .parse()
        .map_err(|_| "size is not a number".to_string())?;
    let remote_version: u64 = fields[3]
        .trim()
        .parse()
        .map_err(|_| "version is not a number".to_string())?;

    let rect = match fields.get(4).map(|s| s.trim()) {
        None | Some("") => None,
        Some(bbox) => {
            let nums: Vec<f64> = bbox
                .split(',')
                .map(|n| n.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|_| "malformed bounding box".to_string())?;
            if nums.len() != 4 {
                return Err("bounding box needs four numbers".to_string());
            }
            Some(Rect::new(nums[0], nums[1], nums[2], nums[3]))
        }
    };

    Ok(RegionSpec {
        id: id.to_string(),
        name: id.to_string(),
        parent: (!parent.is_empty()).then(|| parent.to_string()),
        size_bytes,
        rect,
        remote_version,
    })
}

/// Leaf region ids under a region (the region itself when a leaf).
pub fn leaf_ids(model: &MapStorage, region_id: &str) -> Vec<String> {
    model
        .tree()
        .leaf_descendants(region_id)
        .iter()
        .map(|n| n.id.clone())
        .collect()
}

/// Applies transfer events to the model until every target leaf has
/// settled. Ctrl+C cancels the targets and returns once the
/// cancellations have landed.
pub async fn drive_to_settled(
    model: &mut MapStorage,
    events: &mut mpsc::Receiver<StorageEvent>,
    interrupt: &mut mpsc::Receiver<()>,
    targets: &[String],
) -> Result<(), CliError> {
    fn settled(model: &MapStorage, targets: &[String]) -> bool {
        targets
            .iter()
            .all(|id| model.status_of(id).map_or(true, |s| !s.is_active()))
    }

    if settled(model, targets) {
        return Ok(());
    }
    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                eprintln!();
                println!("Interrupted, cancelling transfers...");
                for id in targets {
                    let _ = model.cancel(id);
                }
                if settled(model, targets) {
                    return Ok(());
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(CliError::Transfer(
                        "transfer channel closed unexpectedly".to_string(),
                    ));
                };
                model.handle_event(event);
                if settled(model, targets) {
                    return Ok(());
                }
            }
        }
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Per-region progress bars fed from the subscription bus.
pub struct TransferDisplay {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TransferDisplay {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<String, ProgressBar>> {
        match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TransferDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageObserver for TransferDisplay {
    fn on_status_changed(&self, region_id: &str, status: RegionStatus) {
        if let Some(bar) = self.bars().get(region_id) {
            match status {
                RegionStatus::Done => bar.finish_with_message(format!("{region_id}: done")),
                RegionStatus::Failed => bar.abandon_with_message(format!("{region_id}: failed")),
                RegionStatus::Downloadable => {
                    bar.abandon_with_message(format!("{region_id}: cancelled"))
                }
                _ => {}
            }
        }
    }

    fn on_progress(&self, region_id: &str, bytes_local: u64, bytes_total: u64) {
        let mut bars = self.bars();
        let bar = bars.entry(region_id.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(bytes_total));
            let style = ProgressStyle::with_template(
                "{msg:24} {bar:30.cyan/dim} {bytes:>10}/{total_bytes:<10}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_message(region_id.to_string());
            bar
        });
        bar.set_position(bytes_local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region_line_full() {
        let spec = parse_region_line("France;Europe;1048576;170101;41.0,51.0,-5.0,9.0").unwrap();
        assert_eq!(spec.id, "France");
        assert_eq!(spec.parent.as_deref(), Some("Europe"));
        assert_eq!(spec.size_bytes, 1048576);
        assert_eq!(spec.remote_version, 170101);
        assert!(spec.rect.is_some());
    }

    #[test]
    fn test_parse_region_line_root_without_bbox() {
        let spec = parse_region_line("Europe;;0;0").unwrap();
        assert!(spec.parent.is_none());
        assert!(spec.rect.is_none());
    }

    #[test]
    fn test_parse_region_line_rejects_garbage() {
        assert!(parse_region_line("France").is_err());
        assert!(parse_region_line("France;Europe;lots;1").is_err());
        assert!(parse_region_line("France;Europe;1;1;41.0,51.0").is_err());
        assert!(parse_region_line(";Europe;1;1").is_err());
    }

    #[test]
    fn test_load_region_list_skips_comments_and_blanks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("regions.txt");
        fs::write(
            &path,
            "# map regions\n\nEurope;;0;0\nFrance;Europe;1000;2;41.0,51.0,-5.0,9.0\n",
        )
        .unwrap();

        let specs = load_region_list(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].id, "France");
    }

    #[test]
    fn test_load_region_list_rejects_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("regions.txt");
        fs::write(&path, "# nothing here\n").unwrap();
        assert!(load_region_list(&path).is_err());
    }

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
