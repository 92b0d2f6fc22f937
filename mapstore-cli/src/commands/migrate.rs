//! Migrate command - one-shot conversion from the legacy map layout.
//!
//! The controller decides whether migration applies and which region to
//! prefetch; the actual bytes go through the regular download path so
//! resume and progress behave exactly like a normal download.

use std::path::Path;
use std::sync::{Arc, Mutex};

use mapstore::migration::{
    MigrationConfig, MigrationController, MigrationState, MigrationTransfer,
};
use mapstore::storage::StatvfsFreeSpace;
use mapstore::{LatLon, MigrationError, RegionStatus};

use super::common::{drive_to_settled, open_session, GlobalOpts, Session, TransferDisplay};
use crate::error::CliError;

/// Records the prefetch handoff from the controller; the command then
/// drives that region through the model itself.
#[derive(Default)]
struct PrefetchHandoff {
    region: Mutex<Option<String>>,
}

impl PrefetchHandoff {
    fn take(&self) -> Option<String> {
        match self.region.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl MigrationTransfer for PrefetchHandoff {
    fn begin(&self, prefetch_region: Option<&str>, _keep_old_data: bool) {
        if let Ok(mut guard) = self.region.lock() {
            *guard = prefetch_region.map(str::to_string);
        }
    }

    fn abort(&self) {}
}

pub fn run(
    opts: &GlobalOpts,
    legacy_dir: &Path,
    keep_old_data: bool,
    location: Option<(f64, f64)>,
) -> Result<(), CliError> {
    let Session {
        runtime,
        mut model,
        mut events,
        mut interrupt,
    } = open_session(opts)?;

    let location = location.map(|(lat, lon)| LatLon::new(lat, lon));
    if let Some(p) = location {
        model.set_last_location(p);
    }

    // The prefetch file must fit on disk; the largest leaf is the bound.
    let required_bytes = {
        let tree = model.tree();
        tree.children(None)
            .iter()
            .flat_map(|root| tree.leaf_descendants(&root.id))
            .map(|n| n.size_bytes)
            .max()
            .unwrap_or(0)
    };

    let handoff = Arc::new(PrefetchHandoff::default());
    let mut controller = MigrationController::new(
        MigrationConfig {
            legacy_mode: legacy_dir.exists(),
            required_bytes,
        },
        &StatvfsFreeSpace,
        &opts.maps_dir,
        handoff.clone(),
    );

    match controller.state() {
        MigrationState::NotNecessary => {
            println!("No legacy maps at {}; nothing to migrate.", legacy_dir.display());
            return Ok(());
        }
        MigrationState::Error(e) => return Err(CliError::Migration(e.to_string())),
        _ => {}
    }

    let Some(prefetch_name) = controller.start(model.tree(), location, keep_old_data) else {
        return Err(CliError::Migration("no region available to prefetch".to_string()));
    };
    let Some(target) = handoff.take() else {
        return Err(CliError::Migration("no region available to prefetch".to_string()));
    };

    if matches!(model.status_of(&target), Ok(RegionStatus::Done)) {
        controller.on_complete();
        finish(legacy_dir, keep_old_data)?;
        return Ok(());
    }

    println!("Prefetching {prefetch_name}...");
    let display = Arc::new(TransferDisplay::new());
    model.subscribe(display);

    let targets = vec![target.clone()];
    runtime.block_on(async {
        model.download(&target).map_err(CliError::from)?;
        drive_to_settled(&mut model, &mut events, &mut interrupt, &targets).await
    })?;

    match model.status_of(&target) {
        Ok(RegionStatus::Done) => {
            controller.on_complete();
            finish(legacy_dir, keep_old_data)
        }
        Ok(RegionStatus::Downloadable) => {
            controller.cancel();
            Err(CliError::Migration("cancelled".to_string()))
        }
        _ => {
            controller.on_error(MigrationError::Other("prefetch download failed".to_string()));
            Err(CliError::Migration("prefetch download failed".to_string()))
        }
    }
}

fn finish(legacy_dir: &Path, keep_old_data: bool) -> Result<(), CliError> {
    if !keep_old_data {
        std::fs::remove_dir_all(legacy_dir).map_err(|e| {
            CliError::Migration(format!(
                "prefetch done, but removing {} failed: {e}",
                legacy_dir.display()
            ))
        })?;
    }
    println!("Migration complete.");
    Ok(())
}
