//! Download command - fetch region files with live progress.

use std::sync::Arc;

use mapstore::{MapStorage, RegionStatus};

use super::common::{drive_to_settled, leaf_ids, open_session, GlobalOpts, Session, TransferDisplay};
use crate::error::CliError;

pub fn run(opts: &GlobalOpts, regions: &[String]) -> Result<(), CliError> {
    let Session {
        runtime,
        mut model,
        mut events,
        mut interrupt,
    } = open_session(opts)?;

    let display = Arc::new(TransferDisplay::new());
    model.subscribe(display);

    let targets = runtime.block_on(async {
        let mut targets = Vec::new();
        for region in regions {
            model.download(region).map_err(CliError::from)?;
            targets.extend(leaf_ids(&model, region));
        }
        drive_to_settled(&mut model, &mut events, &mut interrupt, &targets).await?;
        Ok::<_, CliError>(targets)
    })?;

    summarize(&model, &targets)
}

/// Prints the outcome; a failed leaf makes the whole command fail.
pub(super) fn summarize(model: &MapStorage, targets: &[String]) -> Result<(), CliError> {
    let mut done = 0usize;
    let mut failed = Vec::new();
    for id in targets {
        match model.status_of(id) {
            Ok(RegionStatus::Done) => done += 1,
            Ok(RegionStatus::Failed) => failed.push(id.clone()),
            _ => {}
        }
    }
    if !failed.is_empty() {
        return Err(CliError::Transfer(format!(
            "{} of {} region file(s) failed: {}",
            failed.len(),
            targets.len(),
            failed.join(", ")
        )));
    }
    println!("{done} region file(s) downloaded.");
    Ok(())
}
