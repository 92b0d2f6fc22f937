//! Update command - re-download regions whose data version is stale.

use std::sync::Arc;

use mapstore::RegionStatus;

use super::common::{
    drive_to_settled, format_size, leaf_ids, open_session, GlobalOpts, Session, TransferDisplay,
};
use super::download::summarize;
use crate::error::CliError;

/// With no arguments, updates every stale region; with arguments, just
/// the named ones.
pub fn run(opts: &GlobalOpts, regions: &[String]) -> Result<(), CliError> {
    let Session {
        runtime,
        mut model,
        mut events,
        mut interrupt,
    } = open_session(opts)?;

    let named: Vec<String> = if regions.is_empty() {
        let Some(info) = model.get_update_info() else {
            println!("All maps are up to date.");
            return Ok(());
        };
        println!(
            "Updating {} region file(s) ({})",
            info.file_count,
            format_size(info.total_size_bytes)
        );
        stale_leaves(&model)
    } else {
        regions.to_vec()
    };

    let display = Arc::new(TransferDisplay::new());
    model.subscribe(display);

    let targets = runtime.block_on(async {
        let mut targets = Vec::new();
        for region in &named {
            model.update(region).map_err(CliError::from)?;
            targets.extend(leaf_ids(&model, region));
        }
        drive_to_settled(&mut model, &mut events, &mut interrupt, &targets).await?;
        Ok::<_, CliError>(targets)
    })?;

    summarize(&model, &targets)
}

fn stale_leaves(model: &mapstore::MapStorage) -> Vec<String> {
    let tree = model.tree();
    tree.children(None)
        .iter()
        .flat_map(|root| tree.leaf_descendants(&root.id))
        .map(|n| n.id.clone())
        .filter(|id| matches!(model.status_of(id), Ok(RegionStatus::Updatable)))
        .collect()
}
