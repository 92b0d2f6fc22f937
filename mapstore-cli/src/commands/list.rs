//! List command - browse the region hierarchy one level at a time.

use console::style;
use mapstore::RegionStatus;

use super::common::{format_size, open_session, GlobalOpts, Session};
use crate::error::CliError;

pub fn run(opts: &GlobalOpts, parent: Option<&str>) -> Result<(), CliError> {
    let Session { model, .. } = open_session(opts)?;

    let items = model.list_items(parent)?;
    if items.is_empty() {
        println!("No regions under {}", parent.unwrap_or("the root"));
        return Ok(());
    }

    println!(
        "{:<28} {:>10} {:>6} {:>9}  STATUS",
        "REGION", "SIZE", "DONE", "CHILDREN"
    );
    for item in &items {
        let status = match item.status {
            RegionStatus::Downloadable => style("available").dim(),
            RegionStatus::Enqueued => style("queued").cyan(),
            RegionStatus::InProgress => style("downloading").cyan(),
            RegionStatus::Done => style("done").green(),
            RegionStatus::Failed => style("failed").red(),
            RegionStatus::Updatable => style("update available").yellow(),
            RegionStatus::Mixed => style("mixed").magenta(),
        };
        let done = if item.size_bytes > 0 {
            format!("{}%", item.progress_percent())
        } else {
            "-".to_string()
        };
        let children = if item.child_count > 0 {
            format!("{}/{}", item.child_count, item.total_child_count)
        } else {
            "-".to_string()
        };
        println!(
            "{:<28} {:>10} {:>6} {:>9}  {}",
            item.id,
            format_size(item.size_bytes),
            done,
            children,
            status
        );
    }

    if let Some(info) = model.get_update_info() {
        println!();
        println!(
            "{} region file(s) have newer data available ({})",
            info.file_count,
            format_size(info.total_size_bytes)
        );
    }
    Ok(())
}
