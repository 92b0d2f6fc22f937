//! Delete command - remove local files for regions.

use super::common::{open_session, GlobalOpts, Session};
use crate::error::CliError;

pub fn run(opts: &GlobalOpts, regions: &[String]) -> Result<(), CliError> {
    let Session { mut model, .. } = open_session(opts)?;

    for region in regions {
        model.delete(region).map_err(CliError::from)?;
        println!("Deleted {region}");
    }
    Ok(())
}
