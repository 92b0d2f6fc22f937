//! mapstore CLI - download and manage offline map regions.

mod commands;
mod error;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use commands::common::GlobalOpts;

#[derive(Debug, Parser)]
#[command(name = "mapstore", version, about = "Download and manage offline map regions")]
struct Cli {
    /// Directory holding map files and the region list
    #[arg(long, global = true, default_value = "maps")]
    maps_dir: PathBuf,

    /// Region list file (defaults to <maps-dir>/regions.txt)
    #[arg(long, global = true)]
    region_list: Option<PathBuf>,

    /// Base URL of the map-file server
    #[arg(long, global = true, default_value = "http://localhost:8080/maps")]
    base_url: String,

    /// Concurrent transfer workers
    #[arg(long, global = true, default_value_t = 4)]
    workers: usize,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List regions (roots, or the children of PARENT)
    List { parent: Option<String> },

    /// Download one or more regions
    Download {
        #[arg(required = true)]
        regions: Vec<String>,
    },

    /// Re-download regions whose data version is out of date
    Update { regions: Vec<String> },

    /// Delete downloaded files for one or more regions
    Delete {
        #[arg(required = true)]
        regions: Vec<String>,
    },

    /// Migrate a legacy map layout to the current one
    Migrate {
        /// Legacy map directory to migrate away from
        #[arg(long)]
        legacy_dir: PathBuf,

        /// Keep the legacy files after migrating
        #[arg(long)]
        keep_old_data: bool,

        /// Last known latitude, for prefetch selection
        #[arg(long, requires = "lon")]
        lat: Option<f64>,

        /// Last known longitude
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
    },
}

fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    } else {
        let appender = tracing_appender::rolling::daily(&cli.maps_dir, "mapstore.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = std::fs::create_dir_all(&cli.maps_dir) {
        eprintln!(
            "{} cannot create {}: {e}",
            console::style("error:").red().bold(),
            cli.maps_dir.display()
        );
        process::exit(1);
    }
    let _log_guard = init_logging(&cli);

    let opts = GlobalOpts {
        maps_dir: cli.maps_dir.clone(),
        region_list: cli
            .region_list
            .clone()
            .unwrap_or_else(|| cli.maps_dir.join("regions.txt")),
        base_url: cli.base_url.clone(),
        workers: cli.workers,
    };

    let result = match &cli.command {
        Commands::List { parent } => commands::list::run(&opts, parent.as_deref()),
        Commands::Download { regions } => commands::download::run(&opts, regions),
        Commands::Update { regions } => commands::update::run(&opts, regions),
        Commands::Delete { regions } => commands::delete::run(&opts, regions),
        Commands::Migrate {
            legacy_dir,
            keep_old_data,
            lat,
            lon,
        } => {
            let location = lat.zip(*lon);
            commands::migrate::run(&opts, legacy_dir, *keep_old_data, location)
        }
    };

    if let Err(e) = result {
        eprintln!("{} {e}", console::style("error:").red().bold());
        process::exit(1);
    }
}
