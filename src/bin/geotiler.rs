//! Geotiler CLI tool
//!
//! Command-line front end for tiled processing of georeferenced rasters.

#[cfg(feature = "cli")]
use geotiler::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
