mod cli;
mod init;

use anyhow::{Context, Result};
use clap::Parser;
use flatalign::Session;

use crate::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init::init(&cli.log_level)?;

    let config = cli.config()?;
    let mut session = Session::load(&cli.image_dirs, config).context("Failed to load acquisition")?;

    let index = session.index();
    let deepest = index.max_planes();
    tracing::info!(
        "{} stacks on a {}x{} grid, up to {} planes ({} um)",
        index.len(),
        index.x_positions().len(),
        index.y_positions().len(),
        deepest,
        session.config().z_depth_microns(deepest)
    );

    if !session.diagnostics().is_empty() {
        eprintln!("{}", session.diagnostics().summary());
    }

    for &(position, microns) in &cli.offsets {
        session
            .set_offset(position, microns)
            .with_context(|| format!("Cannot apply --offset {position}={microns}"))?;
    }

    for (position, flat) in &cli.flats {
        let index = match flat {
            Some(path) => Some(
                session
                    .state()
                    .catalog()
                    .resolve(path)
                    .with_context(|| format!("{} is not in the flat catalog", path.display()))?,
            ),
            None => None,
        };
        session
            .set_flat(*position, index)
            .with_context(|| format!("Cannot apply --flat for {position}"))?;
    }

    if cli.print {
        let compiler = session.compiler();
        for channel in compiler.channel_names() {
            println!("{}", compiler.compile(channel)?);
        }
        return Ok(());
    }

    for path in session.write_scripts()? {
        println!("{}", path.display());
    }

    Ok(())
}
