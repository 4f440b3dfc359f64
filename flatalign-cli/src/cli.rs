use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use flatalign::{Config, StagePosition};

/// Aligns flat-field images to the stacks of a tiled acquisition and writes
/// one destripe script per channel.
#[derive(Parser, Debug, Default)]
#[command(version)]
pub struct Cli {
    /// Acquisition roots, one per channel. The first is the display root.
    #[arg(value_name = "IMAGE_DIR", required = true)]
    pub image_dirs: Vec<PathBuf>,

    /// Glob selecting the flat-field files.
    #[arg(long = "flat-files", value_name = "GLOB")]
    pub flat_files: Option<String>,

    /// Microns per pixel in X and Y.
    #[arg(long = "xy-voxel-size", value_name = "MICRONS")]
    pub xy_voxel_size: Option<f64>,

    /// Microns per z-plane.
    #[arg(long = "z-voxel-size", value_name = "MICRONS")]
    pub z_voxel_size: Option<f64>,

    /// Where scripts and destriped stacks go. Defaults to the parent of the
    /// first image directory.
    #[arg(long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Extra flags passed verbatim to every pystripe invocation.
    #[arg(long = "pystripe-args", value_name = "ARGS", allow_hyphen_values = true)]
    pub pystripe_args: Option<String>,

    /// Largest stack/flat Y distance for automatic pairing, in microns.
    #[arg(long, value_name = "MICRONS")]
    pub tolerance: Option<f64>,

    /// Dark level passed to pystripe.
    #[arg(long, value_name = "COUNTS")]
    pub dark: Option<u16>,

    /// YAML, JSON or TOML file with default settings; flags override it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Manual Y offset for one stack, e.g. `--offset 1200_3400=-2.5`.
    #[arg(
        long = "offset",
        value_name = "X_Y=MICRONS",
        value_parser = parse_offset,
        action = ArgAction::Append
    )]
    pub offsets: Vec<(StagePosition, f64)>,

    /// Flat for one stack instead of the automatic choice, e.g.
    /// `--flat 1200_3400=FLAT_3000_101519.tif`. A bare file name picks the
    /// catalog flat of that name; `none` leaves the stack uncorrected. The
    /// stack's offset is kept, so pair a new flat with `--offset`.
    #[arg(
        long = "flat",
        value_name = "X_Y=PATH",
        value_parser = parse_flat_choice,
        action = ArgAction::Append
    )]
    pub flats: Vec<(StagePosition, Option<PathBuf>)>,

    /// Print the scripts instead of writing them.
    #[arg(long, default_value_t = false)]
    pub print: bool,

    /// Base log level; `RUST_LOG` overrides it.
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// The config file (or defaults) with every given flag applied on top.
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(flat_files) = &self.flat_files {
            config.flat_files = flat_files.clone();
        }
        if let Some(xy_voxel_size) = self.xy_voxel_size {
            config.xy_voxel_size = xy_voxel_size;
        }
        if let Some(z_voxel_size) = self.z_voxel_size {
            config.z_voxel_size = z_voxel_size;
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = Some(output_dir.clone());
        }
        if let Some(pystripe_args) = &self.pystripe_args {
            config.pystripe_args = pystripe_args.clone();
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance = tolerance;
        }
        if let Some(dark) = self.dark {
            config.dark = dark;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_offset(value: &str) -> std::result::Result<(StagePosition, f64), String> {
    let (position, microns) = value
        .split_once('=')
        .ok_or_else(|| format!("expected X_Y=MICRONS, got '{value}'"))?;
    let position: StagePosition = position.parse().map_err(|e| format!("{e}"))?;
    let microns: f64 = microns
        .parse()
        .map_err(|_| format!("offset '{microns}' is not a number"))?;
    if !microns.is_finite() {
        return Err(format!("offset '{microns}' is not finite"));
    }
    Ok((position, microns))
}

fn parse_flat_choice(value: &str) -> std::result::Result<(StagePosition, Option<PathBuf>), String> {
    let (position, flat) = value
        .split_once('=')
        .ok_or_else(|| format!("expected X_Y=PATH, got '{value}'"))?;
    let position: StagePosition = position.parse().map_err(|e| format!("{e}"))?;
    match flat {
        "" => Err(format!("no flat given for {position}")),
        "none" => Ok((position, None)),
        path => Ok((position, Some(PathBuf::from(path)))),
    }
}
