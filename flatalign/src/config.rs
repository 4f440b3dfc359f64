//! Session configuration.

use std::path::{Path, PathBuf};

use common::file_format::SerdeFormat;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Flat files used when no pattern is given.
pub const DEFAULT_FLAT_GLOB: &str = "/mnt/cephfs/SmartSPIM_CEPH/IlluC_asset/pystripe_flats/*.tif";

/// Flags passed through to every destripe invocation.
pub const DEFAULT_PYSTRIPE_ARGS: &str = "--sigma1 256 --sigma2 256 --wavelet db5 --crossover 10";

/// Suffix of each generated per-channel script.
pub const DEFAULT_SCRIPT_NAME: &str = "run_pystripe.sh";

/// Dark level subtracted in the preview and passed as `--dark`.
pub const DEFAULT_DARK: u16 = 100;

/// Settings shared by scanning, preview and script generation.
///
/// Stage positions on disk are integer tenths of a micron; every physical
/// quantity here is in microns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pixel pitch in X and Y, microns per pixel.
    pub xy_voxel_size: f64,
    /// Plane spacing, microns per z-plane.
    pub z_voxel_size: f64,
    /// Root for scripts and corrected output. Defaults to the parent of the
    /// first image directory.
    pub output_dir: Option<PathBuf>,
    /// Opaque destripe flags, copied verbatim into each invocation.
    pub pystripe_args: String,
    /// Maximum stack/flat Y distance for automatic pairing, in microns.
    pub tolerance: f64,
    /// Glob selecting candidate flat files.
    pub flat_files: String,
    pub dark: u16,
    pub script_name: String,
    /// Target number of entries offered by the z chooser.
    pub max_z_choices: usize,
    /// Upper bound on planes decoded at once while rendering.
    pub max_concurrent_decodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xy_voxel_size: 1.8,
            z_voxel_size: 2.0,
            output_dir: None,
            pystripe_args: DEFAULT_PYSTRIPE_ARGS.to_string(),
            tolerance: 100.0,
            flat_files: DEFAULT_FLAT_GLOB.to_string(),
            dark: DEFAULT_DARK,
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            max_z_choices: 20,
            max_concurrent_decodes: 8,
        }
    }
}

impl Config {
    /// Loads a YAML, JSON or TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let format = SerdeFormat::from_path(path).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        let parsed = match format {
            SerdeFormat::Yaml => serde_yml::from_str(&text).map_err(|e| e.to_string()),
            SerdeFormat::Json => serde_json::from_str(&text).map_err(|e| e.to_string()),
            SerdeFormat::Toml => toml::from_str(&text).map_err(|e| e.to_string()),
        };
        let config: Config = parsed.map_err(|reason| Error::ConfigParse {
            path: path.to_path_buf(),
            reason,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.xy_voxel_size.is_finite() && self.xy_voxel_size > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "xy_voxel_size must be positive, got {}",
                self.xy_voxel_size
            )));
        }
        if !(self.z_voxel_size.is_finite() && self.z_voxel_size > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "z_voxel_size must be positive, got {}",
                self.z_voxel_size
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        if self.script_name.is_empty() || self.script_name.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::InvalidConfig(format!(
                "script_name must be a plain file name, got '{}'",
                self.script_name
            )));
        }
        if self.max_z_choices == 0 || self.max_concurrent_decodes == 0 {
            return Err(Error::InvalidConfig(
                "max_z_choices and max_concurrent_decodes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// `output_dir`, or the parent of `first_image_dir` when unset.
    pub fn resolved_output_dir(&self, first_image_dir: &Path) -> PathBuf {
        if let Some(dir) = &self.output_dir {
            return dir.clone();
        }
        match first_image_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => first_image_dir.to_path_buf(),
        }
    }

    /// Physical depth of a z-plane index, in microns.
    pub fn z_depth_microns(&self, z_index: usize) -> f64 {
        z_index as f64 * self.z_voxel_size
    }
}
