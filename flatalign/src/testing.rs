//! Fixture trees for tests.

use std::path::{Path, PathBuf};

use common::Buffer2;

use crate::plane::{write_flat_tiff, write_raw_plane, write_tiff_plane};

pub(crate) const TILE_WIDTH: usize = 4;
pub(crate) const TILE_HEIGHT: usize = 3;

pub(crate) fn constant_plane(value: u16) -> Buffer2<u16> {
    Buffer2::new_filled(TILE_WIDTH, TILE_HEIGHT, value)
}

/// Creates `<root>/<x>/<x>_<y>/` with one plane file per key and returns the
/// stack directory. Every pixel of plane `i` holds `1000 + i`.
pub(crate) fn make_stack(root: &Path, x: i64, y: i64, keys: &[&str], ext: &str) -> PathBuf {
    let dir = root.join(x.to_string()).join(format!("{x}_{y}"));
    std::fs::create_dir_all(&dir).unwrap();
    for (i, key) in keys.iter().enumerate() {
        let path = dir.join(format!("{key}.{ext}"));
        let plane = constant_plane(1000 + i as u16);
        match ext {
            "raw" => write_raw_plane(&path, &plane).unwrap(),
            _ => write_tiff_plane(&path, &plane).unwrap(),
        }
    }
    dir
}

/// Profile of every fixture flat, top row first.
pub(crate) const FLAT_PROFILE: [f32; TILE_HEIGHT] = [0.5, 1.0, 2.0];

/// Creates tile-sized float flats named `FLAT_<y>_101519.tif`, each row
/// holding [`FLAT_PROFILE`], and returns their paths.
pub(crate) fn make_flats(dir: &Path, ys: &[i64]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    let pixels = FLAT_PROFILE
        .iter()
        .flat_map(|&v| std::iter::repeat(v).take(TILE_WIDTH))
        .collect();
    let flat = Buffer2::new(TILE_WIDTH, TILE_HEIGHT, pixels);
    ys.iter()
        .map(|y| {
            let path = dir.join(format!("FLAT_{y}_101519.tif"));
            write_flat_tiff(&path, &flat).unwrap();
            path
        })
        .collect()
}
