//! Candidate flat-field files, ordered by Y stage position.

use std::path::{Path, PathBuf};

use crate::diagnostics::{Diagnostics, ScanIssue};
use crate::error::{Error, Result};

/// A flat-field image and the Y stage position (tenths of a micron) it was
/// recorded at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlatFile {
    pub y_pos: i64,
    pub path: PathBuf,
}

impl FlatFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Extracts the Y position from a flat file name: the first `_`-separated
/// token of the stem that is an integer, optionally prefixed by `y`/`Y`.
/// `FLAT_1050_101519.tif` and `y1050_flat.tif` both give 1050.
pub fn parse_flat_y_pos(path: &Path) -> std::result::Result<i64, String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| "file name is not valid UTF-8".to_string())?;

    stem.split('_')
        .find_map(|token| {
            let digits = token
                .strip_prefix('y')
                .or_else(|| token.strip_prefix('Y'))
                .unwrap_or(token);
            digits.parse::<i64>().ok()
        })
        .ok_or_else(|| format!("no Y position in '{stem}'"))
}

/// Flats sorted by `(y_pos, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlatCatalog {
    flats: Vec<FlatFile>,
}

impl FlatCatalog {
    /// Expands `pattern`. An invalid pattern is an error; a pattern that
    /// matches nothing yields an empty catalog and a
    /// [`ScanIssue::GlobExpansion`].
    pub fn from_glob(pattern: &str, diagnostics: &mut Diagnostics) -> Result<Self> {
        let entries = glob::glob(pattern).map_err(|source| Error::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => diagnostics.push(ScanIssue::UnparsableFlat {
                    path: e.path().to_path_buf(),
                    reason: e.error().to_string(),
                }),
            }
        }

        if paths.is_empty() {
            diagnostics.push(ScanIssue::GlobExpansion {
                pattern: pattern.to_string(),
            });
        }

        let catalog = Self::from_paths(paths, diagnostics);
        tracing::info!("Found {} flat files for '{}'", catalog.len(), pattern);
        Ok(catalog)
    }

    /// Builds a catalog from explicit paths, skipping names without a Y position.
    pub fn from_paths(
        paths: impl IntoIterator<Item = PathBuf>,
        diagnostics: &mut Diagnostics,
    ) -> Self {
        let mut flats = Vec::new();
        for path in paths {
            match parse_flat_y_pos(&path) {
                Ok(y_pos) => flats.push(FlatFile { y_pos, path }),
                Err(reason) => diagnostics.push(ScanIssue::UnparsableFlat { path, reason }),
            }
        }
        flats.sort();
        Self { flats }
    }

    pub fn get(&self, index: usize) -> Option<&FlatFile> {
        self.flats.get(index)
    }

    pub fn len(&self) -> usize {
        self.flats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flats.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlatFile> {
        self.flats.iter()
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.flats.iter().position(|f| f.path == path)
    }

    /// [`Self::index_of`], falling back to a bare file name that names exactly
    /// one catalog flat.
    pub fn resolve(&self, path: &Path) -> Option<usize> {
        if let Some(index) = self.index_of(path) {
            return Some(index);
        }
        if path.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
            return None;
        }
        let name = path.file_name()?;
        let mut matches = self
            .flats
            .iter()
            .enumerate()
            .filter(|(_, f)| f.path.file_name() == Some(name));
        match (matches.next(), matches.next()) {
            (Some((index, _)), None) => Some(index),
            _ => None,
        }
    }

    /// Index of the flat nearest to `y_pos` (binary search). On a tie the
    /// lower Y wins, and among flats sharing a Y the first in catalog order.
    pub fn nearest(&self, y_pos: i64) -> Option<usize> {
        let split = self.flats.partition_point(|f| f.y_pos < y_pos);
        let below = split.checked_sub(1);
        let above = (split < self.flats.len()).then_some(split);

        let best = match (below, above) {
            (Some(b), Some(a)) => {
                if y_pos.abs_diff(self.flats[b].y_pos) <= self.flats[a].y_pos.abs_diff(y_pos) {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        let best_y = self.flats[best].y_pos;
        Some(self.flats.partition_point(|f| f.y_pos < best_y))
    }

    /// Distance in microns between flat `index` and `y_pos`.
    pub fn distance_microns(&self, index: usize, y_pos: i64) -> f64 {
        self.flats[index].y_pos.abs_diff(y_pos) as f64 / 10.0
    }

    /// [`Self::nearest`], if no farther than `tolerance_microns` (inclusive).
    pub fn nearest_within(&self, y_pos: i64, tolerance_microns: f64) -> Option<usize> {
        self.nearest(y_pos)
            .filter(|&idx| self.distance_microns(idx, y_pos) <= tolerance_microns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_flats;
    use tempfile::TempDir;

    fn catalog(ys: &[i64]) -> FlatCatalog {
        let paths = ys
            .iter()
            .enumerate()
            .map(|(i, y)| PathBuf::from(format!("/flats/FLAT_{y}_{i}.tif")));
        FlatCatalog::from_paths(paths, &mut Diagnostics::new())
    }

    #[test]
    fn test_parse_flat_y_pos() {
        assert_eq!(
            parse_flat_y_pos(Path::new("/f/FLAT_1050_101519.tif")),
            Ok(1050)
        );
        assert_eq!(parse_flat_y_pos(Path::new("y-200_flat.tif")), Ok(-200));
        assert_eq!(parse_flat_y_pos(Path::new("Y300.tiff")), Ok(300));
        assert!(parse_flat_y_pos(Path::new("flat_left.tif")).is_err());
    }

    #[test]
    fn test_catalog_is_sorted_by_y() {
        let catalog = catalog(&[6000, 1050, 3000]);
        let ys: Vec<i64> = catalog.iter().map(|f| f.y_pos).collect();
        assert_eq!(ys, vec![1050, 3000, 6000]);
    }

    #[test]
    fn test_unparsable_names_are_reported() {
        let mut diagnostics = Diagnostics::new();
        let catalog = FlatCatalog::from_paths(
            vec![
                PathBuf::from("/flats/FLAT_100_1.tif"),
                PathBuf::from("/flats/FLAT_left.tif"),
            ],
            &mut diagnostics,
        );
        assert_eq!(catalog.len(), 1);
        assert!(matches!(
            diagnostics.issues(),
            [ScanIssue::UnparsableFlat { .. }]
        ));
    }

    #[test]
    fn test_nearest_matches_linear_scan() {
        let catalog = catalog(&[-500, 0, 1050, 1050, 3000, 6000]);
        for y in -1000..7000 {
            let nearest = catalog.nearest(y).unwrap();
            let best_distance = catalog.iter().map(|f| f.y_pos.abs_diff(y)).min().unwrap();
            let first_best = catalog
                .iter()
                .position(|f| f.y_pos.abs_diff(y) == best_distance)
                .unwrap();
            assert_eq!(nearest, first_best, "y = {y}");
        }
    }

    #[test]
    fn test_nearest_tie_prefers_lower_y() {
        let catalog = catalog(&[1000, 2000]);
        assert_eq!(catalog.get(catalog.nearest(1500).unwrap()).unwrap().y_pos, 1000);
    }

    #[test]
    fn test_nearest_within_tolerance_is_inclusive() {
        let catalog = catalog(&[1050, 6000]);
        // Tenths of a micron: 1000 -> 1050 is 5 um.
        assert_eq!(catalog.nearest_within(1000, 5.0), Some(0));
        assert_eq!(catalog.nearest_within(1000, 4.9), None);
        // 5000 -> 6000 is 100 um.
        assert_eq!(catalog.nearest_within(5000, 100.0), Some(1));
        assert_eq!(catalog.nearest_within(5000, 50.0), None);
    }

    #[test]
    fn test_resolve_by_path_or_unique_name() {
        let paths = [
            "/flats/FLAT_1050_1.tif",
            "/flats/FLAT_3000_1.tif",
            "/other/FLAT_3000_1.tif",
        ]
        .map(PathBuf::from);
        let catalog = FlatCatalog::from_paths(paths, &mut Diagnostics::new());

        assert_eq!(catalog.resolve(Path::new("/flats/FLAT_3000_1.tif")), Some(1));
        assert_eq!(catalog.resolve(Path::new("FLAT_1050_1.tif")), Some(0));
        // Two flats share the name.
        assert_eq!(catalog.resolve(Path::new("FLAT_3000_1.tif")), None);
        // A directory that is not in the catalog is not a name lookup.
        assert_eq!(catalog.resolve(Path::new("/elsewhere/FLAT_1050_1.tif")), None);
        assert_eq!(catalog.resolve(Path::new("FLAT_6000_1.tif")), None);
    }

    #[test]
    fn test_empty_catalog_has_no_nearest() {
        assert_eq!(FlatCatalog::default().nearest(10), None);
    }

    #[test]
    fn test_from_glob() {
        let dir = TempDir::new().unwrap();
        make_flats(dir.path(), &[3000, 1050]);
        std::fs::write(dir.path().join("FLAT_nopos.tif"), b"").unwrap();
        std::fs::create_dir(dir.path().join("FLAT_999_dir.tif")).unwrap();

        let pattern = format!("{}/FLAT_*.tif", dir.path().display());
        let mut diagnostics = Diagnostics::new();
        let catalog = FlatCatalog::from_glob(&pattern, &mut diagnostics).unwrap();

        let ys: Vec<i64> = catalog.iter().map(|f| f.y_pos).collect();
        assert_eq!(ys, vec![1050, 3000]);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            catalog.index_of(&dir.path().join("FLAT_3000_101519.tif")),
            Some(1)
        );
    }

    #[test]
    fn test_glob_without_matches_is_reported() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.tif", dir.path().display());
        let mut diagnostics = Diagnostics::new();
        let catalog = FlatCatalog::from_glob(&pattern, &mut diagnostics).unwrap();

        assert!(catalog.is_empty());
        assert!(matches!(
            diagnostics.issues(),
            [ScanIssue::GlobExpansion { .. }]
        ));
    }

    #[test]
    fn test_invalid_glob_is_an_error() {
        let result = FlatCatalog::from_glob("/flats/[*.tif", &mut Diagnostics::new());
        assert!(matches!(result, Err(Error::InvalidGlob { .. })));
    }
}
