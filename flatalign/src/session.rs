use std::path::PathBuf;
use std::sync::Arc;

use common::Rect;

use crate::alignment::AlignmentState;
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::flat_catalog::FlatCatalog;
use crate::plane::PlaneSource;
use crate::position_index::{PositionIndex, StagePosition};
use crate::preview::MosaicPreview;
use crate::script::{ScriptCompiler, ScriptParams};

/// One alignment session: the scanned acquisition, its flat assignments and
/// everything needed to compile scripts.
///
/// The session is the single writer of the [`AlignmentState`]; previews and
/// compilers borrow it read-only for the duration of one call.
#[derive(Debug)]
pub struct Session {
    config: Config,
    image_dirs: Vec<PathBuf>,
    index: PositionIndex,
    state: AlignmentState,
    diagnostics: Diagnostics,
    params: ScriptParams,
}

impl Session {
    /// Scans `image_dirs` (the first is the display root), expands the flat
    /// glob and auto-assigns flats. Skipped entries end up in
    /// [`Session::diagnostics`], unreadable roots included; only a bad glob
    /// or an acquisition without a single valid stack fails.
    pub fn load(image_dirs: &[PathBuf], config: Config) -> Result<Self> {
        config.validate()?;
        let Some(first_dir) = image_dirs.first() else {
            return Err(Error::NoStacks);
        };

        let mut diagnostics = Diagnostics::new();
        let index = PositionIndex::scan(image_dirs, &mut diagnostics);
        if index.is_empty() {
            return Err(Error::NoStacks);
        }

        let catalog = FlatCatalog::from_glob(&config.flat_files, &mut diagnostics)?;
        let state = AlignmentState::initialize(
            &index,
            Arc::new(catalog),
            config.tolerance,
            &mut diagnostics,
        );
        let params = ScriptParams::from_config(&config, config.resolved_output_dir(first_dir));

        tracing::info!(
            "Loaded {} stacks from {} channels, {} flats, {} scan issues",
            index.len(),
            index.channels().len(),
            state.catalog().len(),
            diagnostics.len()
        );

        Ok(Self {
            config,
            image_dirs: image_dirs.to_vec(),
            index,
            state,
            diagnostics,
            params,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn image_dirs(&self) -> &[PathBuf] {
        &self.image_dirs
    }

    pub fn index(&self) -> &PositionIndex {
        &self.index
    }

    pub fn state(&self) -> &AlignmentState {
        &self.state
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn script_params(&self) -> &ScriptParams {
        &self.params
    }

    /// `(z_index, key)` pairs offered by the z chooser.
    pub fn z_choices(&self) -> Vec<(usize, String)> {
        self.index.z_choices(self.config.max_z_choices)
    }

    pub fn preview<S: PlaneSource>(&self, source: S) -> MosaicPreview<S> {
        MosaicPreview::new(
            source,
            &self.index,
            self.config.xy_voxel_size,
            self.config.dark,
            self.config.max_concurrent_decodes,
        )
    }

    pub fn set_offset(&mut self, position: StagePosition, y_offset_microns: f64) -> Result<()> {
        self.state.set_offset(position, y_offset_microns)
    }

    pub fn set_flat(&mut self, position: StagePosition, flat: Option<usize>) -> Result<()> {
        self.state.set_flat(position, flat)
    }

    pub fn reset(&mut self, position: StagePosition) -> Result<()> {
        self.state.reset(position)
    }

    /// Applies a vertical drag of `dy_pixels` on a tile: the drag is scaled
    /// to microns, added to the stack's offset, and only that tile is
    /// recomposited. Returns the repainted rectangle.
    pub fn drag<S: PlaneSource>(
        &mut self,
        preview: &mut MosaicPreview<S>,
        position: StagePosition,
        dy_pixels: f64,
    ) -> Result<Option<Rect>> {
        let current = self
            .state
            .record(&position)
            .ok_or(Error::UnknownStack { position })?
            .y_offset_microns;
        let offset = current + dy_pixels * preview.xy_voxel_size();
        self.state.set_offset(position, offset)?;
        tracing::debug!("Stack {position}: y offset {current} -> {offset} um");
        preview.refresh_tile(position, &self.state)
    }

    /// Changes the pixel size for both scripts and `preview`. Stored offsets
    /// are untouched.
    pub fn set_xy_voxel_size<S: PlaneSource>(
        &mut self,
        xy_voxel_size: f64,
        preview: &mut MosaicPreview<S>,
    ) -> Result<()> {
        let mut config = self.config.clone();
        config.xy_voxel_size = xy_voxel_size;
        config.validate()?;

        self.config = config;
        self.params.xy_voxel_size = xy_voxel_size;
        preview.set_xy_voxel_size(xy_voxel_size, &self.state);
        Ok(())
    }

    pub fn compiler(&self) -> ScriptCompiler<'_> {
        ScriptCompiler::new(&self.index, &self.state, &self.params)
    }

    pub fn write_scripts(&self) -> Result<Vec<PathBuf>> {
        self.compiler().write_all()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::diagnostics::ScanIssue;
    use crate::plane::{read_flat_profile, FilePlaneSource};
    use crate::testing::{make_flats, make_stack, FLAT_PROFILE};

    const MATCHED: StagePosition = StagePosition::new(0, 0);
    const BELOW: StagePosition = StagePosition::new(0, 72);

    fn config_for(dir: &Path) -> Config {
        Config {
            flat_files: format!("{}/flats/*.tif", dir.display()),
            output_dir: Some(dir.join("out")),
            ..Config::default()
        }
    }

    fn load() -> (TempDir, Session) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("488");
        make_stack(&root, 0, 0, &["0", "1"], "raw");
        make_stack(&root, 0, 72, &["0", "1"], "raw");
        make_flats(&dir.path().join("flats"), &[0]);

        let session = Session::load(&[root], config_for(dir.path())).unwrap();
        (dir, session)
    }

    #[test]
    fn test_load_scans_and_assigns() {
        let (_dir, session) = load();

        assert_eq!(session.index().len(), 2);
        assert_eq!(session.state().catalog().len(), 1);
        assert_eq!(session.state().record(&MATCHED).unwrap().flat, Some(0));
        assert_eq!(session.state().record(&BELOW).unwrap().y_offset_microns, 7.2);
        assert!(session.diagnostics().is_empty());
        assert_eq!(session.z_choices(), vec![(0, "0".to_string()), (1, "1".to_string())]);
    }

    #[test]
    fn test_load_without_stacks_fails() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("empty");
        std::fs::create_dir_all(root.join("not_a_stack")).unwrap();

        let result = Session::load(&[root], config_for(dir.path()));
        assert!(matches!(result, Err(Error::NoStacks)));
        assert!(matches!(
            Session::load(&[], Config::default()),
            Err(Error::NoStacks)
        ));
    }

    #[test]
    fn test_load_survives_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("488");
        make_stack(&root, 0, 0, &["0"], "raw");
        make_flats(&dir.path().join("flats"), &[0]);
        let missing = dir.path().join("561_typo");

        let session = Session::load(&[root, missing.clone()], config_for(dir.path())).unwrap();

        assert_eq!(session.index().len(), 1);
        assert!(matches!(
            session.diagnostics().issues(),
            [ScanIssue::UnreadableRoot { path, .. }] if *path == missing
        ));

        let only_missing = Session::load(&[missing], config_for(dir.path()));
        assert!(matches!(only_missing, Err(Error::NoStacks)));
    }

    #[test]
    fn test_load_with_empty_glob_leaves_stacks_uncorrected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("488");
        make_stack(&root, 0, 0, &["0"], "raw");

        let session = Session::load(&[root], config_for(dir.path())).unwrap();
        assert_eq!(session.state().record(&MATCHED).unwrap().flat, None);
        assert!(session
            .diagnostics()
            .issues()
            .iter()
            .any(|issue| matches!(issue, ScanIssue::GlobExpansion { .. })));
    }

    #[test]
    fn test_drag_moves_tile_and_records_offset() {
        let (_dir, mut session) = load();
        let mut preview = session.preview(FilePlaneSource);
        preview.render(0, session.state());
        let before = preview.mosaic().unwrap().tile(&MATCHED).unwrap().rect;

        let dirty = session.drag(&mut preview, MATCHED, 2.0).unwrap();

        let record = session.state().record(&MATCHED).unwrap();
        assert!(record.manual);
        assert!((record.y_offset_microns - 3.6).abs() < 1e-9);
        let after = preview.mosaic().unwrap().tile(&MATCHED).unwrap().rect;
        assert_eq!(after.y, before.y + 2);
        assert!(dirty.is_some());
    }

    #[test]
    fn test_drag_unknown_stack() {
        let (_dir, mut session) = load();
        let mut preview = session.preview(FilePlaneSource);
        let missing = StagePosition::new(5, 5);

        assert!(matches!(
            session.drag(&mut preview, missing, 1.0),
            Err(Error::UnknownStack { position }) if position == missing
        ));
    }

    #[test]
    fn test_set_xy_voxel_size_keeps_offsets() {
        let (_dir, mut session) = load();
        let mut preview = session.preview(FilePlaneSource);
        session.set_offset(BELOW, 9.0).unwrap();

        session.set_xy_voxel_size(0.9, &mut preview).unwrap();

        assert_eq!(session.state().record(&BELOW).unwrap().y_offset_microns, 9.0);
        assert_eq!(session.script_params().xy_voxel_size, 0.9);
        assert_eq!(preview.xy_voxel_size(), 0.9);
        assert!(matches!(
            session.set_xy_voxel_size(0.0, &mut preview),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(session.config().xy_voxel_size, 0.9);
    }

    #[test]
    fn test_write_scripts() {
        let (dir, session) = load();
        let written = session.write_scripts().unwrap();

        let out = dir.path().join("out");
        assert_eq!(
            written,
            vec![
                out.join("flats").join("0_0.tif"),
                out.join("flats").join("0_72.tif"),
                out.join("488_run_pystripe.sh"),
            ]
        );
        let text = std::fs::read_to_string(&written[2]).unwrap();
        assert_eq!(text.matches("pystripe --input").count(), 2);
        assert!(text.contains("/flats/0_72.tif"));

        // 7.2 um at 1.8 um/px pushes the whole 3-row profile down past the tile.
        let shifted = read_flat_profile(&written[1]).unwrap();
        assert_eq!(shifted, vec![FLAT_PROFILE[0]; 3]);
    }
}
