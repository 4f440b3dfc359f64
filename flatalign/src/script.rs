//! Per-channel destripe script generation.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use common::Buffer2;

use crate::alignment::{AlignmentRecord, AlignmentState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::plane::{read_flat_profile, read_plane_dimensions, shifted_divisor, write_flat_tiff};
use crate::position_index::{ChannelIndex, PositionIndex, StackCoordinate, StagePosition};

/// External correction command.
const PYSTRIPE: &str = "pystripe";

/// Directory under the output root holding one shifted flat per stack.
const SHIFTED_FLAT_DIR: &str = "flats";

/// Continuation between the arguments of one invocation.
const ARG_SEPARATOR: &str = " \\\n    ";

/// Processing parameters that end up in every invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptParams {
    pub xy_voxel_size: f64,
    pub dark: u16,
    /// Copied verbatim after the generated arguments.
    pub pystripe_args: String,
    /// Root for scripts and `<channel>_destriped` output trees.
    pub output_dir: PathBuf,
    pub script_name: String,
}

impl ScriptParams {
    pub fn from_config(config: &Config, output_dir: PathBuf) -> Self {
        Self {
            xy_voxel_size: config.xy_voxel_size,
            dark: config.dark,
            pystripe_args: config.pystripe_args.clone(),
            output_dir,
            script_name: config.script_name.clone(),
        }
    }
}

/// Turns the current alignment into one shell script per channel.
///
/// pystripe has no offset argument, so each flat-corrected stack gets its own
/// flat: the assigned flat's profile shifted down by the stack's Y offset and
/// written to [`ScriptCompiler::shifted_flat_path`]. The invocation points
/// `--flat` there. Compilation only reads its inputs; the same state always
/// yields the same bytes. Stacks are listed in (x, y) order of the merged index, and every
/// merged coordinate appears exactly once per script: as a flat-corrected
/// invocation, a pass-through invocation, or a comment when the channel did
/// not acquire it.
pub struct ScriptCompiler<'a> {
    index: &'a PositionIndex,
    state: &'a AlignmentState,
    params: &'a ScriptParams,
}

impl<'a> ScriptCompiler<'a> {
    pub fn new(index: &'a PositionIndex, state: &'a AlignmentState, params: &'a ScriptParams) -> Self {
        Self {
            index,
            state,
            params,
        }
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.index.channels().iter().map(|c| c.name.as_str())
    }

    /// `<output_dir>/<channel>_<script_name>`.
    pub fn script_path(&self, channel: &str) -> PathBuf {
        self.params
            .output_dir
            .join(format!("{channel}_{}", self.params.script_name))
    }

    /// Where the corrected planes of `stack` are written.
    pub fn stack_output_dir(&self, channel: &str, stack: &StackCoordinate) -> PathBuf {
        self.params
            .output_dir
            .join(format!("{channel}_destriped"))
            .join(stack.relative_dir())
    }

    /// `<output_dir>/flats/<x>_<y>.tif`, shared by every channel's stack at
    /// `position`.
    pub fn shifted_flat_path(&self, position: StagePosition) -> PathBuf {
        self.params
            .output_dir
            .join(SHIFTED_FLAT_DIR)
            .join(format!("{position}.tif"))
    }

    pub fn compile(&self, channel: &str) -> Result<String> {
        let channel = self
            .index
            .channel(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))?;

        let mut script = String::new();
        script.push_str("#!/bin/sh\n");
        let _ = writeln!(script, "# Destripe script for channel '{}'.", channel.name);
        let _ = writeln!(
            script,
            "# xy voxel size {} um, dark {}.",
            self.params.xy_voxel_size, self.params.dark
        );
        script.push_str("set -e\n");

        for position in self.index.positions() {
            script.push('\n');
            let (Some(stack), Some(record)) =
                (channel.get(&position), self.state.record(&position))
            else {
                let _ = writeln!(script, "# {position}: not acquired in this channel");
                continue;
            };
            self.write_stack(&mut script, channel, stack, record);
        }

        Ok(script)
    }

    fn write_stack(
        &self,
        script: &mut String,
        channel: &ChannelIndex,
        stack: &StackCoordinate,
        record: &AlignmentRecord,
    ) {
        let output = self.stack_output_dir(&channel.name, stack);
        let mut args = vec![
            format!("{PYSTRIPE} --input {}", quote_path(&stack.dir())),
            format!("--output {}", quote_path(&output)),
        ];

        match record.flat.and_then(|idx| self.state.catalog().get(idx)) {
            Some(flat) => {
                let pixels = record.y_offset_pixels(self.params.xy_voxel_size);
                let _ = writeln!(
                    script,
                    "# {}: flat {}, y offset {} um ({pixels} px){}",
                    stack.position,
                    flat.file_name(),
                    record.y_offset_microns,
                    if record.manual { ", manual" } else { "" },
                );
                let shifted = self.shifted_flat_path(stack.position);
                args.push(format!("--flat {}", quote_path(&shifted)));
            }
            None => {
                let _ = writeln!(
                    script,
                    "# {}: no flat assigned, pass-through",
                    stack.position
                );
            }
        }

        args.push(format!("--dark {}", self.params.dark));
        let extra = self.params.pystripe_args.trim();
        if !extra.is_empty() {
            args.push(extra.to_string());
        }

        script.push_str(&args.join(ARG_SEPARATOR));
        script.push('\n');
    }

    /// Writes the shifted flat of every stack with a flat assigned, sized
    /// like the stack's first plane with the profile repeated across columns.
    /// Each catalog flat is read once.
    pub fn write_shifted_flats(&self) -> Result<Vec<PathBuf>> {
        let dir = self.params.output_dir.join(SHIFTED_FLAT_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let mut profiles: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        let mut written = Vec::new();
        for record in self.state.records() {
            let Some((index, flat)) = record
                .flat
                .and_then(|idx| self.state.catalog().get(idx).map(|f| (idx, f)))
            else {
                continue;
            };
            let Some(stack) = self.index.get(&record.position) else {
                continue;
            };

            let profile = match profiles.entry(index) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(read_flat_profile(&flat.path)?),
            };
            let (width, height) = match stack.plane(0) {
                Some(plane) => read_plane_dimensions(&plane.path)?,
                None => (1, profile.len()),
            };
            let offset = record.y_offset_pixels(self.params.xy_voxel_size);
            let pixels = shifted_divisor(profile, offset, height)
                .into_iter()
                .flat_map(|d| std::iter::repeat(d).take(width))
                .collect();

            let path = self.shifted_flat_path(record.position);
            write_flat_tiff(&path, &Buffer2::new(width, height, pixels))?;
            tracing::debug!(
                "Stack {}: {} shifted by {offset} px",
                record.position,
                flat.file_name()
            );
            written.push(path);
        }
        tracing::info!("Wrote {} shifted flats to {}", written.len(), dir.display());
        Ok(written)
    }

    /// Writes the shifted flats, then every channel's script, marked
    /// executable. Returns the written paths: flats in stack order, then
    /// scripts in channel order.
    pub fn write_all(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.params.output_dir;
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let mut written = self.write_shifted_flats()?;
        for channel in self.channel_names() {
            let text = self.compile(channel)?;
            let path = self.script_path(channel);
            std::fs::write(&path, text).map_err(|e| Error::io(&path, e))?;
            make_executable(&path)?;
            tracing::info!("Wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o775))
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Quotes `value` for a POSIX shell. Plain words are left as they are.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::flat_catalog::FlatCatalog;
    use crate::testing::{make_flats, make_stack};

    const MATCHED: StagePosition = StagePosition::new(200, 1000);
    const UNMATCHED: StagePosition = StagePosition::new(200, 5000);

    struct Fixture {
        dir: TempDir,
        index: PositionIndex,
        state: AlignmentState,
        params: ScriptParams,
    }

    /// Channel "488" has both stacks, channel "561" only the matched one.
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("488");
        let second = dir.path().join("561");
        make_stack(&first, 200, 1000, &["0"], "raw");
        make_stack(&first, 200, 5000, &["0"], "raw");
        make_stack(&second, 200, 1000, &["0"], "raw");
        let flats = make_flats(&dir.path().join("flats"), &[1050, 6000]);

        let mut diagnostics = Diagnostics::new();
        let index = PositionIndex::scan(&[first, second], &mut diagnostics);
        let catalog = FlatCatalog::from_paths(flats, &mut diagnostics);
        let state = AlignmentState::initialize(&index, Arc::new(catalog), 50.0, &mut diagnostics);
        let params = ScriptParams {
            xy_voxel_size: 0.5,
            dark: 100,
            pystripe_args: "--sigma1 256".to_string(),
            output_dir: dir.path().join("out"),
            script_name: "run_pystripe.sh".to_string(),
        };
        Fixture {
            dir,
            index,
            state,
            params,
        }
    }

    impl Fixture {
        fn compiler(&self) -> ScriptCompiler<'_> {
            ScriptCompiler::new(&self.index, &self.state, &self.params)
        }
    }

    #[test]
    fn test_manual_offset_compiles_to_pixels() {
        let mut f = fixture();
        f.state.set_offset(MATCHED, 10.0).unwrap();

        let script = f.compiler().compile("488").unwrap();
        let shifted = f.dir.path().join("out").join("flats").join("200_1000.tif");
        assert!(script.contains(&format!("--flat {} \\\n", quote_path(&shifted))), "{script}");
        assert!(script.contains("# 200_1000: flat FLAT_1050_101519.tif, y offset 10 um (20 px), manual"));
        assert!(!script.contains("--y-offset"));
    }

    #[test]
    fn test_auto_offset_and_arguments() {
        let f = fixture();
        let script = f.compiler().compile("488").unwrap();

        let input = f.dir.path().join("488").join("200").join("200_1000");
        let output = f.dir.path().join("out").join("488_destriped").join("200").join("200_1000");
        let flat = f.dir.path().join("out").join("flats").join("200_1000.tif");
        let expected = format!(
            "pystripe --input {} \\\n    --output {} \\\n    --flat {} \\\n    --dark 100 \\\n    --sigma1 256\n",
            quote_path(&input),
            quote_path(&output),
            quote_path(&flat),
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(&expected), "{script}");
    }

    #[test]
    fn test_unmatched_stack_is_pass_through() {
        let f = fixture();
        let script = f.compiler().compile("488").unwrap();

        assert!(script.contains("# 200_5000: no flat assigned, pass-through\n"));
        let pass_through = script
            .split("\n\n")
            .find(|block| block.starts_with("# 200_5000"))
            .unwrap();
        assert!(pass_through.contains("--input"));
        assert!(!pass_through.contains("--flat"));
        assert!(pass_through.contains("--dark 100"));
    }

    #[test]
    fn test_every_stack_appears_once_per_channel() {
        let f = fixture();
        let compiler = f.compiler();

        let first = compiler.compile("488").unwrap();
        assert_eq!(first.matches("pystripe --input").count(), 2);

        let second = compiler.compile("561").unwrap();
        assert_eq!(second.matches("pystripe --input").count(), 1);
        assert!(second.contains("# 200_5000: not acquired in this channel\n"));

        for script in [&first, &second] {
            for position in f.index.positions() {
                assert_eq!(script.matches(&format!("# {position}:")).count(), 1);
            }
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let f = fixture();
        let compiler = f.compiler();
        assert_eq!(compiler.compile("488").unwrap(), compiler.compile("488").unwrap());

        let rebuilt = ScriptCompiler::new(&f.index, &f.state, &f.params);
        assert_eq!(compiler.compile("561").unwrap(), rebuilt.compile("561").unwrap());
    }

    #[test]
    fn test_voxel_size_only_changes_pixel_conversion() {
        let mut f = fixture();
        f.state.set_offset(MATCHED, 9.0).unwrap();
        f.params.xy_voxel_size = 1.8;

        let script = f.compiler().compile("488").unwrap();
        assert!(script.contains("y offset 9 um (5 px), manual\n"), "{script}");
        assert_eq!(f.state.record(&MATCHED).unwrap().y_offset_microns, 9.0);
    }

    #[test]
    fn test_set_flat_none_forces_pass_through() {
        let mut f = fixture();
        f.state.set_flat(MATCHED, None).unwrap();

        let script = f.compiler().compile("488").unwrap();
        assert!(!script.contains("--flat"));
        assert_eq!(f.state.record(&UNMATCHED).unwrap().flat, None);
    }

    #[test]
    fn test_unknown_channel() {
        let f = fixture();
        assert!(matches!(
            f.compiler().compile("647"),
            Err(Error::UnknownChannel(name)) if name == "647"
        ));
    }

    #[test]
    fn test_write_all_writes_executable_scripts() {
        let f = fixture();
        let written = f.compiler().write_all().unwrap();

        let out = f.dir.path().join("out");
        assert_eq!(
            written,
            vec![
                out.join("flats").join("200_1000.tif"),
                out.join("488_run_pystripe.sh"),
                out.join("561_run_pystripe.sh"),
            ]
        );
        let text = std::fs::read_to_string(&written[1]).unwrap();
        assert_eq!(text, f.compiler().compile("488").unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&written[2]).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o775);
        }
    }

    #[test]
    fn test_shifted_flat_follows_offset() {
        let mut f = fixture();
        f.state.set_offset(MATCHED, 0.5).unwrap();

        let written = f.compiler().write_shifted_flats().unwrap();

        let shifted = f.compiler().shifted_flat_path(MATCHED);
        assert_eq!(written, vec![shifted.clone()]);
        assert_eq!(read_plane_dimensions(&shifted).unwrap(), (4, 3));
        // One pixel down, the top row repeated.
        assert_eq!(read_flat_profile(&shifted).unwrap(), vec![0.5, 0.5, 1.0]);

        // Auto offset of -10 px runs past the bottom of the 3-row profile.
        f.state.reset(MATCHED).unwrap();
        f.compiler().write_shifted_flats().unwrap();
        assert_eq!(read_flat_profile(&shifted).unwrap(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_missing_flat_fails_write_all() {
        let f = fixture();
        std::fs::remove_file(f.dir.path().join("flats").join("FLAT_1050_101519.tif")).unwrap();

        assert!(matches!(f.compiler().write_all(), Err(Error::Io { .. })));
        assert!(!f.compiler().script_path("488").exists());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/488/200/200_1000"), "/data/488/200/200_1000");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
