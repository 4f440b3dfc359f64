//! Stage-position index of an acquisition tree.
//!
//! Layout on disk: `<root>/<x_pos>/<x_pos>_<y_pos>/<z>.{tif,tiff,raw}`, with
//! positions in integer tenths of a micron.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use common::file_utils::{
    file_name_str, files_with_extensions, subdirectories, RAW_EXTENSIONS, TIFF_EXTENSIONS,
};
use common::parallel::par_map_limited;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostics, ScanIssue};
use crate::error::{Error, Result};

/// Root directories scanned at once.
const MAX_CONCURRENT_ROOTS: usize = 4;

/// Stage coordinate of a stack in tenths of a micron. Orders by x, then y.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StagePosition {
    pub x_pos: i64,
    pub y_pos: i64,
}

impl StagePosition {
    pub const fn new(x_pos: i64, y_pos: i64) -> Self {
        Self { x_pos, y_pos }
    }

    #[inline]
    pub fn x_microns(&self) -> f64 {
        self.x_pos as f64 / 10.0
    }

    #[inline]
    pub fn y_microns(&self) -> f64 {
        self.y_pos as f64 / 10.0
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.x_pos, self.y_pos)
    }
}

impl FromStr for StagePosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_stack_dir_name(s).map_err(|_| Error::InvalidPosition(s.to_string()))
    }
}

/// Parses a `<x_pos>_<y_pos>` stack directory name.
pub fn parse_stack_dir_name(name: &str) -> std::result::Result<StagePosition, String> {
    let (x, y) = name
        .split_once('_')
        .ok_or_else(|| format!("'{name}' is not of the form <x_pos>_<y_pos>"))?;
    let x_pos = x
        .parse::<i64>()
        .map_err(|_| format!("x position '{x}' is not an integer"))?;
    let y_pos = y
        .parse::<i64>()
        .map_err(|_| format!("y position '{y}' is not an integer"))?;
    Ok(StagePosition::new(x_pos, y_pos))
}

/// One z-plane file. `key` is the file stem, e.g. `"012340"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZPlane {
    pub key: String,
    pub path: PathBuf,
}

impl ZPlane {
    fn from_path(path: PathBuf) -> Self {
        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Self { key, path }
    }
}

/// Numeric keys first, in numeric order; anything else after, lexically.
fn plane_order(a: &ZPlane, b: &ZPlane) -> Ordering {
    match (a.key.parse::<i64>(), b.key.parse::<i64>()) {
        (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num).then_with(|| a.key.cmp(&b.key)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.key.cmp(&b.key),
    }
}

/// The z-planes acquired at one (x, y) stage position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackCoordinate {
    pub position: StagePosition,
    /// Acquisition root (channel directory) this stack was found under.
    pub root: PathBuf,
    pub x_dir: String,
    pub xy_dir: String,
    /// Planes ordered by depth.
    pub planes: Vec<ZPlane>,
}

impl StackCoordinate {
    /// Stack directory, `<root>/<x_dir>/<xy_dir>`.
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.x_dir).join(&self.xy_dir)
    }

    /// Stack directory relative to its root.
    pub fn relative_dir(&self) -> PathBuf {
        Path::new(&self.x_dir).join(&self.xy_dir)
    }

    pub fn plane(&self, z_index: usize) -> Option<&ZPlane> {
        self.planes.get(z_index)
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }
}

struct StackCandidate {
    position: StagePosition,
    x_dir: String,
    xy_dir: String,
    path: PathBuf,
    tiffs: Vec<PathBuf>,
    raws: Vec<PathBuf>,
}

/// Stacks of one acquisition root. Each root is one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIndex {
    pub name: String,
    pub root: PathBuf,
    pub stacks: BTreeMap<StagePosition, StackCoordinate>,
}

impl ChannelIndex {
    /// Scans one root. Malformed and empty stack directories are reported to
    /// `diagnostics` and skipped; only an unreadable root is an error.
    ///
    /// TIFF planes are preferred: `.raw` files are used only when the root
    /// holds no TIFF planes at all.
    pub fn scan(root: &Path, diagnostics: &mut Diagnostics) -> Result<Self> {
        let name = file_name_str(root)
            .map(str::to_string)
            .unwrap_or_else(|| root.display().to_string());

        let mut candidates = Vec::new();
        for x_path in subdirectories(root).map_err(|e| Error::io(root, e))? {
            let Some(x_dir) = file_name_str(&x_path).map(str::to_string) else {
                diagnostics.push(ScanIssue::MalformedPath {
                    path: x_path,
                    reason: "directory name is not valid UTF-8".to_string(),
                });
                continue;
            };
            let Ok(x_pos) = x_dir.parse::<i64>() else {
                diagnostics.push(ScanIssue::MalformedPath {
                    path: x_path,
                    reason: format!("'{x_dir}' is not an integer x position"),
                });
                continue;
            };

            let xy_paths = match subdirectories(&x_path) {
                Ok(paths) => paths,
                Err(e) => {
                    diagnostics.push(ScanIssue::MalformedPath {
                        path: x_path,
                        reason: format!("unreadable: {e}"),
                    });
                    continue;
                }
            };

            for xy_path in xy_paths {
                if let Some(candidate) = Self::stack_candidate(&xy_path, &x_dir, x_pos, diagnostics)
                {
                    candidates.push(candidate);
                }
            }
        }

        let use_tiff = candidates.iter().any(|c| !c.tiffs.is_empty());
        let mut stacks: BTreeMap<StagePosition, StackCoordinate> = BTreeMap::new();
        for candidate in candidates {
            let files = if use_tiff {
                candidate.tiffs
            } else {
                candidate.raws
            };
            if files.is_empty() {
                diagnostics.push(ScanIssue::EmptyStack {
                    path: candidate.path,
                });
                continue;
            }
            if let Some(existing) = stacks.get(&candidate.position) {
                diagnostics.push(ScanIssue::DuplicateStack {
                    position: candidate.position,
                    path: candidate.path,
                    existing: existing.dir(),
                });
                continue;
            }

            let mut planes: Vec<ZPlane> = files.into_iter().map(ZPlane::from_path).collect();
            planes.sort_by(plane_order);
            stacks.insert(
                candidate.position,
                StackCoordinate {
                    position: candidate.position,
                    root: root.to_path_buf(),
                    x_dir: candidate.x_dir,
                    xy_dir: candidate.xy_dir,
                    planes,
                },
            );
        }

        tracing::info!(
            "Indexed {} stacks in {} ({} planes each at most)",
            stacks.len(),
            root.display(),
            stacks.values().map(StackCoordinate::len).max().unwrap_or(0)
        );

        Ok(Self {
            name,
            root: root.to_path_buf(),
            stacks,
        })
    }

    fn stack_candidate(
        xy_path: &Path,
        x_dir: &str,
        x_pos: i64,
        diagnostics: &mut Diagnostics,
    ) -> Option<StackCandidate> {
        let Some(xy_dir) = file_name_str(xy_path) else {
            diagnostics.push(ScanIssue::MalformedPath {
                path: xy_path.to_path_buf(),
                reason: "directory name is not valid UTF-8".to_string(),
            });
            return None;
        };
        let position = match parse_stack_dir_name(xy_dir) {
            Ok(position) => position,
            Err(reason) => {
                diagnostics.push(ScanIssue::MalformedPath {
                    path: xy_path.to_path_buf(),
                    reason,
                });
                return None;
            }
        };
        if position.x_pos != x_pos {
            diagnostics.push(ScanIssue::MalformedPath {
                path: xy_path.to_path_buf(),
                reason: format!("x position {} does not match parent '{x_dir}'", position.x_pos),
            });
            return None;
        }

        let listing = files_with_extensions(xy_path, TIFF_EXTENSIONS)
            .and_then(|tiffs| Ok((tiffs, files_with_extensions(xy_path, RAW_EXTENSIONS)?)));
        match listing {
            Ok((tiffs, raws)) => Some(StackCandidate {
                position,
                x_dir: x_dir.to_string(),
                xy_dir: xy_dir.to_string(),
                path: xy_path.to_path_buf(),
                tiffs,
                raws,
            }),
            Err(e) => {
                diagnostics.push(ScanIssue::MalformedPath {
                    path: xy_path.to_path_buf(),
                    reason: format!("unreadable: {e}"),
                });
                None
            }
        }
    }

    pub fn get(&self, position: &StagePosition) -> Option<&StackCoordinate> {
        self.stacks.get(position)
    }
}

/// Merged view over all roots.
///
/// On a coordinate collision the earliest root wins exclusively: the later
/// root's stack is not merged into the displayed one, but it stays in its own
/// [`ChannelIndex`] for that channel's script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionIndex {
    channels: Vec<ChannelIndex>,
    /// Position -> index of the channel whose stack is displayed.
    display: BTreeMap<StagePosition, usize>,
}

impl PositionIndex {
    /// Scans `roots` (concurrently) and merges them in the order given. A root
    /// that cannot be read is reported as [`ScanIssue::UnreadableRoot`] and
    /// skipped, so the result may be empty.
    pub fn scan(roots: &[PathBuf], diagnostics: &mut Diagnostics) -> Self {
        let scanned = par_map_limited(roots, MAX_CONCURRENT_ROOTS, |root| {
            let mut local = Diagnostics::new();
            ChannelIndex::scan(root, &mut local).map(|channel| (channel, local))
        });

        let mut channels = Vec::with_capacity(scanned.len());
        for (root, result) in roots.iter().zip(scanned) {
            match result {
                Ok((channel, local)) => {
                    diagnostics.extend_quiet(local.issues().to_vec());
                    channels.push(channel);
                }
                Err(e) => diagnostics.push(ScanIssue::UnreadableRoot {
                    path: root.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        Self::from_channels(channels, diagnostics)
    }

    /// Merges already scanned channels, earliest first.
    pub fn from_channels(mut channels: Vec<ChannelIndex>, diagnostics: &mut Diagnostics) -> Self {
        let mut seen_names: Vec<String> = Vec::new();
        for (idx, channel) in channels.iter_mut().enumerate() {
            if seen_names.contains(&channel.name) {
                channel.name = format!("{}_{}", channel.name, idx + 1);
            }
            seen_names.push(channel.name.clone());
        }

        let mut display: BTreeMap<StagePosition, usize> = BTreeMap::new();
        for (idx, channel) in channels.iter().enumerate() {
            for (position, stack) in &channel.stacks {
                match display.get(position) {
                    None => {
                        display.insert(*position, idx);
                    }
                    Some(&owner) => diagnostics.push(ScanIssue::DuplicateStack {
                        position: *position,
                        path: stack.dir(),
                        existing: channels[owner].stacks[position].dir(),
                    }),
                }
            }
        }

        Self { channels, display }
    }

    /// The displayed stack at `position`.
    pub fn get(&self, position: &StagePosition) -> Option<&StackCoordinate> {
        let owner = *self.display.get(position)?;
        self.channels[owner].stacks.get(position)
    }

    pub fn contains(&self, position: &StagePosition) -> bool {
        self.display.contains_key(position)
    }

    /// Displayed positions in (x, y) order.
    pub fn positions(&self) -> impl Iterator<Item = StagePosition> + '_ {
        self.display.keys().copied()
    }

    /// Displayed stacks in (x, y) order.
    pub fn stacks(&self) -> impl Iterator<Item = &StackCoordinate> + '_ {
        self.display
            .iter()
            .map(|(position, &owner)| &self.channels[owner].stacks[position])
    }

    pub fn len(&self) -> usize {
        self.display.len()
    }

    pub fn is_empty(&self) -> bool {
        self.display.is_empty()
    }

    pub fn channels(&self) -> &[ChannelIndex] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelIndex> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Distinct x positions, ascending.
    pub fn x_positions(&self) -> Vec<i64> {
        let mut xs: Vec<i64> = self.display.keys().map(|p| p.x_pos).collect();
        xs.dedup();
        xs
    }

    /// Distinct y positions, ascending.
    pub fn y_positions(&self) -> Vec<i64> {
        let mut ys: Vec<i64> = self.display.keys().map(|p| p.y_pos).collect();
        ys.sort_unstable();
        ys.dedup();
        ys
    }

    /// Most planes in any displayed stack.
    pub fn max_planes(&self) -> usize {
        self.stacks().map(StackCoordinate::len).max().unwrap_or(0)
    }

    /// Z planes offered for display as `(z_index, key)`, taken from the first
    /// stack of the display root. Long stacks are thinned to roughly
    /// `max_choices` entries once they exceed twice that.
    pub fn z_choices(&self, max_choices: usize) -> Vec<(usize, String)> {
        let first = self
            .channels
            .first()
            .and_then(|c| c.stacks.values().next())
            .or_else(|| self.stacks().next());
        let Some(stack) = first else {
            return Vec::new();
        };

        let stride = if max_choices > 0 && stack.len() > 2 * max_choices {
            stack.len() / max_choices
        } else {
            1
        };
        stack
            .planes
            .iter()
            .enumerate()
            .step_by(stride)
            .map(|(idx, plane)| (idx, plane.key.clone()))
            .collect()
    }
}
