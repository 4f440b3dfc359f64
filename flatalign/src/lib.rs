//! Flatalign - flat-field alignment for tiled light-sheet acquisitions.
//!
//! Indexes a `<root>/<x>/<x>_<y>/<z>.{raw,tif}` acquisition tree into a
//! stage-position mosaic, pairs every stack with the nearest flat-field image
//! by Y stage position, keeps a per-stack Y offset (in microns) that the user
//! adjusts against a composited preview, and compiles the result into one
//! destripe shell script per acquisition channel.
//!
//! ```rust,ignore
//! use flatalign::{Config, Session};
//!
//! let session = Session::load(&["/data/Ex_488_Em_525".into()], Config::default())?;
//! for path in session.write_scripts()? {
//!     println!("wrote {}", path.display());
//! }
//! ```

mod alignment;
mod config;
mod diagnostics;
mod error;
mod flat_catalog;
pub mod plane;
mod position_index;
pub mod preview;
mod script;
mod session;

#[cfg(test)]
mod testing;

// ============================================================================
// Indexing
// ============================================================================

pub use position_index::{
    parse_stack_dir_name, ChannelIndex, PositionIndex, StackCoordinate, StagePosition, ZPlane,
};

pub use flat_catalog::{parse_flat_y_pos, FlatCatalog, FlatFile};

// ============================================================================
// Alignment state
// ============================================================================

pub use alignment::{microns_to_pixels, AlignmentRecord, AlignmentState};

// ============================================================================
// Preview, scripts and session glue
// ============================================================================

pub use preview::{CancelHandle, Mosaic, MosaicPreview, RenderOutcome, RenderProgress, TileBounds};
pub use script::{shell_quote, ScriptCompiler, ScriptParams};
pub use session::Session;

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{
    Config, DEFAULT_DARK, DEFAULT_FLAT_GLOB, DEFAULT_PYSTRIPE_ARGS, DEFAULT_SCRIPT_NAME,
};
pub use diagnostics::{Diagnostics, ScanIssue};
pub use error::{Error, Result};
