use std::path::Path;

use anyhow::Result;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "flatalign";

pub fn init(log_level: &str) -> Result<()> {
    common::log_setup::setup_logging(log_level, Path::new(LOG_DIR), LOG_FILE_PREFIX)
}
