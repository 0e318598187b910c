//! CLI commands

use std::path::{Path, PathBuf};

use rudder_common::variables::VariableSet;

use crate::{Error, Result};

pub mod check_status;
pub mod discover;
pub mod run_script;

/// Load the deployment variables JSON file
pub fn load_variables(path: &Path) -> Result<VariableSet> {
    if !path.is_file() {
        return Err(Error::VariablesNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(VariableSet::from_json_file(path)?)
}

/// The given working directory, or the current one
pub fn resolve_working_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) if dir.is_dir() => Ok(dir),
        Some(dir) => Err(Error::validation(format!(
            "working directory {} does not exist",
            dir.display()
        ))),
        None => Ok(std::env::current_dir()?),
    }
}
