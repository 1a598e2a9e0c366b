use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{Result, StoreError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "lockbox";
pub const APP_NAME: &str = "lockbox";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| StoreError::Validation("cannot determine data directory".to_string()))
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}
