use crate::server::log::LogLevel;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1080;
pub const DEFAULT_BASE_PATH: &str = "/mockserver";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid base path \"{0}\": it must start with '/' and must not end with '/'")]
    InvalidBasePath(String),
    #[error("invalid liveness path \"{0}\": it must start with '/' and must not be under the base path \"{1}\"")]
    InvalidLivenessPath(String, String),
}

/// Server settings. Unset values fall back to the defaults below.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub ports: Vec<u16>,
    pub base_path: String,
    /// GET on this path answers like the status command. Disabled when `None`.
    pub liveness_path: Option<String>,
    pub log_level: LogLevel,
    pub max_expectations: usize,
    pub max_log_entries: usize,
    /// Every connection starts in proxy mode.
    pub proxy: bool,
    /// Listen on all interfaces instead of loopback only.
    pub expose: bool,
    pub initialization_json_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ports: vec![DEFAULT_PORT],
            base_path: DEFAULT_BASE_PATH.to_string(),
            liveness_path: None,
            log_level: LogLevel::Info,
            max_expectations: 5_000,
            max_log_entries: 60_000,
            proxy: false,
            expose: false,
            initialization_json_path: None,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), Error> {
        if !self.base_path.starts_with('/') || self.base_path.ends_with('/') {
            return Err(Error::InvalidBasePath(self.base_path.clone()));
        }

        if let Some(liveness_path) = &self.liveness_path {
            let under_base_path = liveness_path == &self.base_path
                || liveness_path.starts_with(&format!("{}/", self.base_path));
            if !liveness_path.starts_with('/') || under_base_path {
                return Err(Error::InvalidLivenessPath(
                    liveness_path.clone(),
                    self.base_path.clone(),
                ));
            }
        }

        Ok(())
    }
}
