use std::{io, path::Path};

use n0_error::{e, stack_error};

use crate::filter::AcceptConfig;

#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read accept file {path}")]
    Read {
        path: String,
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("invalid accept file {path}")]
    Parse {
        path: String,
        #[error(source, std_err)]
        source: serde_json::Error,
    },
}

impl AcceptConfig {
    /// Reads and compiles an accept file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read(path).map_err(|source| {
            e!(ConfigError::Read {
                path: display.clone(),
                source
            })
        })?;
        serde_json::from_slice(&raw).map_err(|source| {
            e!(ConfigError::Parse {
                path: display,
                source
            })
        })
    }

    /// Like [`AcceptConfig::load`], but a missing file yields empty rule lists.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            res => res,
        }
    }
}
