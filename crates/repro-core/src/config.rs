use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::epoch::Epoch;
use crate::outcome::ReproError;

pub(crate) const DEFAULT_PYTHON: &str = "python3";
pub(crate) const DEFAULT_CONTAINER_ENGINE: &str = "podman";
const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    source_date_epoch: Option<String>,
    build: BuildConfig,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub python: String,
    pub container_engine: String,
    pub max_capture_bytes: usize,
    /// pip constraints file applied to the isolated build environment.
    pub constraints: Option<PathBuf>,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// `SOURCE_DATE_EPOCH` is only captured here; it is validated when a
    /// command actually consults it.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let source_date_epoch = snapshot
            .non_empty("SOURCE_DATE_EPOCH")
            .map(str::to_string);
        let python = snapshot
            .non_empty("REPRODUCIBLY_PYTHON")
            .or_else(|| snapshot.non_empty("PYTHON"))
            .unwrap_or(DEFAULT_PYTHON)
            .to_string();
        let container_engine = snapshot
            .non_empty("REPRODUCIBLY_CONTAINER_ENGINE")
            .unwrap_or(DEFAULT_CONTAINER_ENGINE)
            .to_string();
        let max_capture_bytes = snapshot
            .non_empty("REPRODUCIBLY_MAX_CAPTURE_BYTES")
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CAPTURE_BYTES);
        let constraints = snapshot
            .non_empty("REPRODUCIBLY_CONSTRAINTS")
            .map(PathBuf::from);
        Self {
            source_date_epoch,
            build: BuildConfig {
                python,
                container_engine,
                max_capture_bytes,
                constraints,
            },
        }
    }

    /// The epoch requested through `SOURCE_DATE_EPOCH`, if any. A blank value
    /// counts as unset.
    ///
    /// # Errors
    /// Returns [`ReproError::InvalidEpoch`] when the variable holds something
    /// that is not a timestamp.
    pub fn source_date_epoch(&self) -> Result<Option<Epoch>, ReproError> {
        self.source_date_epoch
            .as_deref()
            .map(Epoch::parse)
            .transpose()
    }

    #[must_use]
    pub fn build(&self) -> &BuildConfig {
        &self.build
    }
}
