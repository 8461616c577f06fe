use thiserror::Error;

use crate::config::ConfigError;
use crate::pool::GetError;
use crate::spawn::SpawnError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical capability
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Get(#[from] GetError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Stable machine-readable code for control planes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Get(GetError::Spawn(_)) => "spawn_failed",
            Error::Get(GetError::Aborted(_)) => "get_aborted",
            Error::Get(GetError::ShuttingDown) => "shutting_down",
            Error::Spawn(e) => e.kind.as_str(),
            Error::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::SpawnErrorKind;
    use std::sync::Arc;

    #[test]
    fn codes_are_stable() {
        let spawn = SpawnError::new(SpawnErrorKind::AppStartupTimeout, "too slow");
        assert_eq!(Error::from(spawn.clone()).code(), "app_startup_timeout");
        assert_eq!(
            Error::from(GetError::Spawn(Arc::new(spawn))).code(),
            "spawn_failed"
        );
        assert_eq!(
            Error::from(GetError::Aborted("x".into())).code(),
            "get_aborted"
        );
    }
}
