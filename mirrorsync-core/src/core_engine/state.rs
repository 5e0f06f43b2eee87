use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine lifecycle.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`; a required
/// component failing during start lands in `Error`, from which the engine
/// can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl EngineState {
    pub fn can_start(self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Error)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Engine state shared with background tasks
#[derive(Debug, Clone)]
pub(crate) struct SharedState(std::sync::Arc<std::sync::Mutex<EngineState>>);

impl SharedState {
    pub fn new(state: EngineState) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(state)))
    }

    pub fn get(&self) -> EngineState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `state`, returning the previous one
    pub fn set(&self, state: EngineState) -> EngineState {
        let mut current = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, state)
    }
}
