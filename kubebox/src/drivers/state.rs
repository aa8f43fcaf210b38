//! Power states reported by a driver.

use serde::{Deserialize, Serialize};

/// Power state of a machine as observed by its driver.
///
/// ```text
/// Stopped/Saved/Paused --start()--> Starting --> Running
/// Running --stop()--> Stopping --> Stopped
/// Running --kill()--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// The driver cannot determine a state (e.g. the VM was never created).
    #[default]
    None,
    Stopped,
    Starting,
    Running,
    Paused,
    Saved,
    Stopping,
    Error,
}

impl MachineState {
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, MachineState::Stopped)
    }

    /// Check if start() is a valid request from this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            MachineState::Stopped | MachineState::Saved | MachineState::Paused
        )
    }

    /// Check if stop() is a valid request from this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, MachineState::Running)
    }

    /// Check if this is a transient state that should settle on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, MachineState::Starting | MachineState::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::None => "",
            MachineState::Stopped => "Stopped",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Saved => "Saved",
            MachineState::Stopping => "Stopping",
            MachineState::Error => "Error",
        }
    }
}

impl std::str::FromStr for MachineState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(MachineState::None),
            "stopped" => Ok(MachineState::Stopped),
            "starting" => Ok(MachineState::Starting),
            "running" => Ok(MachineState::Running),
            "paused" => Ok(MachineState::Paused),
            "saved" => Ok(MachineState::Saved),
            "stopping" => Ok(MachineState::Stopping),
            "error" => Ok(MachineState::Error),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_start() {
        assert!(MachineState::Stopped.can_start());
        assert!(MachineState::Saved.can_start());
        assert!(MachineState::Paused.can_start());
        assert!(!MachineState::Running.can_start());
        assert!(!MachineState::Starting.can_start());
        assert!(!MachineState::Error.can_start());
    }

    #[test]
    fn test_can_stop() {
        assert!(MachineState::Running.can_stop());
        assert!(!MachineState::Stopped.can_stop());
        assert!(!MachineState::Paused.can_stop());
    }

    #[test]
    fn test_transient() {
        assert!(MachineState::Starting.is_transient());
        assert!(MachineState::Stopping.is_transient());
        assert!(!MachineState::Running.is_transient());
    }

    #[test]
    fn test_string_round_trip() {
        for state in [
            MachineState::None,
            MachineState::Stopped,
            MachineState::Starting,
            MachineState::Running,
            MachineState::Paused,
            MachineState::Saved,
            MachineState::Stopping,
            MachineState::Error,
        ] {
            assert_eq!(state.as_str().parse::<MachineState>(), Ok(state));
        }
        assert_eq!("RUNNING".parse::<MachineState>(), Ok(MachineState::Running));
        assert!("exploded".parse::<MachineState>().is_err());
    }

    #[test]
    fn test_default_is_none() {
        assert_eq!(MachineState::default(), MachineState::None);
        assert_eq!(MachineState::Running.to_string(), "Running");
    }
}
