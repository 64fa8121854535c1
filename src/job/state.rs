use std::fmt;

/// Lifecycle states of a job. Transitions are driven by the event
/// methods on [`super::Job`] and always happen under the job's state
/// mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// shim/payload running normally
    Active,
    /// graceful stop initiated, SIGKILL timer armed
    Stopping,
    /// payload exited on its own
    Ended,
    /// payload killed via the API
    Stopped,
    /// cleanup complete, id only kept to answer "gone"
    Removed,
}

impl Status {
    /// Terminal means no further process events are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Ended | Status::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Active => "ACTIVE",
            Status::Stopping => "STOPPING",
            Status::Ended => "ENDED",
            Status::Stopped => "STOPPED",
            Status::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!Status::Active.is_terminal());
        assert!(!Status::Stopping.is_terminal());
        assert!(Status::Ended.is_terminal());
        assert!(Status::Stopped.is_terminal());
        assert!(!Status::Removed.is_terminal());
    }

    #[test]
    fn display_names() {
        assert_eq!(Status::Active.to_string(), "ACTIVE");
        assert_eq!(Status::Stopping.to_string(), "STOPPING");
        assert_eq!(Status::Ended.to_string(), "ENDED");
        assert_eq!(Status::Stopped.to_string(), "STOPPED");
        assert_eq!(Status::Removed.to_string(), "REMOVED");
    }
}
