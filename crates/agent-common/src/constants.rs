// Constants shared across the agent.

use std::fmt;
use std::time::Duration;

/// Well-known directories used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Temp,
    Scripts,
    Logs,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Shared budget granted to ALWAYS/ON_TIMEOUT commands after the deadline.
pub const GRACE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Attempts made to deliver the final report.
pub const FINAL_REPORT_ATTEMPTS: u32 = 3;

/// How long the run waits for the resource monitor's summary.
pub const RESOURCE_MONITOR_WAIT: Duration = Duration::from_secs(5);

/// Process return / exit codes.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
}

pub mod path {
    pub const SCRIPTS_DIRECTORY: &str = "scripts";
    pub const LOGS_DIRECTORY: &str = "logs";
    pub const WORK_DIRECTORY: &str = "work";
}

/// Task environment variables that change agent behaviour.
pub mod variables {
    /// Interpreter override; `direct` runs the line's argv without a shell.
    pub const SHELL: &str = "CIRRUS_SHELL";
    pub const LOG_TIMESTAMP: &str = "CIRRUS_LOG_TIMESTAMP";
    /// Leave leftover process-group members alive after a script exits.
    pub const ESCAPE_HATCH_NO_KILL: &str = "CIRRUS_ESCAPE_HATCH_NO_KILL";
    /// Path of the ad-hoc environment file handed to each step.
    pub const ENV_FILE: &str = "CIRRUS_ENV";
    pub const WORKING_DIR: &str = "CIRRUS_WORKING_DIR";
    pub const TASK_ID: &str = "CIRRUS_TASK_ID";
    /// Set to `true` inside every step.
    pub const CI: &str = "CI";
}
