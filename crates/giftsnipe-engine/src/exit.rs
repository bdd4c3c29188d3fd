/*
[INPUT]:  Engine run result
[OUTPUT]: Process exit status contract shared with the launcher
[POS]:    Process boundary - exit code mapping
[UPDATE]: When adding an exit code the launcher must understand
*/

use std::process::ExitCode;

/// Exit code for a configuration error. The launcher never restarts it.
pub const CONFIG_ERROR_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean shutdown
    Clean,
    /// Runtime failure, safe to restart
    Crash,
    /// Configuration error, restarting will not help
    ConfigError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Crash => 1,
            ExitStatus::ConfigError => CONFIG_ERROR_CODE,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitStatus::Clean),
            1 => Some(ExitStatus::Crash),
            CONFIG_ERROR_CODE => Some(ExitStatus::ConfigError),
            _ => None,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, ExitStatus::ConfigError)
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Clean => ExitCode::SUCCESS,
            ExitStatus::Crash => ExitCode::FAILURE,
            ExitStatus::ConfigError => ExitCode::from(CONFIG_ERROR_CODE as u8),
        }
    }
}
