//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None = 80% of system limit, 0 = no limit)
    pub max_open_files: Option<usize>,
    /// Operations per second throttle (0 = no throttle)
    pub ops_throttle: usize,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open_files == Some(1) {
            return Err("max_open_files must be at least 2, every copy holds two files".to_string());
        }
        Ok(())
    }

    /// The open files limit to use, falling back to a share of the process limit.
    #[must_use]
    pub fn resolved_max_open_files(&self) -> usize {
        self.max_open_files.unwrap_or_else(default_max_open_files)
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// 80% of the soft open files limit of this process, 0 (no limit) if it can't be read.
#[must_use]
pub fn default_max_open_files() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => {
            let limit = usize::try_from(soft).unwrap_or(usize::MAX);
            limit / 10 * 8
        }
        Err(error) => {
            tracing::warn!("failed reading open files limit: {}", &error);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_limit_wins() {
        let config = ThrottleConfig {
            max_open_files: Some(64),
            ops_throttle: 0,
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.resolved_max_open_files(), 64);
    }

    #[test]
    fn single_open_file_is_rejected() {
        let config = ThrottleConfig {
            max_open_files: Some(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_limit_is_below_process_limit() {
        let (soft, _) =
            nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE).unwrap();
        let default = ThrottleConfig::default().resolved_max_open_files();
        assert!(u64::try_from(default).unwrap() < soft.max(1));
    }
}
