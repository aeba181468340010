//! Hard resource limits for the confined child.
//!
//! | Ceiling              | Kernel limit    | Unit          |
//! |----------------------|-----------------|---------------|
//! | `max_stack`          | `RLIMIT_STACK`  | bytes         |
//! | `max_memory`         | `RLIMIT_AS`     | bytes         |
//! | `max_cpu_time`       | `RLIMIT_CPU`    | whole seconds |
//! | `max_process_number` | `RLIMIT_NPROC`  | count         |
//! | `max_output_size`    | `RLIMIT_FSIZE`  | bytes         |
//!
//! Every limit is installed as both soft and hard limit. Unlimited ceilings
//! leave the inherited limit untouched.

use crate::{ConfineError, LimitConfig, Result};
use nix::sys::resource::{setrlimit, Resource};

/// Limit categories, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Stack,
    AddressSpace,
    CpuSeconds,
    Processes,
    FileSize,
}

impl LimitKind {
    #[must_use]
    pub const fn resource(self) -> Resource {
        match self {
            Self::Stack => Resource::RLIMIT_STACK,
            Self::AddressSpace => Resource::RLIMIT_AS,
            Self::CpuSeconds => Resource::RLIMIT_CPU,
            Self::Processes => Resource::RLIMIT_NPROC,
            Self::FileSize => Resource::RLIMIT_FSIZE,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stack => "RLIMIT_STACK",
            Self::AddressSpace => "RLIMIT_AS",
            Self::CpuSeconds => "RLIMIT_CPU",
            Self::Processes => "RLIMIT_NPROC",
            Self::FileSize => "RLIMIT_FSIZE",
        }
    }
}

/// Round a millisecond CPU ceiling up to whole seconds, never tighter than asked.
#[must_use]
pub const fn cpu_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// The `setrlimit` calls derived from a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RlimitPlan {
    pub limits: Vec<(LimitKind, u64)>,
}

impl RlimitPlan {
    #[must_use]
    pub fn from_config(config: &LimitConfig) -> Self {
        let limits = [
            (LimitKind::Stack, config.max_stack),
            (LimitKind::AddressSpace, config.max_memory),
            (LimitKind::CpuSeconds, config.max_cpu_time.map(cpu_seconds)),
            (LimitKind::Processes, config.max_process_number),
            (LimitKind::FileSize, config.max_output_size),
        ]
        .into_iter()
        .filter_map(|(kind, ceiling)| ceiling.map(|value| (kind, value)))
        .collect();

        Self { limits }
    }

    /// Install every planned limit on the calling process.
    ///
    /// No rollback on failure: the caller is about to exec or die.
    pub fn apply(&self) -> Result<()> {
        for &(kind, value) in &self.limits {
            setrlimit(kind.resource(), value, value).map_err(|source| ConfineError::Rlimit {
                resource: kind.name(),
                source,
            })?;
            tracing::debug!(resource = kind.name(), value, "rlimit applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_rounds_up_to_whole_seconds() {
        assert_eq!(cpu_seconds(1), 1);
        assert_eq!(cpu_seconds(999), 1);
        assert_eq!(cpu_seconds(1000), 1);
        assert_eq!(cpu_seconds(1001), 2);
        assert_eq!(cpu_seconds(2500), 3);
    }

    #[test]
    fn unlimited_ceilings_issue_no_calls() {
        let config = LimitConfig::builder().exe_path("/bin/true").unlimited().build();
        assert!(RlimitPlan::from_config(&config).limits.is_empty());
    }

    #[test]
    fn plan_follows_configured_ceilings() {
        let config = LimitConfig::builder()
            .exe_path("/bin/true")
            .max_cpu_time(Some(1500))
            .max_memory(Some(256 << 20))
            .max_stack(None)
            .max_output_size(Some(4096))
            .build();
        let plan = RlimitPlan::from_config(&config);
        assert_eq!(
            plan.limits,
            vec![
                (LimitKind::AddressSpace, 256 << 20),
                (LimitKind::CpuSeconds, 2),
                (LimitKind::FileSize, 4096),
            ]
        );
    }

    #[test]
    fn default_config_only_limits_the_stack() {
        let config = LimitConfig::builder().exe_path("/bin/true").build();
        let plan = RlimitPlan::from_config(&config);
        assert_eq!(
            plan.limits,
            vec![(LimitKind::Stack, crate::config::DEFAULT_MAX_STACK)]
        );
    }
}
