//! Confinement primitives applied inside the forked child
//!
//! - `rlimits` - hard resource ceilings
//! - `credentials` - optional privilege drop
//! - `seccomp` - default-deny syscall filtering

pub mod credentials;
pub mod rlimits;
pub mod seccomp;

pub use self::credentials::Credentials;
pub use self::rlimits::{LimitKind, RlimitPlan};
pub use self::seccomp::SeccompConfig;
