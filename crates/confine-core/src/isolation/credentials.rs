//! Optional switch to an unprivileged identity before exec

use crate::{ConfineError, Result};
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

/// Target identity for the confined child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

impl Credentials {
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }

    /// Replace supplementary groups, then gid, then uid.
    ///
    /// Must run before the syscall filter, which does not allow any of these.
    pub fn apply(self) -> Result<()> {
        setgroups(&[self.gid]).map_err(ConfineError::Credentials)?;
        setgid(self.gid).map_err(ConfineError::Credentials)?;
        setuid(self.uid).map_err(ConfineError::Credentials)?;
        tracing::debug!(uid = self.uid.as_raw(), gid = self.gid.as_raw(), "privileges dropped");
        Ok(())
    }
}
