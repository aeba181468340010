//! Outcome record and its JSON rendering

use crate::error::{ConfineError, ErrorKind};
use crate::verdict::{Measurement, Verdict};
use serde::Serialize;

/// Result of one supervised execution.
///
/// Built once by the monitor after the child is reaped and all of its output
/// has been forwarded; never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// User CPU time in milliseconds
    pub cpu_time: u64,

    /// Wall-clock time in milliseconds
    pub real_time: u64,

    /// Peak resident set size in bytes
    pub memory: u64,

    /// Terminating signal, 0 if none
    pub signal: i32,

    pub exit_code: i32,

    #[serde(rename = "result")]
    pub verdict: Verdict,
}

impl Outcome {
    #[must_use]
    pub const fn new(m: Measurement, verdict: Verdict) -> Self {
        Self {
            cpu_time: m.cpu_time,
            real_time: m.real_time,
            memory: m.memory,
            signal: m.signal,
            exit_code: m.exit_code,
            verdict,
        }
    }

    /// The child ran to completion within every ceiling.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }
}

/// The report handed to the caller: either an outcome or a supervisor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Report {
    Completed {
        success: True,
        #[serde(flatten)]
        outcome: Outcome,
    },
    Failed {
        success: False,
        error: ErrorKind,
    },
}

impl Report {
    #[must_use]
    pub const fn completed(outcome: Outcome) -> Self {
        Self::Completed {
            success: True,
            outcome,
        }
    }

    #[must_use]
    pub const fn failed(kind: ErrorKind) -> Self {
        Self::Failed {
            success: False,
            error: kind,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&crate::Result<Outcome>> for Report {
    fn from(result: &crate::Result<Outcome>) -> Self {
        match result {
            Ok(outcome) => Self::completed(*outcome),
            Err(err) => Self::failed(err.kind()),
        }
    }
}

impl From<&ConfineError> for Report {
    fn from(err: &ConfineError) -> Self {
        Self::failed(err.kind())
    }
}

/// Serializes as the literal `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct True;

/// Serializes as the literal `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct False;

impl Serialize for True {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl Serialize for False {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn completed_report_shape() {
        let outcome = Outcome::new(
            Measurement {
                cpu_time: 12,
                real_time: 40,
                memory: 3 * 1024 * 1024,
                signal: 0,
                exit_code: 0,
            },
            Verdict::Success,
        );
        let value: Value = serde_json::to_value(Report::completed(outcome)).unwrap();
        assert_eq!(
            value,
            json!({
                "success": true,
                "cpu_time": 12,
                "real_time": 40,
                "memory": 3_145_728,
                "signal": 0,
                "exit_code": 0,
                "result": 0
            })
        );
    }

    #[test]
    fn failed_report_shape() {
        let err = ConfineError::Fork(nix::Error::EAGAIN);
        let value: Value = serde_json::to_value(Report::from(&err)).unwrap();
        assert_eq!(value, json!({ "success": false, "error": 2 }));
    }
}
