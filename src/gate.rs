use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Abort policy of the quality gate, set on the gate stage's configuration:
/// `strict` turns a failing verdict into a fatal stage outcome, `advisory`
/// records it and lets the run proceed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    #[default]
    Strict,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pass" | "ok" | "passed" => Ok(Verdict::Pass),
            "fail" | "error" | "failed" => Ok(Verdict::Fail),
            other => Err(format!("unrecognized verdict '{other}'")),
        }
    }
}

/// Outcome of consulting the gate: the verdict as reported, and whether the
/// configured policy makes it block the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub verdict: Verdict,
    pub blocking: bool,
}

pub fn evaluate(policy: GatePolicy, verdict: Verdict) -> GateDecision {
    GateDecision {
        verdict,
        blocking: policy == GatePolicy::Strict && verdict == Verdict::Fail,
    }
}
