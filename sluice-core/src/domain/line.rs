//! Output line domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// One structured output record from a step
///
/// Positions are strictly increasing within one step's stream. Lines from
/// different steps carry no relative ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub step: String,
    /// Seconds elapsed since the pipeline started
    pub time: u64,
    pub kind: LineKind,
    pub pos: usize,
    pub out: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Stdout,
    Stderr,
    /// Payload is the process exit code
    ExitCode,
    Metadata,
    Progress,
}

impl Line {
    pub fn new(
        step: impl Into<String>,
        time: u64,
        kind: LineKind,
        pos: usize,
        out: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            time,
            kind,
            pos,
            out: out.into(),
        }
    }
}

impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineKind::Stdout => write!(f, "stdout"),
            LineKind::Stderr => write!(f, "stderr"),
            LineKind::ExitCode => write!(f, "exit_code"),
            LineKind::Metadata => write!(f, "metadata"),
            LineKind::Progress => write!(f, "progress"),
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.step, self.pos, self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        let line = Line::new("build", 3, LineKind::ExitCode, 12, "0");
        let json = serde_json::to_value(&line).unwrap();

        assert_eq!(json["kind"], "exit_code");
        assert_eq!(json["pos"], 12);
        assert_eq!(json["out"], "0");
    }

    #[test]
    fn test_display() {
        let line = Line::new("test", 0, LineKind::Stdout, 4, "ok");
        assert_eq!(line.to_string(), "[test:4] ok");
        assert_eq!(LineKind::Stderr.to_string(), "stderr");
    }
}
