//! Pipeline stages and per-stage timing.
//!
//! ```text
//! VALIDATE → AUTHORIZE → PREPARE → EXECUTE → TRANSFORM → RESPOND
//! ```
//!
//! Stages run strictly in order. A failing stage halts the pipeline and the
//! respond stage reports what ran.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// One pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Authorize,
    Prepare,
    Execute,
    Transform,
    Respond,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Validate,
        Stage::Authorize,
        Stage::Prepare,
        Stage::Execute,
        Stage::Transform,
        Stage::Respond,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Authorize => "authorize",
            Stage::Prepare => "prepare",
            Stage::Execute => "execute",
            Stage::Transform => "transform",
            Stage::Respond => "respond",
        }
    }

    /// The stage that must follow this one.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Validate => Some(Stage::Authorize),
            Stage::Authorize => Some(Stage::Prepare),
            Stage::Prepare => Some(Stage::Execute),
            Stage::Execute => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Respond),
            Stage::Respond => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time spent in one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub ok: bool,
}

/// Records stage timings and refuses out-of-order stages.
#[derive(Debug)]
pub struct StageTimer {
    started: Instant,
    current: Option<(Stage, Instant)>,
    last: Option<Stage>,
    timings: Vec<StageTiming>,
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTimer {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current: None,
            last: None,
            timings: Vec::with_capacity(Stage::ALL.len()),
        }
    }

    /// Begin `stage`. Returns false (and records nothing) when `stage` is
    /// not the successor of the last finished stage, or when `Respond` is
    /// entered early after a failure.
    pub fn enter(&mut self, stage: Stage) -> bool {
        if self.current.is_some() {
            return false;
        }
        let expected = match self.last {
            None => Stage::Validate,
            Some(last) => match last.next() {
                Some(next) => next,
                None => return false,
            },
        };
        let halted = self.timings.last().is_some_and(|t| !t.ok);
        if stage != expected && !(stage == Stage::Respond && halted) {
            return false;
        }
        self.current = Some((stage, Instant::now()));
        true
    }

    /// Finish the current stage.
    pub fn exit(&mut self, ok: bool) {
        if let Some((stage, at)) = self.current.take() {
            self.timings.push(StageTiming {
                stage,
                duration: at.elapsed(),
                ok,
            });
            self.last = Some(stage);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    pub fn into_timings(self) -> Vec<StageTiming> {
        self.timings
    }
}
