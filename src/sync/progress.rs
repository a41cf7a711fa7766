use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SyncStep {
    Migration,
    Collecting,
    Pushing,
    Pulling,
    Applying,
    Complete,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Migration => "migration",
            SyncStep::Collecting => "collecting",
            SyncStep::Pushing => "pushing",
            SyncStep::Pulling => "pulling",
            SyncStep::Applying => "applying",
            SyncStep::Complete => "complete",
        }
    }

    /// Percent band `[start, end]` the step reports within.
    pub fn band(&self) -> (u8, u8) {
        match self {
            SyncStep::Migration => (0, 10),
            SyncStep::Collecting => (10, 20),
            SyncStep::Pushing => (20, 60),
            SyncStep::Pulling => (60, 75),
            SyncStep::Applying => (75, 95),
            SyncStep::Complete => (100, 100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncProgress {
    pub step: SyncStep,
    pub message: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub total: Option<u64>,
}

impl SyncProgress {
    pub fn started(step: SyncStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            percent: step.band().0,
            current: None,
            total: None,
        }
    }

    pub fn finished(step: SyncStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            percent: step.band().1,
            current: None,
            total: None,
        }
    }

    /// Position `current` of `total` inside the step's band.
    pub fn counted(step: SyncStep, message: impl Into<String>, current: u64, total: u64) -> Self {
        let (start, end) = step.band();
        let span = u64::from(end - start);
        let offset = if total == 0 {
            span
        } else {
            span * current.min(total) / total
        };
        Self {
            step,
            message: message.into(),
            percent: start + offset as u8,
            current: Some(current),
            total: Some(total),
        }
    }
}
