// =============================================================================
// Decision Log — auditable record of every buy/sell decision
// =============================================================================
//
// Every signal and sell order that reaches an executor produces exactly one
// entry here, whether it was allowed or short-circuited. Built as a single
// flat record rather than the teacher's multi-layer verdict struct: the
// control plane's own pipeline already carries one typed rejection per stage
// (`GateRejection`, `ExecutorSkip`), so the log only needs to capture which
// one fired, not re-derive a per-layer pass/fail matrix.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionLog {
    pub id: Uuid,
    pub code: String,
    pub side: DecisionSide,
    /// Strategy name for a buy, sell reason for a sell.
    pub signal_type: String,
    pub allowed: bool,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DecisionLog {
    pub fn allowed(code: impl Into<String>, side: DecisionSide, signal_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            side,
            signal_type: signal_type.into(),
            allowed: true,
            skip_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn skipped(
        code: impl Into<String>,
        side: DecisionSide,
        signal_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            side,
            signal_type: signal_type.into(),
            allowed: false,
            skip_reason: Some(reason.into()),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_entry_has_no_skip_reason() {
        let log = DecisionLog::allowed("005930", DecisionSide::Buy, "GOLDEN_CROSS");
        assert!(log.allowed);
        assert!(log.skip_reason.is_none());
    }

    #[test]
    fn skipped_entry_carries_reason() {
        let log = DecisionLog::skipped("005930", DecisionSide::Sell, "STOP_LOSS", "lock contention");
        assert!(!log.allowed);
        assert_eq!(log.skip_reason.as_deref(), Some("lock contention"));
    }
}
