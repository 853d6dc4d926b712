//! Per-session/task token budget tracker (§3 `SessionUsageLedger`, §4.4).
//!
//! Grounded on `manager.py::_check_session_budget` / `_update_usage_tracking`: cumulative usage
//! is checked *before* any provider call and updated only after a successful completion.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::GatewayError;
use crate::provider::TokenUsage;

pub struct BudgetTracker {
    sessions: Mutex<HashMap<String, TokenUsage>>,
    tasks: Mutex<HashMap<String, TokenUsage>>,
    default_max_tokens_per_session: usize,
}

impl BudgetTracker {
    pub fn new(default_max_tokens_per_session: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            default_max_tokens_per_session,
        }
    }

    /// `cumulative.total_tokens < max_tokens_per_session` (default 100_000, overridable per
    /// request). Fails *before* any network call (§4.4).
    pub fn check(&self, session_id: &str, max_tokens_budget: Option<usize>) -> Result<(), GatewayError> {
        let limit = max_tokens_budget.unwrap_or(self.default_max_tokens_per_session);
        let used = self
            .sessions
            .lock()
            .expect("budget mutex poisoned")
            .get(session_id)
            .map(|u| u.total_tokens)
            .unwrap_or(0);
        if used >= limit {
            return Err(GatewayError::BudgetExceeded {
                scope: format!("session '{session_id}'"),
                used,
                limit,
            });
        }
        Ok(())
    }

    /// Credits `usage` to both the session and (if present) the task ledger. Only called after
    /// a successful completion (§4.4 "Cumulative usage is only updated after a successful
    /// response").
    pub fn record(&self, session_id: &str, task_id: Option<&str>, usage: TokenUsage) {
        let mut sessions = self.sessions.lock().expect("budget mutex poisoned");
        *sessions.entry(session_id.to_string()).or_insert_with(TokenUsage::default) += usage;
        drop(sessions);
        if let Some(task_id) = task_id {
            let mut tasks = self.tasks.lock().expect("budget mutex poisoned");
            *tasks.entry(task_id.to_string()).or_insert_with(TokenUsage::default) += usage;
        }
    }

    pub fn session_usage(&self, session_id: &str) -> TokenUsage {
        self.sessions
            .lock()
            .expect("budget mutex poisoned")
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn task_usage(&self, task_id: &str) -> TokenUsage {
        self.tasks
            .lock()
            .expect("budget mutex poisoned")
            .get(task_id)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_fails_once_budget_is_exhausted() {
        let tracker = BudgetTracker::new(100_000);
        tracker.record("s1", None, TokenUsage::new(60_000, 39_999, 1.0));
        assert!(tracker.check("s1", None).is_ok());
        tracker.record("s1", None, TokenUsage::new(1, 0, 0.0));
        let err = tracker.check("s1", None).unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    }

    #[test]
    fn per_request_override_wins_over_default() {
        let tracker = BudgetTracker::new(100_000);
        tracker.record("s1", None, TokenUsage::new(50, 0, 0.0));
        assert!(tracker.check("s1", Some(10)).is_err());
    }

    #[test]
    fn task_ledger_accumulates_independently_of_session() {
        let tracker = BudgetTracker::new(100_000);
        tracker.record("s1", Some("t1"), TokenUsage::new(10, 5, 0.0));
        tracker.record("s2", Some("t1"), TokenUsage::new(3, 2, 0.0));
        assert_eq!(tracker.task_usage("t1").total_tokens, 20);
        assert_eq!(tracker.session_usage("s1").total_tokens, 15);
    }
}
