//! Physical-action handler (spec §4.G "Physical-action handler", spec §4.D
//! "REV-001"): the gate a `CALL_ACTION` instruction passes through before an
//! irreversible real-world effect fires — a time-window check, a
//! human-approval gate, and a cancellation window — followed by a
//! postcondition check the caller evaluates against the resulting register.

use anyhow::{anyhow, Result};
use chrono::{Timelike, Utc};
use llmir_core::{PhysicalActionOperands, PostconditionSpec, TimeWindow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::collab::{ApprovalGate, CancellationBus};

/// Whether `now` (UTC) falls inside the window once converted to its timezone.
pub fn time_window_allows(window: &TimeWindow, now: chrono::DateTime<Utc>) -> bool {
    let tz: chrono_tz::Tz = match window.tz.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("[Physical] unrecognised timezone \"{}\" — denying window", window.tz);
            return false;
        }
    };
    let local = now.with_timezone(&tz);
    let iso_weekday = local.date_naive().weekday().number_from_monday() as u8;
    if !window.days.contains(&iso_weekday) {
        return false;
    }

    let parse_hm = |s: &str| -> Option<(u32, u32)> {
        let (h, m) = s.split_once(':')?;
        Some((h.parse().ok()?, m.parse().ok()?))
    };
    let (start_h, start_m) = match parse_hm(&window.start) {
        Some(v) => v,
        None => return false,
    };
    let (end_h, end_m) = match parse_hm(&window.end) {
        Some(v) => v,
        None => return false,
    };

    let minutes_now = local.hour() * 60 + local.minute();
    let minutes_start = start_h * 60 + start_m;
    let minutes_end = end_h * 60 + end_m;

    if minutes_start <= minutes_end {
        (minutes_start..=minutes_end).contains(&minutes_now)
    } else {
        // Window wraps past midnight (e.g. 22:00-06:00).
        minutes_now >= minutes_start || minutes_now <= minutes_end
    }
}

/// Evaluate a postcondition against the register it names. No
/// `expected_value` means the register is checked for truthiness; a
/// `tolerance` compares numerically instead of by strict equality.
pub fn evaluate_postcondition(spec: &PostconditionSpec, regs: &HashMap<u8, Value>) -> bool {
    let actual = regs.get(&spec.register).cloned().unwrap_or(Value::Null);

    match (&spec.expected_value, spec.tolerance) {
        (Some(expected), Some(tolerance)) => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(e)) => (a - e).abs() <= tolerance,
            _ => actual == *expected,
        },
        (Some(expected), None) => actual == *expected,
        (None, _) => crate::interp::is_truthy(Some(&actual)),
    }
}

/// Outcome of a gated physical action. A cancellation never reaches the
/// side-effecting `dispatch` callback — spec §4.G requires the cancelled
/// result to be distinguishable from an executed one rather than surfacing
/// as a generic error.
pub enum PhysicalOutcome {
    Executed(Value),
    Cancelled,
}

impl PhysicalOutcome {
    /// `{cancelled, executed}` pair a caller can fold straight into the
    /// register file or a result payload.
    pub fn as_value(&self) -> Value {
        match self {
            PhysicalOutcome::Executed(v) => v.clone(),
            PhysicalOutcome::Cancelled => serde_json::json!({"cancelled": true, "executed": false}),
        }
    }
}

pub struct PhysicalActionHandler {
    cancellation: Arc<dyn CancellationBus>,
    approvals: Arc<dyn ApprovalGate>,
}

impl PhysicalActionHandler {
    pub fn new(cancellation: Arc<dyn CancellationBus>, approvals: Arc<dyn ApprovalGate>) -> Self {
        Self { cancellation, approvals }
    }

    /// Run the pre-flight gates, then call `dispatch` with the action's
    /// payload. Returns an error (never dispatches) when the time window
    /// rejects the moment or approval is pending; returns
    /// `PhysicalOutcome::Cancelled` (again, never dispatching) when the
    /// workflow is cancelled during the cancellation window.
    pub async fn execute<F, Fut>(
        &self,
        workflow_id: &str,
        instruction_index: u32,
        operands: &PhysicalActionOperands,
        dispatch: F,
    ) -> Result<PhysicalOutcome>
    where
        F: FnOnce(Value) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        if let Some(window) = &operands.time_window {
            if !time_window_allows(window, Utc::now()) {
                return Err(anyhow!("physical action \"{}\" outside its configured time window", operands.target));
            }
        }

        if operands.requires_human_approval && !self.approvals.is_approved(workflow_id, instruction_index) {
            return Err(anyhow!("physical action \"{}\" on {} awaits human approval", operands.command, operands.target));
        }

        if operands.cancellation_window_ms > 0 {
            let step = Duration::from_millis(50.min(operands.cancellation_window_ms));
            let mut waited = 0u64;
            while waited < operands.cancellation_window_ms {
                if self.cancellation.is_cancelled(workflow_id) {
                    debug!("[Physical] \"{}\" cancelled during its cancellation window", operands.target);
                    return Ok(PhysicalOutcome::Cancelled);
                }
                tokio::time::sleep(step).await;
                waited += step.as_millis() as u64;
            }
        }

        debug!("[Physical] dispatching {} on {}", operands.command, operands.target);
        dispatch(operands.payload.clone()).await.map(PhysicalOutcome::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryApprovalGate, InMemoryCancellationBus};
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn time_window_allows_within_same_day_range() {
        let window = TimeWindow { days: vec![1, 2, 3, 4, 5], start: "08:00".into(), end: "18:00".into(), tz: "UTC".into() };
        let monday_noon = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert!(time_window_allows(&window, monday_noon));
        let monday_midnight = Utc.with_ymd_and_hms(2026, 7, 27, 0, 30, 0).unwrap();
        assert!(!time_window_allows(&window, monday_midnight));
    }

    #[test]
    fn time_window_rejects_wrong_weekday() {
        let window = TimeWindow { days: vec![6, 7], start: "00:00".into(), end: "23:59".into(), tz: "UTC".into() };
        let monday = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert!(!time_window_allows(&window, monday));
    }

    #[test]
    fn time_window_handles_overnight_wrap() {
        let window = TimeWindow { days: vec![1, 2, 3, 4, 5, 6, 7], start: "22:00".into(), end: "06:00".into(), tz: "UTC".into() };
        let just_after_ten_pm = Utc.with_ymd_and_hms(2026, 7, 27, 22, 30, 0).unwrap();
        let just_before_six_am = Utc.with_ymd_and_hms(2026, 7, 27, 5, 30, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert!(time_window_allows(&window, just_after_ten_pm));
        assert!(time_window_allows(&window, just_before_six_am));
        assert!(!time_window_allows(&window, midday));
    }

    #[test]
    fn postcondition_within_tolerance_passes() {
        let mut regs = HashMap::new();
        regs.insert(3u8, serde_json::json!(20.4));
        let spec = PostconditionSpec { expression: None, expected_value: Some(serde_json::json!(20.0)), tolerance: Some(0.5), register: 3 };
        assert!(evaluate_postcondition(&spec, &regs));
    }

    #[tokio::test]
    async fn execute_rejects_unapproved_action_requiring_human_confirmation() {
        let handler = PhysicalActionHandler::new(Arc::new(InMemoryCancellationBus::default()), Arc::new(InMemoryApprovalGate::default()));
        let operands = PhysicalActionOperands {
            target: "valve-1".into(),
            command: "open".into(),
            payload: Value::Null,
            time_window: None,
            cancellation_window_ms: 0,
            postcondition: None,
            requires_human_approval: true,
            postcondition_fallback: None,
        };
        let result = handler.execute("wf-1", 7, &operands, |_| async { Ok(Value::Null) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_within_window_skips_dispatch_and_reports_cancelled() {
        let bus = Arc::new(InMemoryCancellationBus::default());
        let handler = PhysicalActionHandler::new(bus.clone(), Arc::new(InMemoryApprovalGate::default()));
        let operands = PhysicalActionOperands {
            target: "valve-3".into(),
            command: "close".into(),
            payload: Value::Null,
            time_window: None,
            cancellation_window_ms: 1000,
            postcondition: None,
            requires_human_approval: false,
            postcondition_fallback: None,
        };

        let dispatched = Arc::new(StdMutex::new(false));
        let dispatched_clone = dispatched.clone();

        let run = handler.execute("wf-cancel", 1, &operands, move |_| {
            let dispatched = dispatched_clone.clone();
            async move {
                *dispatched.lock().unwrap() = true;
                Ok(Value::Null)
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.cancel("wf-cancel");

        let outcome = run.await.unwrap();
        assert!(!*dispatched.lock().unwrap(), "dispatch callback must never run once cancelled");
        assert_eq!(outcome.as_value(), serde_json::json!({"cancelled": true, "executed": false}));
    }
}
