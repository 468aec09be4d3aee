//! Entry point kernels call to evaluate record-resident `code`: parse,
//! then run under a step budget and a hard wall-clock deadline
//! (§4.10/§5.4). Grounded on `StrategyHost::on_bar`'s narrow,
//! validated entry point — no ambient access beyond what's passed in —
//! generalized from one `Box<dyn Strategy>` to arbitrary parsed
//! `SandboxExpr` source.

use std::time::Duration;

use serde_json::Value;

use crate::parse::parse;
use crate::types::{eval, SandboxError, StepBudget};

/// Default step bound applied when a caller doesn't override it. Picked
/// to comfortably cover a policy rule walking a handful of input
/// fields while still catching runaway expressions.
pub const DEFAULT_STEP_LIMIT: u64 = 10_000;

pub struct SandboxHost {
    step_limit: u64,
    deadline: Duration,
}

impl SandboxHost {
    pub fn new(deadline: Duration) -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            deadline,
        }
    }

    pub fn with_step_limit(mut self, step_limit: u64) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Compile and evaluate `code` against `input`, enforcing both the
    /// step budget and the wall-clock deadline. The deadline wraps a
    /// blocking-pool task because expression evaluation itself is
    /// synchronous CPU work with no await points.
    pub async fn execute(&self, code: String, input: Value) -> Result<Value, SandboxError> {
        let step_limit = self.step_limit;
        let task = tokio::task::spawn_blocking(move || {
            let expr = parse(&code)?;
            let mut budget = StepBudget::new(step_limit);
            eval(&expr, &input, &mut budget)
        });

        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SandboxError::Runtime {
                detail: format!("sandbox task panicked: {join_err}"),
            }),
            Err(_elapsed) => Err(SandboxError::Timeout),
        }
    }
}
