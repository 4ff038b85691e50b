//! Bounded retry around a single node.
//!
//! Stages never retry internally. The orchestrator wraps each node call in
//! [`run_with_retry`] with the node's [`RetryPolicy`], so retry counts and
//! backoff are configured in one place.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use stockflow_core::PipelineError;

use crate::task::{TaskId, TaskRun};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`. With `jitter`, the delay is
    /// drawn uniformly from `[delay / 2, delay]`.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                let delay = base.saturating_mul(factor).min(max);
                if jitter && !delay.is_zero() {
                    let half = delay / 2;
                    rand::thread_rng().gen_range(half..=delay)
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub const fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(10),
                max: Duration::from_secs(300),
                jitter: true,
            },
        }
    }
}

/// Default policy plus per-node overrides.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    overrides: HashMap<TaskId, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, task: TaskId, policy: RetryPolicy) -> Self {
        self.overrides.insert(task, policy);
        self
    }

    /// Policy for `task`.
    ///
    /// The gate spends its whole deadline before failing, so it never gets
    /// retries regardless of configuration.
    pub fn for_task(&self, task: TaskId) -> RetryPolicy {
        if task == TaskId::GateCheck {
            return RetryPolicy::none();
        }
        self.overrides.get(&task).copied().unwrap_or(self.default)
    }
}

/// Call `op` until it succeeds, fails terminally, or exhausts `policy`.
///
/// Every attempt and its outcome is recorded on `task`.
pub fn run_with_retry<T>(
    task: &mut TaskRun,
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let mut retries = 0;
    loop {
        task.begin_attempt();
        match op() {
            Ok(value) => {
                task.succeed();
                return Ok(value);
            }
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.backoff.delay(retries);
                warn!(
                    task = %task.task,
                    attempt = task.attempts,
                    retry = retries,
                    max_retries = policy.max_retries,
                    ?delay,
                    error = %e,
                    "node failed, retrying"
                );
                task.mark_retrying(&e);
                thread::sleep(delay);
            }
            Err(e) => {
                task.fail(&e);
                return Err(e);
            }
        }
    }
}
