use derive_more::Constructor;

use crate::error::Error;

/// Per-operation retry state. A fresh policy instance is created from the
/// factory for every operation; `begin` is called once before the first
/// attempt, then `success`/`failure` after each attempt.
pub trait RetryPolicy: Send {
    /// Called once before the first attempt.
    fn begin(&mut self);

    /// Called after a successful attempt.
    fn success(&mut self);

    /// Called after a failed attempt.
    fn failure(&mut self, error: &Error);

    /// Whether another attempt may run.
    fn allow_retry(&self) -> bool;

    /// Attempts recorded so far, successful or not.
    fn attempt_count(&self) -> usize;
}

/// Creates fresh per-operation retry state.
pub trait RetryPolicyFactory: Send + Sync {
    fn get_retry_policy(&self) -> Box<dyn RetryPolicy>;
}

/// Single attempt, no retries. The default policy.
#[derive(Debug, Default)]
pub struct RunOnce {
    attempts: usize,
}

impl RetryPolicy for RunOnce {
    fn begin(&mut self) {}

    fn success(&mut self) {
        self.attempts += 1;
    }

    fn failure(&mut self, _error: &Error) {
        self.attempts += 1;
    }

    fn allow_retry(&self) -> bool {
        false
    }

    fn attempt_count(&self) -> usize {
        self.attempts
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct RunOnceFactory;

impl RetryPolicyFactory for RunOnceFactory {
    fn get_retry_policy(&self) -> Box<dyn RetryPolicy> {
        Box::<RunOnce>::default()
    }
}

/// Allows up to `max_retries` retries after the first attempt, stopping early
/// on success. A policy with `max_retries = 2` permits three attempts total.
#[derive(Debug)]
pub struct RetryNTimes {
    max_retries: usize,
    attempts: usize,
    succeeded: bool,
}

impl RetryNTimes {
    pub fn new(max_retries: usize) -> Self {
        RetryNTimes {
            max_retries,
            attempts: 0,
            succeeded: false,
        }
    }
}

impl RetryPolicy for RetryNTimes {
    fn begin(&mut self) {}

    fn success(&mut self) {
        self.attempts += 1;
        self.succeeded = true;
    }

    fn failure(&mut self, _error: &Error) {
        self.attempts += 1;
    }

    fn allow_retry(&self) -> bool {
        !self.succeeded && self.attempts <= self.max_retries
    }

    fn attempt_count(&self) -> usize {
        self.attempts
    }
}

#[derive(Debug, Copy, Clone, Constructor)]
pub struct RetryNTimesFactory {
    max_retries: usize,
}

impl RetryPolicyFactory for RetryNTimesFactory {
    fn get_retry_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(RetryNTimes::new(self.max_retries))
    }
}
