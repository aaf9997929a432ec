//! Per-run state threaded through every component call

use std::time::Duration;

use stagehand_common::config::Timings;
use stagehand_common::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Everything a component needs to know about the current run
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Environment name from the configuration
    pub environment: String,
    /// Namespace being deployed
    pub namespace: String,
    /// Skip every mutating call
    pub dry_run: bool,
    /// Poll intervals and delays
    pub timings: Timings,
    /// Cancelled on external interrupt
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Create a context with default timings and a fresh cancellation token
    pub fn new(environment: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            namespace: namespace.into(),
            dry_run: false,
            timings: Timings::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Replace the timings
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail with `Cancelled` if the run was interrupted before `step`
    pub fn checkpoint(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::cancelled(step))
        } else {
            Ok(())
        }
    }

    /// Sleep unless cancelled first; returns false on cancellation
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
