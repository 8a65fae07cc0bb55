use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// How a submitted task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The server answered with a `result`. `elapsed` is the round-trip
    /// time from write to reply.
    Done { result: Value, elapsed: Duration },
    Failed(TaskError),
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("request timed out")]
    Timeout,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("bad reply: {0}")]
    BadReply(String),
}

/// A single outbound request plus the continuation that consumes its
/// outcome. The continuation is `FnOnce`, so a task is resolved exactly
/// once by construction.
pub struct Task {
    pub method: String,
    pub params: Value,
    resolve: Box<dyn FnOnce(TaskOutcome) + Send>,
}

impl Task {
    pub fn new(
        method: impl Into<String>,
        params: Value,
        resolve: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            resolve: Box::new(resolve),
        }
    }

    pub fn resolve(self, outcome: TaskOutcome) {
        (self.resolve)(outcome);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("method", &self.method)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
