//! Scriptable driver for state-machine tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::DriverStage;

use super::{Driver, DriverError, DriverStatus, ExecContext};

/// Driver whose results are scripted by the test
///
/// `execute` returns `exec_result` and records the call; `check_status` pops
/// from `poll_results` and repeats the last entry once the queue drains.
pub struct MockDriver {
    exec_result: Mutex<DriverStatus>,
    poll_results: Mutex<VecDeque<DriverStatus>>,
    pub exec_calls: Mutex<Vec<(DriverStage, String)>>,
    pub poll_calls: Mutex<Vec<String>>,
}

impl MockDriver {
    /// Executes cleanly and reports success on the first poll
    pub fn succeeding() -> Self {
        Self {
            exec_result: Mutex::new(DriverStatus::Running("applied".into())),
            poll_results: Mutex::new(VecDeque::from([DriverStatus::Success])),
            exec_calls: Mutex::new(Vec::new()),
            poll_calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails every execute with the given message
    pub fn failing_execute(message: &str) -> Self {
        Self {
            exec_result: Mutex::new(DriverStatus::Failed(message.into())),
            poll_results: Mutex::new(VecDeque::new()),
            exec_calls: Mutex::new(Vec::new()),
            poll_calls: Mutex::new(Vec::new()),
        }
    }

    /// Executes cleanly, then reports the given poll sequence
    pub fn with_polls(polls: Vec<DriverStatus>) -> Self {
        Self {
            exec_result: Mutex::new(DriverStatus::Running("applied".into())),
            poll_results: Mutex::new(polls.into()),
            exec_calls: Mutex::new(Vec::new()),
            poll_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn exec_count(&self) -> usize {
        self.exec_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError> {
        self.exec_calls
            .lock()
            .unwrap()
            .push((stage, ctx.release_name.clone()));
        Ok(self.exec_result.lock().unwrap().clone())
    }

    async fn check_status(
        &self,
        _stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError> {
        self.poll_calls.lock().unwrap().push(ctx.release_name.clone());
        let mut polls = self.poll_results.lock().unwrap();
        Ok(match polls.len() {
            0 => DriverStatus::Running("no script left".into()),
            1 => polls.front().cloned().unwrap(),
            _ => polls.pop_front().unwrap(),
        })
    }
}
