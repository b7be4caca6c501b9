//! Timed execution of backend calls
//!
//! A worker hands each backend call to its own executor thread and waits at
//! most the configured ceiling. When the ceiling passes the worker records a
//! timeout and moves on; the stuck executor is abandoned and a fresh one is
//! started for the next call, so a hung backend never hangs the worker.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::AdapterError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Per-worker executor for backend calls
pub struct CallExecutor {
    name: String,
    timeout: Option<Duration>,
    jobs: Option<Sender<Job>>,
    generation: u64,
    abandoned: u64,
}

impl CallExecutor {
    /// Create an executor; `None` runs every call inline without a ceiling
    pub fn new(name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            timeout,
            jobs: None,
            generation: 0,
            abandoned: 0,
        }
    }

    /// Configured ceiling
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Executor threads abandoned after a timeout
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    fn spawn_executor(&mut self) -> std::io::Result<Sender<Job>> {
        let (tx, rx) = unbounded::<Job>();
        self.generation += 1;
        thread::Builder::new()
            .name(format!("{}-call-{}", self.name, self.generation))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })?;
        Ok(tx)
    }

    /// Run `call`, giving up after the ceiling
    pub fn call<T, F>(&mut self, call: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return call();
        };

        let jobs = match self.jobs.take() {
            Some(jobs) => jobs,
            None => self
                .spawn_executor()
                .map_err(|e| AdapterError::Unavailable(format!("executor spawn failed: {}", e)))?,
        };

        let (reply_tx, reply_rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The receiver is gone if the caller already timed out
            let _ = reply_tx.send(call());
        });
        if jobs.send(job).is_err() {
            return Err(AdapterError::Unavailable("executor stopped".to_string()));
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => {
                self.jobs = Some(jobs);
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                // Dropping `jobs` lets the stuck thread exit once its call returns
                self.abandoned += 1;
                debug!(executor = %self.name, ?timeout, "backend call timed out, executor abandoned");
                Err(AdapterError::Timeout { after: timeout })
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(executor = %self.name, "backend call panicked");
                Err(AdapterError::Backend("backend call panicked".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_inline_without_timeout() {
        let mut executor = CallExecutor::new("test", None);
        assert_eq!(executor.call(|| Ok(7)).unwrap(), 7);
        assert_eq!(
            executor.call::<(), _>(|| Err(AdapterError::Injected)),
            Err(AdapterError::Injected)
        );
    }

    #[test]
    fn test_fast_call_reuses_executor() {
        let mut executor = CallExecutor::new("test", Some(Duration::from_secs(1)));
        for i in 0..10 {
            assert_eq!(executor.call(move || Ok(i)).unwrap(), i);
        }
        assert_eq!(executor.abandoned(), 0);
    }

    #[test]
    fn test_slow_call_times_out_and_recovers() {
        let mut executor = CallExecutor::new("test", Some(Duration::from_millis(20)));
        let start = Instant::now();
        let result = executor.call(|| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert_eq!(
            result,
            Err(AdapterError::Timeout {
                after: Duration::from_millis(20)
            })
        );
        assert!(start.elapsed() < Duration::from_millis(400));
        assert_eq!(executor.abandoned(), 1);

        // A fresh executor serves the next call immediately
        assert_eq!(executor.call(|| Ok("ok")).unwrap(), "ok");
    }

    #[test]
    fn test_panicking_call_is_an_error() {
        let mut executor = CallExecutor::new("test", Some(Duration::from_secs(1)));
        let result: Result<(), _> = executor.call(|| panic!("boom"));
        assert!(matches!(result, Err(AdapterError::Backend(_))));
    }
}
