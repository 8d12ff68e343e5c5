// Run bookkeeping.  Runs are correlators for agent execution scopes; they
// never gate delivery.  The table enforces the advertised concurrency cap
// and keeps terminal runs for the lifetime of the session.

use haip_protocol::now_ms;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Active,
    Finished,
    Cancelled,
    Error,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub thread_id: Option<String>,
    pub status: RunStatus,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStartError {
    LimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEndError {
    NotFound,
}

pub struct RunTable {
    active: HashMap<String, Run>,
    terminal: HashMap<String, Run>,
    max_concurrent: usize,
}

impl RunTable {
    pub fn new(max_concurrent: usize) -> Self {
        RunTable {
            active: HashMap::new(),
            terminal: HashMap::new(),
            max_concurrent,
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Starts (or adopts) a run.  Restarting an id that is already active is
    /// idempotent and does not consume another slot.
    pub fn start(
        &mut self,
        run_id: &str,
        thread_id: Option<String>,
    ) -> Result<&Run, RunStartError> {
        if !self.active.contains_key(run_id) {
            if self.active.len() >= self.max_concurrent {
                return Err(RunStartError::LimitExceeded);
            }
            self.active.insert(
                run_id.to_owned(),
                Run {
                    id: run_id.to_owned(),
                    thread_id,
                    status: RunStatus::Active,
                    started_ms: now_ms(),
                    ended_ms: None,
                    summary: None,
                    error: None,
                },
            );
        }
        Ok(&self.active[run_id])
    }

    pub fn finish(&mut self, run_id: &str, summary: Option<String>) -> Result<(), RunEndError> {
        self.end(run_id, RunStatus::Finished, summary, None)
    }

    pub fn cancel(&mut self, run_id: &str) -> Result<(), RunEndError> {
        self.end(run_id, RunStatus::Cancelled, None, None)
    }

    pub fn error(&mut self, run_id: &str, message: Option<String>) -> Result<(), RunEndError> {
        self.end(run_id, RunStatus::Error, None, message)
    }

    fn end(
        &mut self,
        run_id: &str,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), RunEndError> {
        let mut run = self.active.remove(run_id).ok_or(RunEndError::NotFound)?;
        run.status = status;
        run.ended_ms = Some(now_ms());
        run.summary = summary;
        run.error = error;
        self.terminal.insert(run_id.to_owned(), run);
        Ok(())
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.active
            .get(run_id)
            .or_else(|| self.terminal.get(run_id))
            .map(|run| run.status)
    }
}
