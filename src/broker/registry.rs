//! Live-process registry.
//!
//! Maps execution ids to the control side of a running execution (kill
//! switch + stdin sink). The registry entry doubles as the *terminal
//! claim*: removing it grants the right to emit the terminal event for
//! that id, and removal is idempotent so late claimants simply emit
//! nothing. Only the executing job and its timeout path ever claim;
//! cancellation just fires the kill switch and lets the job emit the
//! `ExitCode{137}` in order, after the output it already forwarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sandbox::KillSwitch;

pub struct ProcEntry {
    pub kill: KillSwitch,
    pub stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, ProcEntry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live execution. Returns false (and leaves the existing
    /// entry untouched) if the id is already in use.
    pub fn insert(&self, id: &str, entry: ProcEntry) -> bool {
        let mut map = self.inner.lock().expect("process registry poisoned");
        if map.contains_key(id) {
            return false;
        }
        map.insert(id.to_string(), entry);
        true
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("process registry poisoned")
            .contains_key(id)
    }

    /// Removes the entry: the terminal claim. True if this caller won it.
    pub fn claim(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("process registry poisoned")
            .remove(id)
            .is_some()
    }

    /// Fires the kill switch of a live execution. The entry stays until
    /// the executing job claims it: the job owns the terminal event, so
    /// the resulting `ExitCode{137}` is emitted strictly after any output
    /// already forwarded for the id. Unknown id is a silent no-op.
    pub fn cancel(&self, id: &str) -> bool {
        let map = self.inner.lock().expect("process registry poisoned");
        match map.get(id) {
            Some(entry) => {
                entry.kill.kill();
                true
            }
            None => {
                debug!("cancel for unknown execution id {id}: ignored");
                false
            }
        }
    }

    /// Best-effort stdin delivery; failures are logged, never fatal.
    pub fn write_stdin(&self, id: &str, bytes: Vec<u8>) {
        let map = self.inner.lock().expect("process registry poisoned");
        match map.get(id) {
            Some(entry) => match &entry.stdin {
                Some(sink) => {
                    if sink.send(bytes).is_err() {
                        warn!("stdin for {id}: process already finished");
                    }
                }
                None => warn!("stdin for {id}: handle does not accept input"),
            },
            None => warn!("stdin for {id}: no such execution"),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("process registry poisoned").len()
    }
}
