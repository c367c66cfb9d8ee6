//! Scripted collaborators shared by the unit tests.

use crate::error::VsyncError;
use crate::executor::{CommandExecutor, ERROR_SENTINEL};
use crate::sampler::Clock;
use crate::vsync::{VsyncCallback, VsyncSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Executor answering from a table of canned replies.
///
/// Unknown commands get an empty reply. Replies can be queued per command;
/// the last queued reply sticks once the queue drains.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<HashMap<String, Vec<String>>>,
    existing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    releases: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, command: &str, output: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push(output.to_string());
        self
    }

    pub fn set_reply(&self, command: &str, output: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .insert(command.to_string(), vec![output.to_string()]);
        self
    }

    pub fn fail(&self, command: &str) -> &Self {
        self.set_reply(command, ERROR_SENTINEL)
    }

    pub fn add_file(&self, path: &str, contents: &str) -> &Self {
        self.existing.lock().unwrap().push(path.to_string());
        self.set_reply(&format!("cat {}", path), contents)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, command: &str) -> String {
        self.calls.lock().unwrap().push(command.to_string());
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue.first().cloned().unwrap_or_default(),
            None => String::new(),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.calls.lock().unwrap().push(format!("exists {}", path));
        self.existing.lock().unwrap().iter().any(|p| p == path)
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Vsync source that records registrations and lets the test fire frames.
#[derive(Default)]
pub struct ManualVsync {
    callback: Mutex<Option<VsyncCallback>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl ManualVsync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one frame; returns false when nothing is registered.
    pub fn fire(&self, timestamp_ns: i64) -> bool {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => {
                callback(timestamp_ns);
                true
            }
            None => false,
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

impl VsyncSource for ManualVsync {
    fn register(&self, callback: VsyncCallback) -> Result<(), VsyncError> {
        let mut slot = self.callback.lock().unwrap();
        if slot.is_some() {
            return Err(VsyncError::AlreadyRegistered);
        }
        *slot = Some(callback);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deregister(&self) {
        if self.callback.lock().unwrap().take().is_some() {
            self.deregistrations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
