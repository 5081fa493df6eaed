//! Collection of the per-object failures of a container's transfers.
use crate::ColdVaultError;
use std::sync::Mutex;

/// Thread-safe, append-only record of which objects failed to transfer and why.
///
/// Shared by every transfer task of a container.  Entries are kept in the order they were
/// appended so that the rendered report is stable for a given sequence of completions.
#[derive(Debug, Default)]
pub struct TransferFailures {
    entries: Mutex<Vec<(String, ColdVaultError)>>,
}

impl TransferFailures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `object` failed with `error`
    pub fn append(&self, object: impl Into<String>, error: ColdVaultError) {
        self.entries
            .lock()
            .expect("BUG: transfer failures mutex poisoned")
            .push((object.into(), error));
    }

    /// Number of failures recorded so far
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .expect("BUG: transfer failures mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The names of the failed objects, in the order the failures were recorded
    pub fn objects(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("BUG: transfer failures mutex poisoned")
            .iter()
            .map(|(object, _)| object.clone())
            .collect()
    }

    /// Render one `<object>: <error>` line per failure, including each error's causes
    pub fn report(&self) -> String {
        let entries = self
            .entries
            .lock()
            .expect("BUG: transfer failures mutex poisoned");

        entries
            .iter()
            .map(|(object, error)| format!("{object}: {}\n", error.display_chain()))
            .collect()
    }
}
