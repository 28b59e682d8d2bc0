//! In-memory markers for resources with an outstanding operation.
//!
//! A marker is set the moment a task is accepted so menus and lists can show
//! progress immediately, and it is cleared explicitly by whoever owns the
//! operation once the resource has settled. The tracker is an ordinary value
//! shared through `Arc`, never a process-wide global.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::identity::TargetIdentity;

/// Set of targets with an outstanding operation, each with a display label.
#[derive(Debug, Default)]
pub struct PendingOperationTracker {
    entries: Mutex<HashMap<TargetIdentity, String>>,
}

impl PendingOperationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TargetIdentity, String>> {
        // Critical sections are plain map access, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a target pending, replacing any existing label.
    pub fn set_pending(&self, target: TargetIdentity, label: impl Into<String>) {
        let label = label.into();
        debug!(resource = %target, label = %label, "Marking target pending");
        self.entries().insert(target, label);
    }

    /// Mark a target pending only if it is not already.
    ///
    /// Returns the existing label when the target is taken.
    pub fn try_claim(&self, target: &TargetIdentity, label: &str) -> Result<(), String> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(target) {
            return Err(existing.clone());
        }
        entries.insert(target.clone(), label.to_string());
        Ok(())
    }

    /// Remove the marker for a target. Returns whether one existed.
    pub fn clear_pending(&self, target: &TargetIdentity) -> bool {
        let removed = self.entries().remove(target).is_some();
        if removed {
            debug!(resource = %target, "Cleared pending marker");
        }
        removed
    }

    /// Label of the outstanding operation, if any.
    #[must_use]
    pub fn is_pending(&self, target: &TargetIdentity) -> Option<String> {
        self.entries().get(target).cloned()
    }

    /// Whether any target has an outstanding operation.
    #[must_use]
    pub fn has_any(&self) -> bool {
        !self.entries().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copy of all markers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(TargetIdentity, String)> {
        let mut all: Vec<_> = self
            .entries()
            .iter()
            .map(|(t, l)| (t.clone(), l.clone()))
            .collect();
        all.sort();
        all
    }
}
