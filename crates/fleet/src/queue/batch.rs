//! Summary of a multi-target submission.

use crate::identity::TargetIdentity;

use super::{QueueError, TaskOutcome, TaskTicket};

/// One summary for a batch instead of one message per target.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Tasks accepted by the queue.
    pub submitted: usize,
    /// Targets left alone: conflicting or not eligible.
    pub skipped: usize,
    /// Targets that could not be submitted at all.
    pub failed: usize,
    /// Tickets for the accepted tasks.
    pub tickets: Vec<TaskTicket>,
    /// Why each non-submitted target was turned away.
    pub rejections: Vec<(TargetIdentity, String)>,
}

impl BatchSummary {
    /// Fold in one `enqueue` result.
    pub fn record(&mut self, target: TargetIdentity, result: Result<TaskTicket, QueueError>) {
        match result {
            Ok(ticket) => {
                self.submitted += 1;
                self.tickets.push(ticket);
            }
            Err(err) => {
                if err.is_conflict() {
                    self.skipped += 1;
                } else {
                    self.failed += 1;
                }
                self.rejections.push((target, err.to_string()));
            }
        }
    }

    /// Count a target the caller filtered out before submission.
    pub fn record_ineligible(&mut self, target: TargetIdentity, reason: impl Into<String>) {
        self.skipped += 1;
        self.rejections.push((target, reason.into()));
    }

    /// Count a target whose task could not be built, e.g. no client for its profile.
    pub fn record_unresolved(&mut self, target: TargetIdentity, reason: impl Into<String>) {
        self.failed += 1;
        self.rejections.push((target, reason.into()));
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.submitted + self.skipped + self.failed
    }

    /// One-line summary for a status bar.
    #[must_use]
    pub fn message(&self, action: &str) -> String {
        let mut parts = vec![format!("{action}: {} submitted", self.submitted)];
        if self.skipped > 0 {
            parts.push(format!("{} skipped", self.skipped));
        }
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        parts.join(", ")
    }

    /// Wait for every accepted task, in submission order.
    pub async fn wait_all(&mut self) -> Vec<(TargetIdentity, TaskOutcome)> {
        let tickets = std::mem::take(&mut self.tickets);
        let mut outcomes = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let target = ticket.target.clone();
            outcomes.push((target, ticket.wait().await));
        }
        outcomes
    }
}
