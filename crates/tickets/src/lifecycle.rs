//! Status transitions.
//!
//! Every transition returns a new record with `version` bumped by one, so a
//! compare-and-swap against the previous version detects concurrent writers.

use chrono::{DateTime, Duration, Utc};

use crate::types::{StatusKind, TicketId, TicketStatus};

/// Whether a `processing` ticket has gone quiet for longer than `job_timeout`,
/// meaning the worker that claimed it is presumed dead.
pub fn is_orphaned(status: &TicketStatus, now: DateTime<Utc>, job_timeout: Duration) -> bool {
    if status.status != StatusKind::Processing {
        return false;
    }
    match status.last_active() {
        Some(at) => now - at > job_timeout,
        // Processing without a start stamp can only come from a broken writer.
        None => true,
    }
}

/// The record a worker should swap in to claim this ticket, or `None` when
/// the ticket is not claimable (already processing, or terminal).
pub fn claim_transition(
    status: &TicketStatus,
    worker: &str,
    now: DateTime<Utc>,
    job_timeout: Duration,
) -> Option<TicketStatus> {
    let claimable = match status.status {
        StatusKind::Queued => true,
        StatusKind::Processing => is_orphaned(status, now, job_timeout),
        StatusKind::Success | StatusKind::Error => false,
    };
    if !claimable {
        return None;
    }

    let mut next = status.clone();
    next.status = StatusKind::Processing;
    next.version = status.version + 1;
    if next.meta.start_time.is_none() {
        next.meta.start_time = Some(now);
    } else {
        next.meta.last_resume_time = Some(now);
    }
    next.meta.workers.push(worker.to_string());
    next.meta.tries += 1;
    Some(next)
}

/// Hand a claimed ticket back to the queue.
pub fn defer_transition(status: &TicketStatus, now: DateTime<Utc>) -> TicketStatus {
    let mut next = status.clone();
    next.status = StatusKind::Queued;
    next.version = status.version + 1;
    next.meta.last_deferred_time = Some(now);
    next
}

pub fn finish_transition(status: &TicketStatus, outcome: StatusKind, now: DateTime<Utc>) -> TicketStatus {
    let mut next = status.clone();
    next.status = outcome;
    next.version = status.version + 1;
    next.meta.end_time = Some(now);
    next
}

/// Terminal `success` record pointing at the ticket that replaced this one.
pub fn resubmit_transition(status: &TicketStatus, new_ticket: &TicketId, now: DateTime<Utc>) -> TicketStatus {
    let mut next = finish_transition(status, StatusKind::Success, now);
    next.meta.resubmitted_as = Some(new_ticket.clone());
    next
}
