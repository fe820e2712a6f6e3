//! Schedule projection and lead aggregate status
//!
//! Pure functions over a lead's job list; the ingest pipeline persists the
//! results.

use chrono::Utc;

use lc_common::{EmailJob, EmailSchedule, JobCategory, JobStatus, LeadStatus, StepSnapshot};

/// Fold a job's current state into the per-lead schedule snapshot.
pub fn apply_to_schedule(schedule: &mut EmailSchedule, job: &EmailJob) {
    match job.category {
        JobCategory::Initial => {
            schedule.initial_status = job.status;
        }
        JobCategory::Followup => upsert_step(&mut schedule.followups, job),
        JobCategory::Conditional => upsert_step(&mut schedule.conditionals, job),
        // Manual sends live in the manual_mails projection.
        JobCategory::Manual => {}
    }
    schedule.updated_at = Utc::now();
}

fn upsert_step(steps: &mut Vec<StepSnapshot>, job: &EmailJob) {
    if let Some(existing) = steps.iter_mut().find(|s| s.name == job.email_type) {
        existing.status = job.status;
        existing.template_id = job.template_id.clone();
    } else {
        steps.push(StepSnapshot {
            name: job.email_type.clone(),
            status: job.status,
            template_id: job.template_id.clone(),
        });
    }
}

pub fn empty_schedule(lead_id: uuid::Uuid) -> EmailSchedule {
    EmailSchedule {
        lead_id,
        initial_status: JobStatus::Pending,
        followups: Vec::new(),
        conditionals: Vec::new(),
        updated_at: Utc::now(),
    }
}

/// Recompute the lead's aggregate `{step, state}` from its jobs.
///
/// Active jobs win (the journey is mid-flight; the earliest slot is the next
/// thing that will happen to this lead). Otherwise a terminal failure is the
/// headline; otherwise the furthest-progressed job. Rescheduled jobs are
/// superseded and ignored.
pub fn compute_lead_status(jobs: &[EmailJob]) -> Option<LeadStatus> {
    let relevant: Vec<&EmailJob> = jobs
        .iter()
        .filter(|j| j.status.counts_for_journey())
        .collect();

    if let Some(active) = relevant
        .iter()
        .filter(|j| j.status.is_active())
        .min_by_key(|j| j.scheduled_for)
    {
        return Some(LeadStatus::new(active.email_type.clone(), active.status));
    }

    if let Some(failed) = relevant
        .iter()
        .filter(|j| j.status.is_terminal_failure())
        .max_by_key(|j| j.updated_at)
    {
        return Some(LeadStatus::new(failed.email_type.clone(), failed.status));
    }

    relevant
        .iter()
        .filter(|j| j.status.rank().is_some())
        .max_by_key(|j| (j.status.rank(), j.updated_at))
        .map(|j| LeadStatus::new(j.email_type.clone(), j.status))
}
