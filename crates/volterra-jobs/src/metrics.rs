//! Prometheus metrics for queues, workers and the frame pipeline.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "volterra_jobs_enqueued_total";
    /// Total jobs claimed by workers.
    pub const JOBS_DEQUEUED_TOTAL: &str = "volterra_jobs_dequeued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "volterra_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_FAILED_TOTAL: &str = "volterra_jobs_failed_total";
    /// Total attempts rescheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "volterra_jobs_retried_total";
    /// Total jobs dead-lettered.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "volterra_jobs_dead_lettered_total";
    /// Redelivered jobs skipped because of a completion marker.
    pub const JOBS_SKIPPED_TOTAL: &str = "volterra_jobs_skipped_total";
    /// Expired claims handed back to the ready queue.
    pub const JOBS_RECOVERED_TOTAL: &str = "volterra_jobs_recovered_total";
    /// Enqueue attempts retried by producers.
    pub const ENQUEUE_RETRIES_TOTAL: &str = "volterra_jobs_enqueue_retries_total";

    /// Current ready jobs.
    pub const JOBS_PENDING: &str = "volterra_jobs_pending";
    /// Current claimed jobs.
    pub const JOBS_ACTIVE: &str = "volterra_jobs_active";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "volterra_jobs_duration_seconds";

    /// Workers busy with a job.
    pub const WORKERS_ACTIVE: &str = "volterra_jobs_workers_active";

    /// Frames decoded and persisted.
    pub const FRAMES_PERSISTED_TOTAL: &str = "volterra_jobs_frames_persisted_total";
    /// Frames that failed to decode or persist.
    pub const FRAMES_FAILED_TOTAL: &str = "volterra_jobs_frames_failed_total";
    /// Analysis frames counted complete.
    pub const ANALYSIS_FRAMES_COMPLETED_TOTAL: &str = "volterra_jobs_analysis_frames_completed_total";
    /// Analysis frames settled as failed.
    pub const ANALYSIS_FRAMES_FAILED_TOTAL: &str = "volterra_jobs_analysis_frames_failed_total";

    /// Job updates published.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "volterra_jobs_events_published_total";
    /// Job updates that could not be published.
    pub const EVENTS_PUBLISH_FAILED_TOTAL: &str = "volterra_jobs_events_publish_failed_total";
    /// Buffered updates evicted before a client became ready.
    pub const EVENTS_EVICTED_TOTAL: &str = "volterra_jobs_events_evicted_total";
    /// Clients that moved from one team to another.
    pub const TEAM_SWITCHES_TOTAL: &str = "volterra_jobs_team_switches_total";
    /// Connected realtime clients.
    pub const CLIENTS_CONNECTED: &str = "volterra_jobs_clients_connected";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_DEQUEUED_TOTAL, "Total number of jobs claimed by workers");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed job attempts");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of rescheduled attempts");
    describe_counter!(names::JOBS_DEAD_LETTERED_TOTAL, "Total number of dead-lettered jobs");
    describe_counter!(
        names::JOBS_SKIPPED_TOTAL,
        "Redelivered jobs skipped because they were already completed"
    );
    describe_counter!(names::JOBS_RECOVERED_TOTAL, "Expired claims returned to the ready queue");
    describe_counter!(names::ENQUEUE_RETRIES_TOTAL, "Enqueue attempts retried by producers");

    describe_gauge!(names::JOBS_PENDING, "Current number of ready jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of claimed jobs");
    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_gauge!(names::WORKERS_ACTIVE, "Workers currently running a job");

    describe_counter!(names::FRAMES_PERSISTED_TOTAL, "Frames decoded and persisted");
    describe_counter!(names::FRAMES_FAILED_TOTAL, "Frames that failed to decode or persist");
    describe_counter!(
        names::ANALYSIS_FRAMES_COMPLETED_TOTAL,
        "Analysis frames counted complete"
    );
    describe_counter!(
        names::ANALYSIS_FRAMES_FAILED_TOTAL,
        "Analysis frames settled as failed"
    );

    describe_counter!(names::EVENTS_PUBLISHED_TOTAL, "Job updates published");
    describe_counter!(names::EVENTS_PUBLISH_FAILED_TOTAL, "Job updates that failed to publish");
    describe_counter!(
        names::EVENTS_EVICTED_TOTAL,
        "Buffered updates evicted before the client signalled readiness"
    );
    describe_counter!(names::TEAM_SWITCHES_TOTAL, "Clients that switched teams");
    describe_gauge!(names::CLIENTS_CONNECTED, "Connected realtime clients");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str) {
        counter!(names::JOBS_ENQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job claimed.
    pub fn job_dequeued(queue: &str) {
        counter!(names::JOBS_DEQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn job_failed(queue: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a rescheduled attempt.
    pub fn job_retried(queue: &str) {
        counter!(names::JOBS_RETRIED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a dead-lettered job.
    pub fn job_dead_lettered(queue: &str) {
        counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a redelivery skipped by the completion marker.
    pub fn job_skipped(queue: &str) {
        counter!(names::JOBS_SKIPPED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record expired claims handed back.
    pub fn jobs_recovered(queue: &str, count: u64) {
        counter!(names::JOBS_RECOVERED_TOTAL, "queue" => queue.to_string()).increment(count);
    }

    /// Record a producer-side enqueue retry.
    pub fn enqueue_retried(queue: &str) {
        counter!(names::ENQUEUE_RETRIES_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Update queue size gauges.
    pub fn update_queue_sizes(queue: &str, pending: u64, active: u64) {
        gauge!(names::JOBS_PENDING, "queue" => queue.to_string()).set(pending as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(active as f64);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update busy worker count.
    pub fn update_active(pool_id: &str, active: usize) {
        gauge!(names::WORKERS_ACTIVE, "pool_id" => pool_id.to_string()).set(active as f64);
    }
}

/// Frame pipeline metrics recorder.
#[derive(Clone)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record the outcome of one chunk.
    pub fn chunk_processed(persisted: usize, failed: usize) {
        counter!(names::FRAMES_PERSISTED_TOTAL).increment(persisted as u64);
        counter!(names::FRAMES_FAILED_TOTAL).increment(failed as u64);
    }

    /// Record one analysis frame counted complete.
    pub fn analysis_frame_completed(plugin: &str) {
        counter!(
            names::ANALYSIS_FRAMES_COMPLETED_TOTAL,
            "plugin" => plugin.to_string()
        )
        .increment(1);
    }

    /// Record one analysis frame settled as failed.
    pub fn analysis_frame_failed(plugin: &str) {
        counter!(
            names::ANALYSIS_FRAMES_FAILED_TOTAL,
            "plugin" => plugin.to_string()
        )
        .increment(1);
    }
}

/// Event fan-out metrics recorder.
#[derive(Clone)]
pub struct EventMetrics;

impl EventMetrics {
    /// Record a published update.
    pub fn published() {
        counter!(names::EVENTS_PUBLISHED_TOTAL).increment(1);
    }

    /// Record a failed publish.
    pub fn publish_failed() {
        counter!(names::EVENTS_PUBLISH_FAILED_TOTAL).increment(1);
    }

    /// Record buffered updates evicted.
    pub fn evicted(count: u64) {
        counter!(names::EVENTS_EVICTED_TOTAL).increment(count);
    }

    /// Record a client leaving one team for another.
    pub fn team_switched() {
        counter!(names::TEAM_SWITCHES_TOTAL).increment(1);
    }

    /// Update connected client gauge.
    pub fn clients(count: usize) {
        gauge!(names::CLIENTS_CONNECTED).set(count as f64);
    }
}
