//! End-to-end pipeline tests on the in-memory backends.

mod common;

use async_trait::async_trait;
use common::{Pipeline, ScriptedRunner, PLUGIN, TEAM};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use volterra_jobs::prelude::*;
use volterra_jobs::{
    AnalysisProcessor, AnalysisStatus, ClientEvent, CommandOutput, CommandRunner,
    CompletionOutcome, FailOutcome, IngestRequest, JobOutcome, JobUpdate, JobUpdateEnvelope,
    LocalEventBus, NullPublisher, PluginRegistry, TeamBroadcaster, TrajectoryProcessor,
    WorkerPoolConfig,
};
use volterra_trajectory::FrameStore;

fn request(trajectory_id: &str) -> AnalysisRequest {
    AnalysisRequest {
        team_id: TEAM.into(),
        trajectory_id: trajectory_id.into(),
        plugin: PLUGIN.into(),
        config: serde_json::json!({ "cutoff": 3.2, "verbose": true }),
        ..Default::default()
    }
}

fn drain_events(rx: &mut broadcast::Receiver<JobUpdateEnvelope>) -> Vec<JobUpdateEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_type(events: &[JobUpdateEnvelope], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.payload.event_type.as_deref() == Some(event_type))
        .count()
}

#[tokio::test]
async fn test_ingest_then_analyse_every_frame() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 2);
    let mut rx = pipeline.bus.receiver();

    let trajectory_id = pipeline.ingest("traj-a", &[0, 100, 200, 300, 400], &[]).await;

    let stats = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap();
    assert!(stats.is_complete());
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.persisted_timesteps.len(), 5);
    assert!(stats.failed_frames.is_empty());
    assert_eq!(
        pipeline.frames.timesteps(&trajectory_id).await.unwrap(),
        vec![0, 100, 200, 300, 400]
    );

    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();
    assert_eq!(receipt.total_frames, 5);
    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 5);

    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.completed_frames, 5);
    assert_eq!(analysis.status, AnalysisStatus::Completed);
    assert!(analysis.finished_at.is_some());

    let mut calls = pipeline.runner.calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![0, 100, 200, 300, 400]);

    let events = drain_events(&mut rx);
    assert_eq!(count_type(&events, "trajectory_processed"), 1);
    assert_eq!(count_type(&events, "analysis_completed"), 1);
    assert!(events.iter().all(|e| e.team_id == TEAM));
}

#[tokio::test]
async fn test_failed_frames_are_retried_exactly_once() {
    let pipeline = Pipeline::new(ScriptedRunner::failing(&[100, 300]), 5);
    let trajectory_id = pipeline.ingest("traj-b", &[0, 100, 200, 300, 400], &[]).await;
    let mut rx = pipeline.bus.receiver();

    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();
    let id = receipt.analysis_id.as_str();
    pipeline.analysis_pool.drain().await.unwrap();

    let analysis = pipeline.scheduler.progress(id).await.unwrap();
    assert_eq!(analysis.completed_frames, 3);
    assert_eq!(analysis.status, AnalysisStatus::Running);
    let sets = pipeline.analyses.frame_sets(id).await.unwrap().unwrap();
    assert_eq!(sets.failed.iter().copied().collect::<Vec<_>>(), vec![100, 300]);
    assert!(sets.pending.is_empty());
    assert_eq!(pipeline.queue.dead_letters().len(), 2);

    // Plugin inputs are deleted whether the plugin succeeded or failed.
    let folder = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap().folder_path;
    let inputs = folder.join("analyses").join(id);
    for ts in [0, 100, 200, 300, 400] {
        assert!(!inputs.join(format!("{ts}.lammpstrj")).exists());
    }

    let summary = pipeline.scheduler.retry_failed_frames(id, None).await.unwrap();
    assert_eq!(summary.retried_frames, 2);
    assert_eq!(summary.failed_timesteps, vec![100, 300]);

    // Already pending: a second retry enqueues nothing.
    let again = pipeline.scheduler.retry_failed_frames(id, None).await.unwrap();
    assert_eq!(again.retried_frames, 0);
    assert_eq!(pipeline.queue.queue_length(QueueKind::AnalysisProcessing).await.unwrap(), 2);

    pipeline.runner.heal();
    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 2);

    let analysis = pipeline.scheduler.progress(id).await.unwrap();
    assert_eq!(analysis.completed_frames, 5);
    assert_eq!(analysis.status, AnalysisStatus::Completed);
    assert!(!inputs.exists());
    assert_eq!(pipeline.scheduler.retry_failed_frames(id, None).await.unwrap().retried_frames, 0);

    let events = drain_events(&mut rx);
    assert_eq!(count_type(&events, "analysis_completed"), 1);
}

#[tokio::test]
async fn test_undecodable_frame_is_recorded_and_retried() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 2);
    let mut rx = pipeline.bus.receiver();
    let trajectory_id = pipeline.ingest("traj-c", &[10, 20, 30, 40], &[30]).await;

    let stats = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap();
    assert!(stats.is_complete());
    assert_eq!(stats.failed_timesteps(), vec![30]);
    assert_eq!(stats.persisted_timesteps.len(), 3);
    assert!(!pipeline.frames.exists(&trajectory_id, 30).await.unwrap());

    // Repair the frame file in place, then retry.
    let failed = &stats.failed_frames[&30];
    std::fs::write(&failed.frame_file_path, common::frame_text(30, true)).unwrap();

    let summary = pipeline.ingestor.retry_failed_frames(&trajectory_id, None).await.unwrap();
    assert_eq!(summary.retried_frames, 1);
    assert_eq!(summary.failed_timesteps, vec![30]);
    pipeline.trajectory_pool.drain().await.unwrap();

    let stats = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap();
    assert!(stats.failed_frames.is_empty());
    assert_eq!(stats.persisted_timesteps.len(), 4);
    assert_eq!(stats.total_files, 4);
    assert!(pipeline.frames.exists(&trajectory_id, 30).await.unwrap());

    let nothing = pipeline.ingestor.retry_failed_frames(&trajectory_id, None).await.unwrap();
    assert_eq!(nothing.retried_frames, 0);

    let events = drain_events(&mut rx);
    assert_eq!(count_type(&events, "trajectory_processed"), 1);
}

#[tokio::test]
async fn test_trajectory_retry_is_idempotent_until_recorded() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 2);
    let trajectory_id = pipeline.ingest("traj-r", &[10, 20, 30, 40], &[20, 30]).await;

    let first = pipeline.ingestor.retry_failed_frames(&trajectory_id, None).await.unwrap();
    assert_eq!(first.retried_frames, 2);
    let second = pipeline.ingestor.retry_failed_frames(&trajectory_id, None).await.unwrap();
    assert_eq!(second.retried_frames, 0);
    assert_eq!(second.failed_timesteps, vec![20, 30]);
    assert_eq!(pipeline.queue.queue_length(QueueKind::TrajectoryProcessing).await.unwrap(), 1);

    // The retry chunk fails again without a repair; the frames become retryable.
    assert_eq!(pipeline.trajectory_pool.drain().await.unwrap(), 1);
    let stats = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap();
    assert_eq!(stats.failed_timesteps(), vec![20, 30]);
    assert!(stats.retrying.is_empty());

    let third = pipeline.ingestor.retry_failed_frames(&trajectory_id, None).await.unwrap();
    assert_eq!(third.retried_frames, 2);
}

#[tokio::test]
async fn test_chunks_complete_in_any_order() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 2);
    let dump = common::write_dump(&pipeline.upload_dir(), "rev.dump", &[1, 2, 3, 4, 5, 6], &[]);
    let receipt = pipeline
        .ingestor
        .ingest(IngestRequest {
            team_id: TEAM.into(),
            trajectory_id: Some("traj-rev".into()),
            name: "reverse".into(),
            sources: vec![dump],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(receipt.total_chunks, 3);

    let processor = TrajectoryProcessor::new(
        pipeline.frames.clone(),
        pipeline.trajectories.clone(),
        pipeline.bus.clone(),
    );
    let envelopes: Vec<JobEnvelope> = receipt
        .job_ids
        .iter()
        .map(|id| pipeline.queue.get(id).unwrap())
        .collect();

    for (i, envelope) in envelopes.iter().rev().enumerate() {
        processor.handle(envelope, &envelope.to_context("w")).await.unwrap();
        let stats = pipeline.trajectories.get("traj-rev").await.unwrap().unwrap();
        assert_eq!(stats.is_complete(), i == 2);
    }

    // A redelivered chunk changes nothing.
    processor
        .handle(&envelopes[1], &envelopes[1].to_context("w"))
        .await
        .unwrap();
    let stats = pipeline.trajectories.get("traj-rev").await.unwrap().unwrap();
    assert_eq!(stats.completed_chunks.len(), 3);
    assert_eq!(stats.total_files, 6);
    assert_eq!(stats.persisted_timesteps.len(), 6);
}

#[tokio::test]
async fn test_redelivered_frame_counts_once() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-d", &[5, 6], &[]).await;
    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();

    let kind = QueueKind::AnalysisProcessing;
    let crashed = pipeline
        .queue
        .dequeue(kind, "crashed-worker", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    // Only the other frame is claimable while the crashed claim is held.
    let other = pipeline.analysis_pool.run_once().await.unwrap().unwrap();
    assert_eq!(other.outcome, JobOutcome::Completed);
    assert!(pipeline.analysis_pool.run_once().await.unwrap().is_none());
    assert_eq!(pipeline.queue.recover_expired(kind).await.unwrap(), 1);
    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 1);
    assert!(pipeline.queue.is_completed(&crashed.job_id).await.unwrap());

    // The broker delivers the finished job once more.
    pipeline.queue.enqueue(crashed.clone()).await.unwrap();
    let processed = pipeline.analysis_pool.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, JobOutcome::Skipped);

    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.completed_frames, 2);
    assert_eq!(pipeline.runner.calls().len(), 2);
}

#[tokio::test]
async fn test_frame_in_flight_elsewhere_is_deferred() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-e", &[7], &[]).await;
    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();

    assert!(pipeline
        .analyses
        .claim_frame(&receipt.analysis_id, 7, "another-job", Duration::from_secs(60))
        .await
        .unwrap());

    let processed = pipeline.analysis_pool.run_once().await.unwrap().unwrap();
    assert!(matches!(processed.outcome, JobOutcome::Failed(FailOutcome::Retried { .. })));
    assert!(pipeline.runner.calls().is_empty());

    let sets = pipeline.analyses.frame_sets(&receipt.analysis_id).await.unwrap().unwrap();
    assert!(sets.failed.is_empty());
    assert!(sets.completed.is_empty());
}

#[tokio::test]
async fn test_cancelled_analysis_ignores_remaining_frames() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-f", &[1, 2, 3], &[]).await;
    let mut rx = pipeline.bus.receiver();
    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();

    pipeline.analysis_pool.run_once().await.unwrap();
    assert!(pipeline.scheduler.cancel(&receipt.analysis_id).await.unwrap());
    assert!(!pipeline.scheduler.cancel(&receipt.analysis_id).await.unwrap());

    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 2);
    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.completed_frames, 1);
    assert_eq!(analysis.status, AnalysisStatus::Cancelled);
    assert_eq!(pipeline.runner.calls().len(), 1);

    let events = drain_events(&mut rx);
    assert_eq!(count_type(&events, "analysis_completed"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_finish_exactly_once() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 10);
    let timesteps: Vec<u64> = (0..50).map(|i| i * 10).collect();
    let trajectory_id = pipeline.ingest("traj-g", &timesteps, &[]).await;
    let mut rx = pipeline.bus.receiver();

    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();
    let pool = pipeline.analysis_pool.clone();
    let running = tokio::spawn(async move { pool.start().await });

    let mut finished = false;
    for _ in 0..1000 {
        let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
        if analysis.is_finished() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pipeline.analysis_pool.stop();
    running.await.unwrap().unwrap();
    assert!(finished);

    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.completed_frames, 50);
    assert_eq!(pipeline.runner.calls().len(), 50);

    let events = drain_events(&mut rx);
    assert_eq!(count_type(&events, "analysis_completed"), 1);
}

#[tokio::test]
async fn test_concurrent_completions_of_one_timestep() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-h", &[1, 2], &[]).await;
    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let analyses = pipeline.analyses.clone();
            let id = receipt.analysis_id.clone();
            tokio::spawn(async move { analyses.record_completion(&id, 1).await.unwrap() })
        })
        .collect();
    let mut recorded = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), CompletionOutcome::Recorded { .. }) {
            recorded += 1;
        }
    }
    assert_eq!(recorded, 1);

    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.completed_frames, 1);
    assert!(!analysis.is_finished());
}

#[tokio::test]
async fn test_broadcaster_relays_bus_updates() {
    let bus = Arc::new(LocalEventBus::new(64));
    let broadcaster = TeamBroadcaster::new(3);
    let mut live = broadcaster.subscribe_to_team("live", TEAM, None);
    broadcaster.mark_ready("live");
    let mut late = broadcaster.subscribe_to_team("late", TEAM, None);
    let mut other = broadcaster.subscribe_to_team("other", "team-2", None);
    broadcaster.mark_ready("other");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let relay = {
        let broadcaster = broadcaster.clone();
        let subscriber: Arc<dyn EventSubscriber> = bus.clone();
        tokio::spawn(async move { broadcaster.run(subscriber, shutdown_rx).await })
    };
    for _ in 0..200 {
        if bus.receiver_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..5 {
        let mut update = JobUpdate::event("progress");
        update.message = Some(format!("m{i}"));
        bus.publish(TEAM, update).await.unwrap();
    }

    for i in 0..5 {
        let event = tokio::time::timeout(Duration::from_secs(1), live.recv())
            .await
            .unwrap()
            .unwrap();
        let ClientEvent::JobUpdate(update) = event else { panic!("unexpected {event:?}") };
        assert_eq!(update.message, Some(format!("m{i}")));
    }

    assert_eq!(broadcaster.mark_ready("late"), 3);
    assert_eq!(late.recv().await.unwrap(), ClientEvent::UpdatesDropped { count: 2 });
    for i in 2..5 {
        let ClientEvent::JobUpdate(update) = late.recv().await.unwrap() else { panic!("expected update") };
        assert_eq!(update.message, Some(format!("m{i}")));
    }
    assert!(other.try_recv().is_err());

    shutdown_tx.send(()).unwrap();
    relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_broadcast_failure_does_not_fail_jobs() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-i", &[1], &[]).await;
    let receipt = pipeline.scheduler.submit(request(&trajectory_id)).await.unwrap();

    let registry = Arc::new(PluginRegistry::default().with_plugin(PLUGIN, "/opt/plugins/cna"));
    let pool = WorkerPool::new(
        pipeline.queue.clone(),
        Arc::new(AnalysisProcessor::new(
            pipeline.frames.clone(),
            pipeline.analyses.clone(),
            registry,
            pipeline.runner.clone(),
            Arc::new(NullPublisher),
        )),
        Arc::new(NullPublisher),
        common::pool_config(),
    );

    let processed = pool.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, JobOutcome::Completed);
    let analysis = pipeline.scheduler.progress(&receipt.analysis_id).await.unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Completed);
}

/// A plugin that never finishes within the pool's job timeout.
struct StalledRunner;

#[async_trait]
impl CommandRunner for StalledRunner {
    async fn execute(&self, _: &Path, _: &[String], _: &Path) -> JobResult<CommandOutput> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn single_attempt_scheduler(pipeline: &Pipeline) -> AnalysisScheduler {
    AnalysisScheduler::new(
        JobProducer::new(pipeline.queue.clone(), &ProducerConfig::default()),
        pipeline.analyses.clone(),
        pipeline.trajectories.clone(),
        Arc::new(PluginRegistry::default().with_plugin(PLUGIN, "/opt/plugins/cna")),
    )
    .with_retry_policy(RetryPolicy::none())
}

#[tokio::test]
async fn test_timed_out_frame_becomes_retryable() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-j", &[1], &[]).await;
    let scheduler = single_attempt_scheduler(&pipeline);
    let receipt = scheduler.submit(request(&trajectory_id)).await.unwrap();
    let id = receipt.analysis_id.as_str();

    let stalled_pool = WorkerPool::new(
        pipeline.queue.clone(),
        Arc::new(AnalysisProcessor::new(
            pipeline.frames.clone(),
            pipeline.analyses.clone(),
            Arc::new(PluginRegistry::default().with_plugin(PLUGIN, "/opt/plugins/cna")),
            Arc::new(StalledRunner),
            pipeline.bus.clone(),
        )),
        pipeline.bus.clone(),
        WorkerPoolConfig {
            job_timeout: Duration::from_millis(50),
            ..common::pool_config()
        },
    );

    let processed = stalled_pool.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, JobOutcome::Failed(FailOutcome::DeadLettered));

    let sets = pipeline.analyses.frame_sets(id).await.unwrap().unwrap();
    assert!(sets.pending.is_empty());
    assert_eq!(sets.failed.iter().copied().collect::<Vec<_>>(), vec![1]);
    let folder = pipeline.trajectories.get(&trajectory_id).await.unwrap().unwrap().folder_path;
    assert!(!folder.join("analyses").join(id).join("1.lammpstrj").exists());

    let summary = scheduler.retry_failed_frames(id, None).await.unwrap();
    assert_eq!(summary.retried_frames, 1);
    assert_eq!(summary.failed_timesteps, vec![1]);

    // The retried job is not blocked by the timed-out attempt's frame guard.
    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 1);
    let analysis = scheduler.progress(id).await.unwrap();
    assert_eq!(analysis.completed_frames, 1);
    assert_eq!(analysis.status, AnalysisStatus::Completed);
}

#[tokio::test]
async fn test_frame_in_flight_on_last_attempt_becomes_retryable() {
    let pipeline = Pipeline::new(ScriptedRunner::default(), 4);
    let trajectory_id = pipeline.ingest("traj-k", &[7], &[]).await;
    let scheduler = single_attempt_scheduler(&pipeline);
    let receipt = scheduler.submit(request(&trajectory_id)).await.unwrap();
    let id = receipt.analysis_id.as_str();

    assert!(pipeline
        .analyses
        .claim_frame(id, 7, "stuck-job", Duration::from_secs(60))
        .await
        .unwrap());

    let processed = pipeline.analysis_pool.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, JobOutcome::Failed(FailOutcome::DeadLettered));
    assert!(pipeline.runner.calls().is_empty());

    let sets = pipeline.analyses.frame_sets(id).await.unwrap().unwrap();
    assert!(sets.pending.is_empty());
    assert_eq!(sets.failed.iter().copied().collect::<Vec<_>>(), vec![7]);

    pipeline.analyses.release_frame(id, 7, "stuck-job").await.unwrap();
    assert_eq!(scheduler.retry_failed_frames(id, None).await.unwrap().retried_frames, 1);
    assert_eq!(pipeline.analysis_pool.drain().await.unwrap(), 1);
    assert_eq!(scheduler.progress(id).await.unwrap().completed_frames, 1);
}
