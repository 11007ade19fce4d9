//! End-to-end scheduling scenarios on the in-memory store.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ticker_core::coordination::heartbeat_ttl;
use ticker_core::prelude::*;
use ticker_core::{CoordinationStore, InMemoryCoordination, SchedulerEvent};

use common::{init_tracing, options, wait_for_occurrences, wait_for_terminal, RecordingExceptions};

fn registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register_fn("ok", HandlerOptions::default(), |_ctx, _p: Option<()>| async { Ok(()) })
        .register_fn("always_fails", HandlerOptions::default(), |_ctx, _p: Option<()>| async {
            Err(anyhow::anyhow!("boom").into())
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_past_due_job_completes_done() {
    init_tracing();
    let handle = Scheduler::builder()
        .registry(registry())
        .options(options("node-1"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let jobs = handle.time_jobs();
    let job = jobs
        .schedule(NewTimeJob::new("ok").at(Utc::now() - chrono::Duration::seconds(2)))
        .await
        .unwrap();

    let job = wait_for_terminal(&jobs, job.id).await;
    assert_eq!(job.status(), JobStatus::Done);
    assert_eq!(job.state.retry_count, 0);
    assert!(job.state.executed_at.is_some());
    assert!(job.state.elapsed_ms.is_some());
    assert_eq!(job.state.lock_holder, None);
    assert!(handle.shutdown().await);
}

#[tokio::test]
async fn test_on_time_job_completes_due_done() {
    let handle = Scheduler::builder()
        .registry(registry())
        .options(options("node-1"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let jobs = handle.time_jobs();
    let job = jobs
        .schedule(NewTimeJob::new("ok").at(Utc::now() + chrono::Duration::milliseconds(300)))
        .await
        .unwrap();
    let job = wait_for_terminal(&jobs, job.id).await;
    assert_eq!(job.status(), JobStatus::DueDone);
    assert!(handle.shutdown().await);
}

#[tokio::test]
async fn test_retries_then_fails() {
    init_tracing();
    let exceptions = Arc::new(RecordingExceptions::default());
    let scheduler = Scheduler::builder()
        .registry(registry())
        .options(options("node-1"))
        .exception_handler(exceptions.clone())
        .build()
        .unwrap();
    let mut events = scheduler.subscribe();
    let handle = scheduler.start().await.unwrap();

    let jobs = handle.time_jobs();
    let job = jobs
        .schedule(NewTimeJob::new("always_fails").at(Utc::now()).retries(2, vec![1, 2]))
        .await
        .unwrap();

    let job = wait_for_terminal(&jobs, job.id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.state.retry_count, 2);
    assert!(job.state.exception.as_deref().unwrap_or_default().contains("boom"));

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::RetryScheduled { id, attempt, at, .. } = event {
            if id == job.id {
                retries.push((attempt, at));
            }
        }
    }
    assert_eq!(retries.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(), vec![2, 3]);

    let failures = exceptions.failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, job.id);
    assert_eq!(failures[0].kind, JobKind::Time);
    drop(failures);
    assert!(handle.shutdown().await);
}

#[tokio::test]
async fn test_cron_every_ten_seconds_keeps_one_pending() {
    init_tracing();
    let runs = Arc::new(AtomicU32::new(0));
    let registry = {
        let runs = Arc::clone(&runs);
        HandlerRegistry::builder()
            .register_fn("tick", HandlerOptions::default(), move |_ctx, _p: Option<()>| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap()
    };
    let handle = Scheduler::builder()
        .registry(registry)
        .options(options("node-1"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let crons = handle.cron_jobs();
    let definition = crons.create(NewCronJob::new("tick", "*/10 * * * * *")).await.unwrap();

    let first = crons.occurrences(definition.id).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].execution_time.timestamp() % 10, 0);
    assert!(first[0].execution_time > Utc::now() - chrono::Duration::seconds(1));

    let occurrences = wait_for_occurrences(&crons, definition.id, |all| {
        all.iter().any(|o| o.status().is_terminal())
    })
    .await;
    let done: Vec<_> = occurrences.iter().filter(|o| o.status().is_terminal()).collect();
    let pending: Vec<_> = occurrences.iter().filter(|o| o.state.awaiting_first_run()).collect();
    assert_eq!(done.len(), 1);
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].execution_time - done[0].execution_time,
        chrono::Duration::seconds(10)
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(handle.shutdown().await);
}

#[tokio::test]
async fn test_failed_parent_releases_on_failure_child_only() {
    init_tracing();
    let handle = Scheduler::builder()
        .registry(registry())
        .options(options("node-1"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let jobs = handle.time_jobs();
    let parent = jobs
        .schedule(
            NewTimeJob::new("always_fails")
                .at(Utc::now())
                .child(NewTimeJob::new("ok").description("a").run_condition(RunCondition::OnSuccess))
                .child(NewTimeJob::new("ok").description("b").run_condition(RunCondition::OnFailure)),
        )
        .await
        .unwrap();

    let parent = wait_for_terminal(&jobs, parent.id).await;
    assert_eq!(parent.status(), JobStatus::Failed);

    let children = jobs.children(parent.id).await.unwrap();
    let a = children.iter().find(|c| c.description.as_deref() == Some("a")).unwrap();
    let b = children.iter().find(|c| c.description.as_deref() == Some("b")).unwrap();

    let a = wait_for_terminal(&jobs, a.id).await;
    assert_eq!(a.status(), JobStatus::Skipped);
    assert!(a.state.executed_at.is_none());
    assert!(a.state.skipped_reason.is_some());

    let b = wait_for_terminal(&jobs, b.id).await;
    assert!(matches!(b.status(), JobStatus::Done | JobStatus::DueDone));
    assert!(handle.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_dead_node_locks_released_on_startup() {
    init_tracing();
    let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
    let coordination = InMemoryCoordination::new();

    // Node A claims J, writes one heartbeat and dies.
    let seed = Scheduler::builder()
        .store(Arc::clone(&store))
        .registry(registry())
        .options(options("seed"))
        .build()
        .unwrap();
    let job = seed
        .time_jobs()
        .schedule(NewTimeJob::new("ok").at(Utc::now()))
        .await
        .unwrap();
    assert!(store.try_claim(JobKind::Time, job.id, "node-a", Utc::now()).await.unwrap());
    let ttl = heartbeat_ttl(Duration::from_secs(1));
    coordination.heartbeat("node-a", ttl).await.unwrap();

    // While A's heartbeat is live, B leaves the lock alone.
    tokio::time::advance(ttl - Duration::from_secs(1)).await;
    let early = Scheduler::builder()
        .store(Arc::clone(&store))
        .coordination(Arc::new(coordination.clone()))
        .registry(registry())
        .options(options("node-b"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let held = store.get_time_job(job.id).await.unwrap().unwrap();
    assert_eq!(held.status(), JobStatus::Queued);
    assert_eq!(held.state.lock_holder.as_deref(), Some("node-a"));
    early.shutdown().await;

    // After the TTL, B's startup reverts J.
    tokio::time::advance(Duration::from_secs(2)).await;
    let handle = Scheduler::builder()
        .store(Arc::clone(&store))
        .coordination(Arc::new(coordination.clone()))
        .registry(registry())
        .options(options("node-b"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let released = store.get_time_job(job.id).await.unwrap().unwrap();
    assert_eq!(released.status(), JobStatus::Idle);
    assert_eq!(released.state.lock_holder, None);

    // And B then runs it.
    tokio::time::resume();
    let done = wait_for_terminal(&handle.time_jobs(), job.id).await;
    assert!(matches!(done.status(), JobStatus::Done | JobStatus::DueDone));
    assert!(!coordination.live_nodes().await.unwrap().contains(&"node-a".to_string()));
    assert!(handle.shutdown().await);
}
