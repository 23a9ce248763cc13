//! Integration tests for supervision, restore, push tokens and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, mock_plan, t0};
use fieldkeep::component::Component;
use fieldkeep::plan::{PlanRunState, PlanSchedule, PlanState, RunStateStore};
use fieldkeep::scheduler::{ScheduledEvent, SchedulerAnomaly, TaskScheduler};
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(60 * 60);

mod supervision_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_supervision_is_idempotent() {
        let h = harness();
        let first = h.orchestrator.start_supervision();
        let second = h.orchestrator.start_supervision();

        assert_eq!(first, second);
        assert_eq!(h.handles_for(&ScheduledEvent::HealthTest), vec![first]);
    }

    #[tokio::test]
    async fn test_health_pass_cancels_duplicate_and_orphaned_entries() {
        let h = harness();
        let ours = h.orchestrator.start_supervision();
        h.scheduler
            .schedule(HOUR, Some(HOUR), ScheduledEvent::HealthTest);
        h.scheduler
            .schedule(HOUR, None, ScheduledEvent::StartPlan("ghost".into()));

        let report = h.orchestrator.on_health_test().await;

        assert!(report.anomalies.iter().any(|a| matches!(
            a,
            SchedulerAnomaly::Duplicate { event, .. } if *event == ScheduledEvent::HealthTest
        )));
        assert_eq!(report.cancelled_entries, 2);
        assert_eq!(h.handles_for(&ScheduledEvent::HealthTest), vec![ours]);
        assert!(h.handles_for(&ScheduledEvent::StartPlan("ghost".into())).is_empty());
    }

    #[tokio::test]
    async fn test_health_pass_keeps_plan_owned_entries() {
        let h = harness();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let start_at = t0() + chrono::Duration::hours(1);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(start_at)))
            .unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        let event = ScheduledEvent::StartPlan("p".into());
        let first = h.firing(&h.owned_handle(&plan, &event));

        // an early firing leaves the superseded entry behind
        h.clock.advance(chrono::Duration::minutes(10));
        h.orchestrator.dispatch(first.clone()).await;
        assert_eq!(h.handles_for(&event).len(), 2);

        let report = h.orchestrator.on_health_test().await;
        assert_eq!(report.cancelled_entries, 1);

        let remaining = h.handles_for(&event);
        assert_eq!(remaining.len(), 1);
        assert!(plan.owns_handle(&remaining[0]));
        assert_ne!(remaining[0], first.handle);
        assert_eq!(plan.state(), PlanState::ScheduledStart);
    }

    #[tokio::test]
    async fn test_surplus_health_firing_is_cancelled() {
        let h = harness();
        let (_plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        let ours = h.orchestrator.start_supervision();
        let extra = h
            .scheduler
            .schedule(HOUR, Some(HOUR), ScheduledEvent::HealthTest);

        h.orchestrator.dispatch(h.firing(&extra)).await;

        assert!(!h.scheduler.contains(&extra));
        assert!(h.scheduler.contains(&ours));
        assert_eq!(mocks.local.test_calls(), 0);

        h.orchestrator.dispatch(h.firing(&ours)).await;
        assert_eq!(mocks.local.test_calls(), 1);
    }

    #[tokio::test]
    async fn test_firing_for_unknown_plan_is_cancelled() {
        let h = harness();
        let stray = h
            .scheduler
            .schedule(HOUR, None, ScheduledEvent::StopPlan("ghost".into()));

        h.orchestrator.dispatch(h.firing(&stray)).await;
        assert!(!h.scheduler.contains(&stray));
    }

    #[tokio::test]
    async fn test_health_pass_purges_expired_tasks() {
        use fieldkeep::queue::{PendingTask, RunMode};

        let h = harness();
        let queue = h.orchestrator.queue();
        let task = PendingTask::new("p/a", "p", "survey", t0())
            .with_expiration(t0() + chrono::Duration::minutes(30));
        queue.add(task, RunMode::Multiple).await.unwrap();

        h.clock.advance(chrono::Duration::hours(1));
        let report = h.orchestrator.on_health_test().await;

        assert_eq!(report.purged_tasks, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_delivers_scheduled_stop() {
        let h = harness();
        let (plan, mocks) = mock_plan("p", &["a"], &h.log);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(
                PlanSchedule::default().with_stop_at(t0() + chrono::Duration::hours(1)),
            ))
            .unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        let orchestrator = Arc::clone(&h.orchestrator);
        let firings = h.firings;
        let run_loop = tokio::spawn(orchestrator.run(firings));

        h.clock.advance(chrono::Duration::hours(1));
        tokio::time::sleep(HOUR + Duration::from_secs(60)).await;

        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.local.is_running());

        h.orchestrator.shutdown().await;
        run_loop.await.expect("Run loop panicked");
    }
}

mod push_token_tests {
    use super::*;

    #[tokio::test]
    async fn test_token_reaches_running_plans() {
        let h = harness();
        let (_a, a) = h.add_mock_plan("a", &["x"]);
        let (_b, b) = h.add_mock_plan("b", &["y"]);
        h.orchestrator.start_plan("a", false).await.unwrap();

        assert!(h.orchestrator.update_push_token(Some("tok-1".into())).await);
        assert_eq!(a.remote.push_token().as_deref(), Some("tok-1"));
        assert_eq!(b.remote.push_token(), None);
        assert!(!h.orchestrator.push_token_state().pending_refresh);

        // plans started later are handed the current token
        h.orchestrator.start_plan("b", false).await.unwrap();
        assert_eq!(b.remote.push_token().as_deref(), Some("tok-1"));

        assert!(h.orchestrator.update_push_token(None).await);
        assert_eq!(a.remote.push_token(), None);
        assert_eq!(h.log.with_action("delete_push_token").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried_by_health_pass() {
        let h = harness();
        let (_plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        mocks.remote.set_fail_push_token(true);

        assert!(!h.orchestrator.update_push_token(Some("tok".into())).await);
        let state = h.orchestrator.push_token_state();
        assert_eq!(state.token.as_deref(), Some("tok"));
        assert!(state.pending_refresh);

        // still failing: stays pending
        h.orchestrator.on_health_test().await;
        assert!(h.orchestrator.push_token_state().pending_refresh);

        mocks.remote.set_fail_push_token(false);
        h.orchestrator.on_health_test().await;
        assert!(!h.orchestrator.push_token_state().pending_refresh);
        assert_eq!(mocks.remote.push_token().as_deref(), Some("tok"));
        assert!(h.orchestrator.config().push_token_path().exists());
    }

    #[tokio::test]
    async fn test_failed_send_on_start_marks_refresh_pending() {
        let h = harness();
        let (_plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.update_push_token(Some("tok".into())).await;
        mocks.remote.set_fail_push_token(true);

        h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(h.orchestrator.push_token_state().pending_refresh);
        assert_eq!(mocks.remote.push_token(), None);
    }
}

mod restore_tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_resumes_running_and_paused_plans() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("run_states.json");
        {
            let previous = RunStateStore::load(&path).await.unwrap();
            previous.set("a", Some(PlanRunState::Running)).await.unwrap();
            previous.set("b", Some(PlanRunState::Paused)).await.unwrap();
            previous.set("ghost", Some(PlanRunState::Running)).await.unwrap();
        }

        let store = Arc::new(RunStateStore::load(&path).await.unwrap());
        let h = harness_with(dir, Some(store));
        let (a, a_mocks) = h.add_mock_plan("a", &["x"]);
        let (b, b_mocks) = h.add_mock_plan("b", &["y"]);
        let (c, _) = h.add_mock_plan("c", &["z"]);

        assert_eq!(h.orchestrator.restore().await, 2);

        assert_eq!(a.state(), PlanState::Running);
        assert_eq!(a_mocks.running_adapters(), 1);
        assert_eq!(b.state(), PlanState::Paused);
        assert_eq!(b_mocks.running_adapters(), 0);
        assert!(b_mocks.local.is_running());
        assert_eq!(c.state(), PlanState::Stopped);

        let persisted = RunStateStore::load(&path).await.unwrap().snapshot().await;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted.get("a"), Some(&PlanRunState::Running));
        assert_eq!(persisted.get("b"), Some(&PlanRunState::Paused));
    }

    #[tokio::test]
    async fn test_restore_ignores_scheduled_start_time() {
        let h = harness();
        h.run_states
            .set("p", Some(PlanRunState::Running))
            .await
            .unwrap();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(
                t0() + chrono::Duration::days(1),
            )))
            .unwrap();

        assert_eq!(h.orchestrator.restore().await, 1);
        assert_eq!(plan.state(), PlanState::Running);
    }

    #[tokio::test]
    async fn test_failed_restore_is_skipped() {
        let h = harness();
        h.run_states
            .set("p", Some(PlanRunState::Running))
            .await
            .unwrap();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        mocks.local.set_fail_start(true);

        assert_eq!(h.orchestrator.restore().await, 0);
        assert_eq!(plan.state(), PlanState::Stopped);
    }
}

mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_plans_and_keeps_run_states() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        h.orchestrator.start_supervision();

        h.orchestrator.shutdown().await;

        assert!(h.orchestrator.is_shutting_down());
        assert_eq!(plan.state(), PlanState::Stopped);
        assert_eq!(mocks.running_adapters(), 0);
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
        assert!(h.handles_for(&ScheduledEvent::HealthTest).is_empty());
        assert_eq!(h.run_states.get("p").await, Some(PlanRunState::Running));
    }

    #[tokio::test]
    async fn test_run_loop_exits_on_shutdown() {
        let h = harness();
        let run_loop = tokio::spawn(Arc::clone(&h.orchestrator).run(h.firings));

        h.orchestrator.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), run_loop)
            .await
            .expect("Run loop did not stop")
            .expect("Run loop panicked");
    }
}
