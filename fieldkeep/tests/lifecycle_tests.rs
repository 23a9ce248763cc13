//! Integration tests for the plan lifecycle controller.
//!
//! Plans are driven through the orchestrator with mock components; scheduled
//! firings are injected with `Orchestrator::dispatch` against a manual clock.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{harness, mock_plan, t0};
use fieldkeep::Error;
use fieldkeep::component::Component;
use fieldkeep::plan::{PlanRunState, PlanSchedule, PlanState, StartOutcome, StartStage};
use fieldkeep::scheduler::ScheduledEvent;

mod start_stop_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop_order() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a", "b"]);

        let outcome = h.orchestrator.start_plan("p", false).await.unwrap();
        let StartOutcome::Started(report) = outcome else {
            panic!("expected an immediate start, got {:?}", outcome);
        };
        assert_eq!(report.started_adapters(), 2);
        assert!(report.failed_adapters().is_empty());
        assert_eq!(plan.state(), PlanState::Running);
        assert_eq!(mocks.running_adapters(), 2);
        assert_eq!(
            h.log.with_action("start"),
            vec!["p.local:start", "p.remote:start", "p.a:start", "p.b:start"]
        );

        h.orchestrator.stop_plan("p").await.unwrap();
        assert_eq!(plan.state(), PlanState::Stopped);
        assert_eq!(
            h.log.with_action("stop"),
            vec!["p.a:stop", "p.b:stop", "p.remote:stop", "p.local:stop"]
        );
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
    }

    #[tokio::test]
    async fn test_stop_on_stopped_plan_is_noop() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);

        let report = h.orchestrator.stop_plan("p").await.unwrap();
        assert!(report.steps.is_empty());
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(h.log.events().is_empty());

        h.orchestrator.start_plan("p", false).await.unwrap();
        h.orchestrator.stop_plan("p").await.unwrap();
        let stops = h.log.with_action("stop").len();

        let report = h.orchestrator.stop_plan("p").await.unwrap();
        assert!(report.steps.is_empty());
        assert_eq!(h.log.with_action("stop").len(), stops);
        assert_eq!(mocks.adapter("p.a").stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_running() {
        let h = harness();
        let (_plan, mocks) = h.add_mock_plan("p", &["a"]);

        h.orchestrator.start_plan("p", false).await.unwrap();
        let outcome = h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(matches!(outcome, StartOutcome::AlreadyRunning));
        assert_eq!(mocks.adapter("p.a").start_calls(), 1);
    }

    #[tokio::test]
    async fn test_remote_store_failure_rolls_back_local_store() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        mocks.remote.set_fail_start(true);

        let err = h.orchestrator.start_plan("p", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StartFailed {
                stage: StartStage::RemoteStore,
                ..
            }
        ));
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
        assert_eq!(mocks.local.stop_calls(), 1);
        assert_eq!(mocks.adapter("p.a").start_calls(), 0);
        assert_eq!(h.run_states.get("p").await, None);
    }

    #[tokio::test]
    async fn test_local_store_failure_is_fatal() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        mocks.local.set_fail_start(true);

        let err = h.orchestrator.start_plan("p", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StartFailed {
                stage: StartStage::LocalStore,
                ..
            }
        ));
        assert_eq!(err.user_message(), StartStage::LocalStore.user_message());
        assert_eq!(plan.state(), PlanState::Stopped);
        assert_eq!(mocks.remote.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_partial_adapter_failure_is_tolerated() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a", "b", "c"]);
        mocks.adapter("p.b").set_fail_start(true);

        let outcome = h.orchestrator.start_plan("p", false).await.unwrap();
        let StartOutcome::Started(report) = outcome else {
            panic!("expected an immediate start");
        };
        assert_eq!(plan.state(), PlanState::Running);
        assert_eq!(mocks.running_adapters(), 2);
        assert_eq!(report.failed_adapters(), vec!["p.b"]);

        let status = plan.status();
        let b = status.components.iter().find(|c| c.name == "p.b").unwrap();
        assert!(b.session_disabled);
        assert!(!b.running);
    }

    #[tokio::test]
    async fn test_all_adapters_failing_is_fatal() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a", "b"]);
        for adapter in &mocks.adapters {
            adapter.set_fail_start(true);
        }

        let err = h.orchestrator.start_plan("p", false).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StartFailed {
                stage: StartStage::Components,
                ..
            }
        ));
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
        // failed adapters are usable again in the next session
        assert!(plan.adapters().iter().all(|slot| slot.is_active()));
    }

    #[tokio::test]
    async fn test_plan_without_enabled_adapters_cannot_start() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        mocks.adapter("p.a").set_enabled(false);

        let err = h.orchestrator.start_plan("p", false).await.unwrap_err();
        let Error::StartFailed { stage, message } = err else {
            panic!("expected a start failure");
        };
        assert_eq!(stage, StartStage::Components);
        assert_eq!(message, "no enabled components");
        assert_eq!(plan.state(), PlanState::Stopped);
        assert_eq!(mocks.adapter("p.a").start_calls(), 0);

        let (empty, _) = mock_plan("empty", &[], &h.log);
        h.orchestrator.add_plan(empty).unwrap();
        assert!(h.orchestrator.start_plan("empty", false).await.is_err());
    }

    #[tokio::test]
    async fn test_run_state_follows_lifecycle() {
        let h = harness();
        h.add_mock_plan("p", &["a"]);

        h.orchestrator.start_plan("p", false).await.unwrap();
        assert_eq!(h.run_states.get("p").await, Some(PlanRunState::Running));

        h.orchestrator.pause_plan("p").await.unwrap();
        assert_eq!(h.run_states.get("p").await, Some(PlanRunState::Paused));

        h.orchestrator.resume_plan("p").await.unwrap();
        assert_eq!(h.run_states.get("p").await, Some(PlanRunState::Running));

        h.orchestrator.stop_plan("p").await.unwrap();
        assert_eq!(h.run_states.get("p").await, None);
    }

    #[tokio::test]
    async fn test_unknown_plan_is_reported() {
        let h = harness();
        let err = h.orchestrator.start_plan("missing", false).await.unwrap_err();
        assert!(matches!(err, Error::PlanNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_duplicate_plan_is_rejected() {
        let h = harness();
        h.add_mock_plan("p", &["a"]);
        let (again, _) = mock_plan("p", &["a"], &h.log);
        assert!(matches!(
            h.orchestrator.add_plan(again),
            Err(Error::PlanExists(_))
        ));
    }
}

mod pause_resume_tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_keeps_stores_running() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a", "b"]);
        h.orchestrator.start_plan("p", false).await.unwrap();

        h.orchestrator.pause_plan("p").await.unwrap();
        assert_eq!(plan.state(), PlanState::Paused);
        assert_eq!(mocks.running_adapters(), 0);
        assert!(mocks.local.is_running());
        assert!(mocks.remote.is_running());

        h.orchestrator.resume_plan("p").await.unwrap();
        assert_eq!(plan.state(), PlanState::Running);
        assert_eq!(mocks.running_adapters(), 2);
        assert_eq!(mocks.local.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_on_paused_plan_resumes() {
        let h = harness();
        let (plan, _mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        h.orchestrator.pause_plan("p").await.unwrap();

        let outcome = h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Resumed(_)));
        assert_eq!(plan.state(), PlanState::Running);
    }

    #[tokio::test]
    async fn test_pause_requires_running_plan() {
        let h = harness();
        h.add_mock_plan("p", &["a"]);
        let err = h.orchestrator.pause_plan("p").await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_resume_with_no_adapter_tears_down() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        h.orchestrator.pause_plan("p").await.unwrap();

        mocks.adapter("p.a").set_fail_start(true);
        let err = h.orchestrator.resume_plan("p").await.unwrap_err();
        assert!(matches!(
            err,
            Error::StartFailed {
                stage: StartStage::Components,
                ..
            }
        ));
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
    }

    #[tokio::test]
    async fn test_scheduled_stop_survives_pause() {
        let h = harness();
        let (plan, mocks) = mock_plan("p", &["a"], &h.log);
        let plan =
            plan.with_schedule(PlanSchedule::default().with_stop_at(t0() + Duration::hours(2)));
        let plan = h.orchestrator.add_plan(plan).unwrap();

        h.orchestrator.start_plan("p", false).await.unwrap();
        assert_eq!(plan.scheduled_stop_at(), Some(t0() + Duration::hours(2)));

        h.orchestrator.pause_plan("p").await.unwrap();
        assert_eq!(plan.scheduled_stop_at(), Some(t0() + Duration::hours(2)));

        h.orchestrator.resume_plan("p").await.unwrap();
        let stops = h.handles_for(&ScheduledEvent::StopPlan("p".into()));
        assert_eq!(stops.len(), 1);

        h.clock.advance(Duration::hours(2));
        h.orchestrator.dispatch(h.firing(&stops[0])).await;
        assert_eq!(plan.state(), PlanState::Stopped);
        assert_eq!(mocks.running_adapters(), 0);
    }
}

mod schedule_tests {
    use super::*;
    use fieldkeep::scheduler::TaskScheduler;

    #[tokio::test]
    async fn test_future_start_is_scheduled() {
        let h = harness();
        let (plan, mocks) = mock_plan("p", &["a", "b"], &h.log);
        let start_at = t0() + Duration::hours(1);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(start_at)))
            .unwrap();

        let outcome = h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Scheduled { at } if at == start_at));
        assert_eq!(plan.state(), PlanState::ScheduledStart);
        assert_eq!(plan.scheduled_start_at(), Some(start_at));
        assert_eq!(mocks.local.start_calls(), 0);

        // asking again does not register a second start
        h.orchestrator.start_plan("p", false).await.unwrap();
        assert_eq!(h.handles_for(&ScheduledEvent::StartPlan("p".into())).len(), 1);
    }

    #[tokio::test]
    async fn test_early_and_stale_firings() {
        let h = harness();
        let (plan, mocks) = mock_plan("p", &["a", "b"], &h.log);
        let start_at = t0() + Duration::hours(1);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(start_at)))
            .unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        let event = ScheduledEvent::StartPlan("p".into());
        let first = h.firing(&h.owned_handle(&plan, &event));

        // fires half an hour early: re-registered for the remainder
        h.clock.advance(Duration::minutes(30));
        h.orchestrator.dispatch(first.clone()).await;
        assert_eq!(plan.state(), PlanState::ScheduledStart);
        assert!(!plan.owns_handle(&first.handle));
        assert_eq!(plan.scheduled_start_at(), Some(start_at));

        // the superseded handle is ignored
        h.clock.advance(Duration::minutes(30));
        h.orchestrator.dispatch(first).await;
        assert_eq!(plan.state(), PlanState::ScheduledStart);

        let current = h.owned_handle(&plan, &event);
        h.orchestrator.dispatch(h.firing(&current)).await;
        assert_eq!(plan.state(), PlanState::Running);
        assert_eq!(mocks.running_adapters(), 2);
    }

    #[tokio::test]
    async fn test_immediate_start_overrides_schedule() {
        let h = harness();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(t0() + Duration::hours(1))))
            .unwrap();

        h.orchestrator.start_plan("p", false).await.unwrap();
        let outcome = h.orchestrator.start_plan("p", true).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert_eq!(plan.state(), PlanState::Running);
        assert!(h.handles_for(&ScheduledEvent::StartPlan("p".into())).is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_scheduled_start() {
        let h = harness();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let schedule = PlanSchedule::starting_at(t0() + Duration::hours(1))
            .with_stop_at(t0() + Duration::hours(3));
        let plan = h.orchestrator.add_plan(plan.with_schedule(schedule)).unwrap();

        h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(plan.scheduled_stop_at().is_some());

        h.orchestrator.stop_plan("p").await.unwrap();
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(h.scheduler.entries().is_empty());
        assert!(h.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_scheduled_start() {
        let h = harness();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::starting_at(t0() + Duration::hours(1))))
            .unwrap();

        assert!(!plan.cancel_scheduled_start().await);
        h.orchestrator.start_plan("p", false).await.unwrap();
        assert!(plan.cancel_scheduled_start().await);
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(h.scheduler.entries().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_stop() {
        let h = harness();
        let (plan, mocks) = mock_plan("p", &["a"], &h.log);
        let stop_at = t0() + Duration::hours(2);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(PlanSchedule::default().with_stop_at(stop_at)))
            .unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        let event = ScheduledEvent::StopPlan("p".into());
        let early = h.firing(&h.owned_handle(&plan, &event));

        h.clock.advance(Duration::hours(1));
        h.orchestrator.dispatch(early).await;
        assert_eq!(plan.state(), PlanState::Running);
        assert_eq!(plan.scheduled_stop_at(), Some(stop_at));

        h.clock.advance(Duration::hours(1));
        let due = h.owned_handle(&plan, &event);
        h.orchestrator.dispatch(h.firing(&due)).await;
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.local.is_running());
        assert_eq!(h.run_states.get("p").await, None);
    }

    #[tokio::test]
    async fn test_cancel_scheduled_stop_keeps_plan_running() {
        let h = harness();
        let (plan, _mocks) = mock_plan("p", &["a"], &h.log);
        let plan = h
            .orchestrator
            .add_plan(plan.with_schedule(
                PlanSchedule::default().with_stop_at(t0() + Duration::hours(2)),
            ))
            .unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        assert!(plan.cancel_scheduled_stop().await);
        assert_eq!(plan.scheduled_stop_at(), None);
        assert_eq!(plan.state(), PlanState::Running);
        assert!(h.handles_for(&ScheduledEvent::StopPlan("p".into())).is_empty());
    }
}

mod delete_tests {
    use super::*;
    use fieldkeep::queue::{PendingTask, RunMode};

    #[tokio::test]
    async fn test_delete_removes_plan_storage_and_tasks() {
        let h = harness();
        let storage = h.dir.path().join("plan-storage");
        std::fs::create_dir_all(storage.join("nested")).unwrap();
        std::fs::write(storage.join("nested/records.jsonl"), "{}\n").unwrap();

        let (plan, mocks) = mock_plan("p", &["a"], &h.log);
        h.orchestrator.add_plan(plan.with_storage_dir(&storage)).unwrap();
        h.orchestrator.start_plan("p", false).await.unwrap();

        let queue = h.orchestrator.queue();
        queue
            .add(PendingTask::new("p/a", "p", "survey", t0()), RunMode::Multiple)
            .await
            .unwrap();
        queue
            .add(PendingTask::new("q/a", "q", "other", t0()), RunMode::Multiple)
            .await
            .unwrap();

        h.orchestrator.delete_plan("p").await.unwrap();

        assert!(!storage.exists());
        assert!(!mocks.local.is_running());
        assert!(!h.orchestrator.registry().contains("p"));
        assert_eq!(h.run_states.get("p").await, None);
        let remaining = queue.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].plan_id, "q");

        assert!(matches!(
            h.orchestrator.delete_plan("p").await,
            Err(Error::PlanNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waiting_on_delete_is_refused() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        mocks.adapter("p.a").set_stop_delay(std::time::Duration::from_millis(200));

        let orchestrator = Arc::clone(&h.orchestrator);
        let delete = tokio::spawn(async move { orchestrator.delete_plan("p").await });
        while h.log.with_action("stop").is_empty() {
            tokio::task::yield_now().await;
        }

        // lookups fail at once, a held controller fails once delete is done
        assert!(matches!(
            h.orchestrator.start_plan("p", true).await,
            Err(Error::PlanNotFound(_))
        ));
        assert!(matches!(plan.start(true).await, Err(Error::PlanNotFound(_))));
        delete.await.expect("Delete panicked").unwrap();

        assert!(plan.is_deleted());
        assert_eq!(plan.state(), PlanState::Stopped);
        assert!(!mocks.adapter("p.a").is_running());
        assert!(!mocks.local.is_running());
        assert!(!mocks.remote.is_running());
        assert_eq!(h.run_states.get("p").await, None);
    }

    #[tokio::test]
    async fn test_deleted_plan_accepts_no_transitions() {
        let h = harness();
        let (plan, mocks) = h.add_mock_plan("p", &["a"]);
        h.orchestrator.start_plan("p", false).await.unwrap();
        h.orchestrator.delete_plan("p").await.unwrap();

        assert!(matches!(plan.resume().await, Err(Error::PlanNotFound(_))));
        assert!(matches!(plan.pause().await, Err(Error::PlanNotFound(_))));
        assert!(plan.stop().await.steps.is_empty());
        plan.delete().await;

        assert_eq!(mocks.local.start_calls(), 1);
        assert_eq!(plan.state(), PlanState::Stopped);
    }
}
