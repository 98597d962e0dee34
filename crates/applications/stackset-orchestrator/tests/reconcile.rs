//! End-to-end reconciliation runs against a scripted service

mod common;

use common::{
    default_config, desired, harness, id, params, Behavior, Call, FakeService, STACK_SET,
    THREE_ACCOUNTS,
};
use stackset_orchestrator::service::InstanceStatus;
use stackset_orchestrator::{
    ActionKind, CancelFlag, Clock, DeployOptions, ManualClock, MemoryReporter, PlanMode,
    ProgressEvent, ProgressReporter, ReconcileError, Reconciler, TargetOutcome,
};
use std::sync::Arc;
use std::time::Duration;

const TEMPLATE: &str = "Resources:\n  Topic:\n    Type: AWS::SNS::Topic\n";

fn existing_stack_set() -> FakeService {
    FakeService::with_stack_set(TEMPLATE, params(&[]))
}

#[tokio::test]
async fn test_plans_only_non_conformant_targets() {
    let service = existing_stack_set();
    service.add_instance(
        id("222222222222", "us-east-1"),
        params(&[("AccountName", "Test")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(THREE_ACCOUNTS);

    let plan = h
        .reconciler
        .prepare(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(plan.len(), 2);
    assert_eq!(plan.actions[0].target, id("111111111111", "us-east-1"));
    assert_eq!(plan.actions[1].target, id("333333333333", "us-east-1"));
    assert_eq!(plan.count(ActionKind::Create), 2);
    assert_eq!(plan.skipped, vec![id("222222222222", "us-east-1")]);
}

#[tokio::test]
async fn test_run_creates_in_order_and_emits_events() {
    let service = existing_stack_set();
    service.add_instance(
        id("222222222222", "us-east-1"),
        params(&[("AccountName", "Test")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(THREE_ACCOUNTS);

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        h.service.initiations(),
        vec![
            Call::CreateInstances(id("111111111111", "us-east-1")),
            Call::CreateInstances(id("333333333333", "us-east-1")),
        ]
    );
    assert_eq!(
        h.service.overrides_of(&id("333333333333", "us-east-1")),
        Some(params(&[("AccountName", "Prod")]))
    );

    let events = h.reporter.events();
    assert!(matches!(
        &events[0],
        ProgressEvent::TargetStarted { account, action: ActionKind::Create, .. } if account == "111111111111"
    ));
    assert!(matches!(&events[1], ProgressEvent::TargetSucceeded { account, .. } if account == "111111111111"));
    assert!(matches!(&events[2], ProgressEvent::TargetStarted { account, .. } if account == "333333333333"));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunCompleted {
            succeeded: 2,
            failed: 0,
            skipped: 1,
            timed_out: 0,
            cancelled: 0
        })
    ));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = harness(existing_stack_set(), default_config());
    let config = desired(THREE_ACCOUNTS);
    let options = DeployOptions::new(PlanMode::Update);

    let first = h.reconciler.reconcile(&config, &options).await.unwrap();
    assert_eq!(first.succeeded, 3);

    let plan = h.reconciler.prepare(&config, &options).await.unwrap();
    assert!(plan.is_empty());
    assert_eq!(plan.skipped.len(), 3);
}

#[tokio::test]
async fn test_conflicts_are_waited_out_and_counted() {
    let h = harness(existing_stack_set(), default_config());
    h.service.busy_for_listings(2);
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    let report = summary.report_for(&id("111111111111", "us-east-1")).unwrap();
    assert_eq!(report.attempts, 3);
    assert!(matches!(report.outcome, TargetOutcome::Succeeded { .. }));
    assert_eq!(
        h.reporter
            .events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ConflictRetry { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_failure_is_isolated_and_resumed() {
    let service = existing_stack_set();
    service.set_behavior(
        id("222222222222", "us-east-1"),
        Behavior::Fail {
            reason: "ResourceLogicalId:Topic, ResourceStatusReason:Access Denied".to_string(),
        },
    );
    let h = harness(service, default_config());
    let config = desired(THREE_ACCOUNTS);

    let first = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);
    assert!(!first.is_success());
    match &first.report_for(&id("222222222222", "us-east-1")).unwrap().outcome {
        TargetOutcome::Failed { reason } => assert!(reason.contains("Access Denied")),
        other => panic!("expected failure, got {:?}", other),
    }
    // The failure did not stop the run
    assert!(h.service.initiations().contains(&Call::CreateInstances(id("333333333333", "us-east-1"))));

    // Fix the cause and run again: only the failed target is retried
    h.service
        .set_behavior(id("222222222222", "us-east-1"), Behavior::default());
    let second = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert!(second.is_success());
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.skipped, 2);
    assert_eq!(
        second.report_for(&id("222222222222", "us-east-1")).unwrap().action,
        Some(ActionKind::Update)
    );
}

#[tokio::test]
async fn test_stopped_operation_fails_target_and_run_continues() {
    let service = existing_stack_set();
    service.set_behavior(
        id("222222222222", "us-east-1"),
        Behavior::Stop {
            reason: "User requested stop".to_string(),
        },
    );
    let h = harness(service, default_config());

    let summary = h
        .reconciler
        .reconcile(&desired(THREE_ACCOUNTS), &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.timed_out, 0);
    match &summary.report_for(&id("222222222222", "us-east-1")).unwrap().outcome {
        TargetOutcome::Failed { reason } => {
            assert!(reason.contains("stopped"));
            assert!(reason.contains("User requested stop"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h
        .service
        .initiations()
        .contains(&Call::CreateInstances(id("333333333333", "us-east-1"))));
}

#[tokio::test]
async fn test_poll_timeout_is_reported_separately() {
    let service = existing_stack_set();
    service.set_behavior(id("111111111111", "us-east-1"), Behavior::Hang);
    let h = harness(service, default_config());
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.failed, 0);
    assert!(!summary.is_success());
    assert_eq!(
        summary.reports[0].outcome,
        TargetOutcome::TimedOut {
            operation_id: h.service.proposed_ids()[0].clone()
        }
    );
    assert_eq!(h.clock.total_slept(), Duration::from_secs(120));
    assert!(h
        .reporter
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::TargetTimedOut { .. })));
}

#[tokio::test]
async fn test_fatal_rejection_fails_target_without_retry() {
    let h = harness(existing_stack_set(), default_config());
    h.service.push_initiate_errors([stackset_orchestrator::ServiceError::from_code(
        "InsufficientCapabilitiesException",
        "Requires capabilities : [CAPABILITY_NAMED_IAM]",
    )]);
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reports[0].attempts, 1);
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_missing_stack_set_is_created_from_template() {
    let h = harness(FakeService::new(), default_config());
    let config = desired(THREE_ACCOUNTS);

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default().with_template(TEMPLATE))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(h.service.calls()[0], Call::CreateStackSet);
    assert_eq!(h.service.instance_ids().len(), 3);
}

#[tokio::test]
async fn test_missing_stack_set_without_template_aborts() {
    let h = harness(FakeService::new(), default_config());
    let config = desired(THREE_ACCOUNTS);

    let err = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::StackSetNotFound(name) if name == STACK_SET));
    assert!(h.service.initiations().is_empty());
}

#[tokio::test]
async fn test_created_stack_set_accepts_declared_overrides() {
    let service = FakeService::new();
    service.declare_template(TEMPLATE, &["Env", "AccountName"]);
    let h = harness(service, default_config());
    let config = desired(
        r#"{"commonParameters": [{"ParameterKey": "Env", "ParameterValue": "prod"}],
            "accounts": [{"accountId": "111111111111", "regions": ["us-east-1"],
            "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default().with_template(TEMPLATE))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(
        h.service.initiations(),
        vec![
            Call::CreateStackSet,
            Call::CreateInstances(id("111111111111", "us-east-1"))
        ]
    );
    assert_eq!(
        h.service.overrides_of(&id("111111111111", "us-east-1")),
        Some(params(&[("Env", "prod"), ("AccountName", "Dev")]))
    );
}

#[tokio::test]
async fn test_new_template_parameter_is_accepted_on_update() {
    let service = existing_stack_set();
    service.declare_template(TEMPLATE, &["AccountName"]);
    let new_template = "Parameters:\n  AccountName: {Type: String}\n  Env: {Type: String}\n";
    service.declare_template(new_template, &["AccountName", "Env"]);
    service.add_instance(
        id("111111111111", "us-east-1"),
        params(&[("AccountName", "Dev")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(
        r#"{"commonParameters": [{"ParameterKey": "Env", "ParameterValue": "prod"}],
            "accounts": [{"accountId": "111111111111", "regions": ["us-east-1"],
            "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(
            &config,
            &DeployOptions::new(PlanMode::Update).with_template(new_template),
        )
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(
        h.service.initiations(),
        vec![
            Call::UpdateStackSet(id("111111111111", "us-east-1")),
            Call::UpdateInstances(id("111111111111", "us-east-1")),
        ]
    );
    assert_eq!(h.service.template_body().as_deref(), Some(new_template));
}

#[tokio::test]
async fn test_preview_does_not_create_stack_set() {
    let h = harness(FakeService::new(), default_config());
    let config = desired(THREE_ACCOUNTS);

    let plan = h
        .reconciler
        .preview(&config, &DeployOptions::default().with_template(TEMPLATE))
        .await
        .unwrap();

    assert_eq!(plan.count(ActionKind::Create), 3);
    assert!(h.service.calls().is_empty());
}

#[tokio::test]
async fn test_template_change_rolls_out_per_target() {
    let service = existing_stack_set();
    service.add_instance(
        id("111111111111", "us-east-1"),
        params(&[("AccountName", "Dev")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"],
            "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]}]}"#,
    );
    let new_template = "Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n";

    let summary = h
        .reconciler
        .reconcile(
            &config,
            &DeployOptions::new(PlanMode::Update).with_template(new_template),
        )
        .await
        .unwrap();

    assert!(summary.is_success());
    // Parameters already match, so no instance update follows
    assert_eq!(
        h.service.initiations(),
        vec![Call::UpdateStackSet(id("111111111111", "us-east-1"))]
    );
    assert_eq!(h.service.template_body().as_deref(), Some(new_template));
}

#[tokio::test]
async fn test_template_and_parameter_change_runs_two_operations() {
    let service = existing_stack_set();
    service.add_instance(
        id("111111111111", "us-east-1"),
        params(&[("AccountName", "Old")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"],
            "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(
            &config,
            &DeployOptions::new(PlanMode::Update).with_template("Resources: {}"),
        )
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.reports[0].attempts, 2);
    assert_eq!(
        h.service.initiations(),
        vec![
            Call::UpdateStackSet(id("111111111111", "us-east-1")),
            Call::UpdateInstances(id("111111111111", "us-east-1")),
        ]
    );
    assert_eq!(
        h.service.overrides_of(&id("111111111111", "us-east-1")),
        Some(params(&[("AccountName", "Dev")]))
    );
}

#[tokio::test]
async fn test_parameters_only_refresh() {
    let service = existing_stack_set();
    service.add_instance(
        id("111111111111", "us-east-1"),
        params(&[("AccountName", "Old")]),
        InstanceStatus::Current,
    );
    service.add_instance(
        id("222222222222", "us-east-1"),
        params(&[("AccountName", "Test")]),
        InstanceStatus::Current,
    );
    let h = harness(service, default_config());
    let config = desired(THREE_ACCOUNTS);

    let summary = h
        .reconciler
        .reconcile(
            &config,
            &DeployOptions::new(PlanMode::ParametersOnly).with_template("ignored"),
        )
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(
        h.service.initiations(),
        vec![
            Call::UpdateInstances(id("111111111111", "us-east-1")),
            Call::CreateInstances(id("333333333333", "us-east-1")),
        ]
    );
    assert_eq!(h.service.template_body().as_deref(), Some(TEMPLATE));
}

#[tokio::test]
async fn test_undeclared_parameter_fails_before_initiating() {
    let service = FakeService::with_stack_set(TEMPLATE, params(&[("Env", "prod")]));
    service.declare_template(TEMPLATE, &["Env"]);
    let h = harness(service, default_config());
    let config = desired(
        r#"{"accounts": [{"accountId": "111111111111", "regions": ["us-east-1"],
            "parameters": [{"ParameterKey": "Bogus", "ParameterValue": "1"}]}]}"#,
    );

    let summary = h
        .reconciler
        .reconcile(&config, &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    match &summary.reports[0].outcome {
        TargetOutcome::Failed { reason } => assert!(reason.contains("Bogus")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h.service.initiations().is_empty());
}

#[tokio::test]
async fn test_account_filter() {
    let h = harness(existing_stack_set(), default_config());
    let config = desired(THREE_ACCOUNTS);

    let summary = h
        .reconciler
        .reconcile(
            &config,
            &DeployOptions::default().with_account_filter("222222222222"),
        )
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.service.instance_ids(), vec![id("222222222222", "us-east-1")]);

    let err = h
        .reconciler
        .prepare(
            &config,
            &DeployOptions::default().with_account_filter("999999999999"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Config(_)));
}

/// Cancels the run as soon as the first target succeeds
struct CancelAfterFirst {
    cancel: CancelFlag,
    inner: MemoryReporter,
}

impl ProgressReporter for CancelAfterFirst {
    fn report(&self, event: &ProgressEvent) {
        if matches!(event, ProgressEvent::TargetSucceeded { .. }) {
            self.cancel.cancel();
        }
        self.inner.report(event);
    }
}

#[tokio::test]
async fn test_cancellation_stops_between_targets() {
    let service = Arc::new(existing_stack_set());
    let cancel = CancelFlag::new();
    let reporter = Arc::new(CancelAfterFirst {
        cancel: cancel.clone(),
        inner: MemoryReporter::new(),
    });
    let reconciler = Reconciler::new(
        service.clone(),
        Arc::new(ManualClock::at_epoch()) as Arc<dyn Clock>,
        reporter.clone(),
        default_config(),
    )
    .with_cancel_flag(cancel);

    let summary = reconciler
        .reconcile(&desired(THREE_ACCOUNTS), &DeployOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.cancelled, 2);
    assert!(!summary.is_success());
    assert_eq!(service.initiations().len(), 1);
    assert!(matches!(
        reporter.inner.events().last(),
        Some(ProgressEvent::RunCompleted { cancelled: 2, .. })
    ));
}

#[tokio::test]
async fn test_status_splits_deployed_and_remaining() {
    let service = existing_stack_set();
    service.add_instance(
        id("111111111111", "us-east-1"),
        params(&[("AccountName", "Dev")]),
        InstanceStatus::Current,
    );
    service.add_instance(
        id("444444444444", "us-east-1"),
        params(&[]),
        InstanceStatus::Current,
    );
    service.mark_failed(&id("111111111111", "us-east-1"));
    let h = harness(service, default_config());

    let status = h.reconciler.status(&desired(THREE_ACCOUNTS)).await.unwrap();

    assert_eq!(status.deployed.len(), 1);
    assert_eq!(
        status.deployed[0].status,
        stackset_orchestrator::ObservedStatus::Failing
    );
    assert_eq!(
        status.remaining,
        vec![id("222222222222", "us-east-1"), id("333333333333", "us-east-1")]
    );
    assert_eq!(status.unmanaged, vec![id("444444444444", "us-east-1")]);
    assert!(status.active_operation.is_none());
}

#[tokio::test]
async fn test_remove_deletes_each_region() {
    let service = existing_stack_set();
    service.add_instance(id("111111111111", "us-east-1"), params(&[]), InstanceStatus::Current);
    service.add_instance(id("111111111111", "eu-west-1"), params(&[]), InstanceStatus::Current);
    service.add_instance(id("222222222222", "us-east-1"), params(&[]), InstanceStatus::Current);
    let h = harness(service, default_config());

    let targets = h
        .reconciler
        .existing_targets("111111111111", None)
        .await
        .unwrap();
    assert_eq!(targets.len(), 2);

    let summary = h.reconciler.remove(&targets, true).await;

    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 2);
    assert_eq!(h.service.instance_ids(), vec![id("222222222222", "us-east-1")]);
    assert!(summary
        .reports
        .iter()
        .all(|r| r.action == Some(ActionKind::Delete)));
}
