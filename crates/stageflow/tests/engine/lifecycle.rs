//! Workflow and step lifecycle through the manager.

use serde_json::json;
use stageflow::{
    Error, EventData, MemoryStore, StepStatus, WorkflowState, WorkflowStatus,
};
use uuid::Uuid;

use crate::support::helpers::{
    complete_loan, init_test_tracing, loan_manager, loan_params, mutation_names,
    reach_processing, started_loan,
};
use crate::support::loan::{BASIC_INFO, DOCUMENTS, EMPLOYMENT, LOAN_PROCESS, SOFT_PULL};

fn step_id_of(state: &WorkflowState, selector: &str) -> anyhow::Result<stageflow::StepId> {
    state
        .step_by_selector(selector)
        .map(|step| step.id)
        .ok_or_else(|| anyhow::anyhow!("no step with selector {selector}"))
}

#[tokio::test]
async fn created_workflow_is_new_until_started() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());

    let (mut state, log) =
        manager.create_workflow(LOAN_PROCESS, "loan-application", Uuid::new_v4(), loan_params())?;

    assert_eq!(state.status(), WorkflowStatus::New);
    assert_eq!(state.progress(), 0.0);
    assert!(state.steps().is_empty());
    assert_eq!(state.stages().len(), 5);
    assert_eq!(
        mutation_names(log.mutations()),
        vec![
            "create-workflow",
            "add-stage",
            "add-stage",
            "add-stage",
            "add-stage",
            "add-stage"
        ]
    );

    let ((), start_log) = state.transaction(|wf| wf.start())?;

    assert_eq!(state.status(), WorkflowStatus::Active);
    assert!(state.workflow().ts_start.is_some());
    assert_eq!(state.steps().len(), 1);
    assert_eq!(state.steps()[0].selector, BASIC_INFO);
    assert_eq!(state.steps()[0].state, "PENDING");
    assert_eq!(start_log.narrations()[0].content, "loan application opened");
    Ok(())
}

#[tokio::test]
async fn participants_are_added_and_removed_by_role() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let officer = Uuid::new_v4();

    assert!(manager.add_participant(workflow_id, officer, "LoanOfficer").await?);
    assert!(!manager.add_participant(workflow_id, officer, "LoanOfficer").await?);
    assert!(manager.add_participant(workflow_id, officer, "Underwriter").await?);

    let removed = manager.remove_participant(workflow_id, officer, None).await?;
    assert_eq!(removed, 2);

    let state = manager.load_workflow(workflow_id).await?;
    assert!(
        state
            .participants()
            .iter()
            .all(|p| p.role != "LoanOfficer")
    );
    assert!(state.participants().is_empty());

    let err = manager
        .add_participant(workflow_id, officer, "UndeclaredRole")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RoleNotRegistered(role) if role == "UndeclaredRole"));
    Ok(())
}

#[tokio::test]
async fn custom_state_machine_follows_declared_transitions() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    reach_processing(&manager, workflow_id).await?;

    let state = manager.load_workflow(workflow_id).await?;
    let employment = step_id_of(&state, EMPLOYMENT)?;
    assert_eq!(state.step(employment).map(|s| s.state.as_str()), Some("BEGIN"));

    let err = manager
        .transit_step(workflow_id, employment, "DONE")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransitionNotAllowed { .. }));

    manager.transit_step(workflow_id, employment, "PENDING").await?;
    let outcome = manager.transit_step(workflow_id, employment, "DONE").await?;
    assert_eq!(outcome.from_state, "PENDING");
    assert_eq!(outcome.narration, vec!["employment verified".to_owned()]);
    assert!(!outcome.finished);

    let err = manager
        .transit_step(workflow_id, employment, "UNDECLARED")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { state, .. } if state == "UNDECLARED"));

    let outcome = manager.transit_step(workflow_id, employment, "FINISH").await?;
    assert!(outcome.finished);

    let state = manager.load_workflow(workflow_id).await?;
    let step = state.step(employment).expect("employment step");
    assert_eq!(step.status, StepStatus::Finished);
    assert!(step.ts_finish.is_some());
    Ok(())
}

#[tokio::test]
async fn transit_to_current_state_is_rejected() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let before = manager.fetch_mutations(workflow_id).await?.len();

    let state = manager.load_workflow(workflow_id).await?;
    let basic_info = step_id_of(&state, BASIC_INFO)?;
    let current = state.step(basic_info).expect("basic info step").state.clone();
    let err = manager
        .transit_step(workflow_id, basic_info, &current)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransitionNotAllowed { state: to, .. } if to == current));
    assert_eq!(manager.fetch_mutations(workflow_id).await?.len(), before);
    let after = manager.load_workflow(workflow_id).await?;
    assert_eq!(after.etag(), state.etag());
    Ok(())
}

#[tokio::test]
async fn unhandled_event_leaves_workflow_untouched() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;

    let before = manager.load_workflow(workflow_id).await?;
    let logged = manager.fetch_mutations(workflow_id).await?.len();

    let err = manager
        .inject_event(
            workflow_id,
            "soft-pull-completed",
            EventData::new(json!({ "credit_score": 700 })).for_selector(SOFT_PULL),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EventHandlerNotFound(name) if name == "soft-pull-completed"));

    let after = manager.load_workflow(workflow_id).await?;
    assert_eq!(after.snapshot(), before.snapshot());
    assert_eq!(manager.fetch_mutations(workflow_id).await?.len(), logged);

    // In memory, the failed transaction is rolled back as well.
    let mut state = after;
    let result = state.transaction(|wf| wf.dispatch("soft-pull-completed", EventData::default()));
    assert!(result.is_err());
    assert!(!state.in_transaction());
    assert_eq!(state.snapshot(), before.snapshot());
    Ok(())
}

#[tokio::test]
async fn event_name_is_checked_before_step_target() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let nowhere = || EventData::default().for_selector("no-such-step");

    let err = manager
        .inject_event(workflow_id, "appraisal-ordered", nowhere())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EventHandlerNotFound(name) if name == "appraisal-ordered"));

    let err = manager
        .inject_event(workflow_id, "document-received", nowhere())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepRoutingRequired(name) if name == "document-received"));
    Ok(())
}

#[tokio::test]
async fn second_transaction_on_same_workflow_fails_fast() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let other_id = started_loan(&manager).await?;

    let mut first = manager.load_workflow(workflow_id).await?;
    let mut second = manager.load_workflow(workflow_id).await?;
    let mut other = manager.load_workflow(other_id).await?;

    first.begin()?;
    let err = second.begin().unwrap_err();
    assert!(matches!(err, Error::TransactionAlreadyStarted(id) if id == workflow_id));

    // Other workflows are unaffected.
    other.begin()?;
    other.rollback();

    first.rollback();
    second.begin()?;
    second.rollback();
    Ok(())
}

#[tokio::test]
async fn mutators_require_an_open_transaction() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let mut state = manager.load_workflow(workflow_id).await?;

    let err = state
        .memorize([("credit_score", json!(640))], None)
        .unwrap_err();
    assert!(matches!(err, Error::MutationOutsideTransaction { action: "memorize" }));

    let err = state.commit().unwrap_err();
    assert!(matches!(err, Error::TransactionNotStarted(_)));
    Ok(())
}

#[tokio::test]
async fn step_event_without_target_requires_routing() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;

    let err = manager
        .inject_event(
            workflow_id,
            "borrower-info-submitted",
            EventData::new(json!({ "borrower_name": "Ada" })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepRoutingRequired(_)));
    Ok(())
}

#[tokio::test]
async fn loan_runs_to_completion() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;

    complete_loan(&manager, workflow_id).await?;

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.progress(), 1.0);
    assert!(state.workflow().ts_finish.is_some());
    assert_eq!(state.steps().len(), 3 + 1 + DOCUMENTS.len() + 1);
    assert!(
        state
            .steps()
            .iter()
            .all(|step| step.status == StepStatus::Finished)
    );

    assert_eq!(state.memory()["pre_qualified"], json!(true));
    assert_eq!(state.memory()["credit_score"], json!(712));
    assert_eq!(state.memory()["funded_amount"], json!(350_000));
    assert_eq!(state.output()["pre_approval_letter"], json!("pre-approval.pdf"));
    assert_eq!(state.output()["closing_disclosure"], json!("closing.pdf"));

    let basic_info = step_id_of(&state, BASIC_INFO)?;
    let soft_pull = state.step_by_selector(SOFT_PULL).expect("soft pull step");
    assert_eq!(soft_pull.src_step, Some(basic_info));
    assert_eq!(
        state.step_memory(basic_info).and_then(|m| m.get("borrower_name")),
        Some(&json!("Ada"))
    );

    let narrations = manager.fetch_narrations(workflow_id).await?;
    assert!(narrations.iter().any(|n| {
        n.source == "CollectBasicInformation:COMPLETED" && n.content == "Ada pre-qualified"
    }));
    assert_eq!(
        narrations.last().map(|n| n.content.as_str()),
        Some("loan closed")
    );

    let log = manager.fetch_mutations(workflow_id).await?;
    let names = mutation_names(&log);
    assert_eq!(names.first(), Some(&"create-workflow"));
    assert_eq!(names.iter().filter(|n| **n == "add-trigger").count(), 6);
    assert_eq!(names.last(), Some(&"update-workflow"));
    Ok(())
}

#[tokio::test]
async fn envelopes_are_numbered_within_their_transaction() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    complete_loan(&manager, workflow_id).await?;

    let log = manager.fetch_mutations(workflow_id).await?;
    let mut expected = 1;
    let mut transaction_id = None;
    for envelope in &log {
        if transaction_id != Some(envelope.transaction_id) {
            transaction_id = Some(envelope.transaction_id);
            expected = 1;
        }
        assert_eq!(envelope.order, expected, "{}", envelope.name);
        assert_eq!(envelope.workflow_id, workflow_id);
        expected += 1;
    }
    Ok(())
}

#[tokio::test]
async fn ignoring_the_last_active_step_completes_the_workflow() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let state = manager.load_workflow(workflow_id).await?;
    let basic_info = step_id_of(&state, BASIC_INFO)?;

    manager
        .ignore_step(workflow_id, basic_info, "collected offline")
        .await?;

    let state = manager.load_workflow(workflow_id).await?;
    let step = state.step(basic_info).expect("basic info step");
    assert_eq!(step.status, StepStatus::Ignored);
    assert_eq!(step.message.as_deref(), Some("collected offline"));
    assert_eq!(state.status(), WorkflowStatus::Completed);

    let err = manager
        .cancel_step(workflow_id, basic_info, "too late")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowStatusNotAllowed { .. } | Error::StepNotActive { .. }));
    Ok(())
}

#[tokio::test]
async fn failed_workflow_is_stored_as_error() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;

    manager
        .fail_workflow(workflow_id, "credit bureau unreachable")
        .await?;

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.status(), WorkflowStatus::Error);
    assert_eq!(
        state.workflow().message.as_deref(),
        Some("credit bureau unreachable")
    );
    assert!(state.workflow().ts_finish.is_some());
    let log = manager.fetch_mutations(workflow_id).await?;
    assert_eq!(mutation_names(&log).last(), Some(&"update-workflow"));

    let err = manager
        .fail_workflow(workflow_id, "again")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::WorkflowStatusNotAllowed {
            status: WorkflowStatus::Error,
            ..
        }
    ));
    let err = manager
        .add_participant(workflow_id, Uuid::new_v4(), "Borrower")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowStatusNotAllowed { .. }));
    Ok(())
}

#[tokio::test]
async fn cancelled_workflow_rejects_further_changes() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;

    manager
        .cancel_workflow(workflow_id, "borrower withdrew")
        .await?;

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.status(), WorkflowStatus::Cancelled);
    assert_eq!(state.workflow().message.as_deref(), Some("borrower withdrew"));

    let narrations = manager.fetch_narrations(workflow_id).await?;
    assert!(
        narrations
            .iter()
            .any(|n| n.content == "loan application withdrawn")
    );

    let err = manager.abort_workflow(workflow_id, "again").await.unwrap_err();
    assert!(matches!(
        err,
        Error::WorkflowStatusNotAllowed {
            status: WorkflowStatus::Cancelled,
            ..
        }
    ));

    let err = manager
        .inject_event(workflow_id, "pre-approval-issued", EventData::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowStatusNotAllowed { .. }));
    Ok(())
}
