//! WorkflowManager end to end on PostgreSQL.

use serde_json::json;
use stageflow::{Error, EventData, PgStore, WorkflowStatus};
use test_utils::db_test;

use crate::support::helpers::{
    complete_loan, init_test_tracing, loan_manager, mutation_names, started_loan,
};
use crate::support::loan::{LOAN_PROCESS, SOFT_PULL};

db_test!(loan_completes_on_postgres, |pool| {
    init_test_tracing();
    let manager = loan_manager(PgStore::new(pool.clone()));
    let workflow_id = started_loan(&manager).await?;

    complete_loan(&manager, workflow_id).await?;

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.progress(), 1.0);
    assert_eq!(state.output()["closing_disclosure"], json!("closing.pdf"));
    assert_eq!(state.memory()["credit_score"], json!(712));

    let log = manager.fetch_mutations(workflow_id).await?;
    let names = mutation_names(&log);
    assert_eq!(names.first(), Some(&"create-workflow"));
    assert_eq!(names.iter().filter(|n| **n == "add-trigger").count(), 6);

    let narrations = manager.fetch_narrations(workflow_id).await?;
    assert_eq!(
        narrations.first().map(|n| n.content.as_str()),
        Some("loan application opened")
    );
    assert_eq!(
        narrations.last().map(|n| n.content.as_str()),
        Some("loan closed")
    );
    Ok(())
});

db_test!(rejected_event_leaves_rows_untouched, |pool| {
    init_test_tracing();
    let manager = loan_manager(PgStore::new(pool.clone()));
    let workflow_id = started_loan(&manager).await?;
    let before = manager.load_workflow(workflow_id).await?;
    let logged = manager.fetch_mutations(workflow_id).await?.len();

    let err = manager
        .inject_event(
            workflow_id,
            "soft-pull-completed",
            EventData::new(json!({})).for_selector(SOFT_PULL),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EventHandlerNotFound(_)));

    let after = manager.load_workflow(workflow_id).await?;
    assert_eq!(after.etag(), before.etag());
    assert_eq!(after.steps(), before.steps());
    assert_eq!(manager.fetch_mutations(workflow_id).await?.len(), logged);
    Ok(())
});

db_test!(stale_state_is_rejected_on_postgres, |pool| {
    init_test_tracing();
    let manager = loan_manager(PgStore::new(pool.clone()));
    let workflow_id = started_loan(&manager).await?;

    let mut first = manager.load_workflow(workflow_id).await?;
    let mut stale = manager.load_workflow(workflow_id).await?;

    let ((), log) = first.transaction(|wf| wf.memorize([("writer", "first")], None))?;
    manager.commit(&mut first, log).await?;

    let ((), log) = stale.transaction(|wf| wf.memorize([("writer", "stale")], None))?;
    let err = manager.commit(&mut stale, log).await.unwrap_err();
    assert!(matches!(err, Error::ConcurrencyConflict { .. }));

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.memory()["writer"], json!("first"));
    Ok(())
});

db_test!(workflows_are_listed_newest_first, |pool| {
    init_test_tracing();
    let manager = loan_manager(PgStore::new(pool.clone()));

    for _ in 0..3 {
        started_loan(&manager).await?;
    }

    let all = manager.list_workflows(Some(LOAN_PROCESS), 10, 0).await?;
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|w| w.status == WorkflowStatus::Active));

    let page = manager.list_workflows(Some(LOAN_PROCESS), 2, 2).await?;
    assert_eq!(page.len(), 1);
    assert!(manager.list_workflows(Some("missing"), 10, 0).await?.is_empty());
    Ok(())
});
