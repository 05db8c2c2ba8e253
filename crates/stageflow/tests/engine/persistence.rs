//! Mutation batches, etags and queries against the in-memory store.

use serde_json::json;
use stageflow::{
    Entity, Error, ManagerConfig, MemoryRecord, MemoryStore, Mutation, Stage, StepDefinition,
    Transition, TransactionId, UpdateStep, WorkflowDefinition, WorkflowManager,
};
use uuid::Uuid;

use crate::support::helpers::{
    envelope, init_test_tracing, loan_manager, loan_params, started_loan,
};
use crate::support::loan::{BASIC_INFO, LOAN_PROCESS, loan_definition};

#[tokio::test]
async fn failed_write_rolls_back_the_whole_batch() -> anyhow::Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = loan_manager(store.clone());
    let workflow_id = started_loan(&manager).await?;

    let logged = manager.fetch_mutations(workflow_id).await?;
    let add_step = logged
        .iter()
        .find(|e| e.name == "add-step")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("start logged no add-step"))?;
    let steps_before = store.count(Entity::Step).await;

    let mut memory = manager.load_workflow(workflow_id).await?.memory().clone();
    memory.insert("batch_marker".into(), json!(true));
    let tx = TransactionId::new();
    let batch = vec![
        envelope(
            workflow_id,
            tx,
            1,
            Mutation::SetMemory(MemoryRecord {
                workflow_id,
                step_id: None,
                memory,
            }),
        ),
        envelope(workflow_id, tx, 2, add_step.mutation),
    ];

    let err = manager.persist_mutations(&batch).await.unwrap_err();
    let summary = match err {
        Error::BatchRejected(summary) => summary,
        other => anyhow::bail!("expected BatchRejected, got {other}"),
    };
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].name, "add-step");
    assert_eq!(summary.failures[0].order, 2);
    assert!(summary.to_string().starts_with("1 mutation(s) applied; `add-step` #2"));

    let state = manager.load_workflow(workflow_id).await?;
    assert!(!state.memory().contains_key("batch_marker"));
    assert_eq!(store.count(Entity::Step).await, steps_before);
    assert_eq!(manager.fetch_mutations(workflow_id).await?.len(), logged.len());
    Ok(())
}

#[tokio::test]
async fn later_step_update_in_a_batch_wins() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());
    let workflow_id = started_loan(&manager).await?;
    let step_id = manager
        .load_workflow(workflow_id)
        .await?
        .step_by_selector(BASIC_INFO)
        .map(|s| s.id)
        .ok_or_else(|| anyhow::anyhow!("basic info step missing"))?;

    let tx = TransactionId::new();
    let update = |title: &str, message: Option<&str>| {
        Mutation::UpdateStep(UpdateStep {
            title: Some(title.to_owned()),
            message: message.map(str::to_owned),
            ..UpdateStep::new(step_id)
        })
    };
    let batch = vec![
        envelope(workflow_id, tx, 1, update("First title", Some("kept"))),
        envelope(workflow_id, tx, 2, update("Second title", None)),
    ];

    let summary = manager.persist_mutations(&batch).await?;
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.transaction_id, Some(tx));
    assert!(summary.etag.is_some());

    let state = manager.load_workflow(workflow_id).await?;
    let step = state.step(step_id).expect("step");
    assert_eq!(step.title, "Second title");
    // Fields absent from the later update keep the earlier value.
    assert_eq!(step.message.as_deref(), Some("kept"));
    assert_eq!(state.etag(), summary.etag.as_deref());
    Ok(())
}

#[tokio::test]
async fn repeated_memorize_stores_the_same_memory() -> anyhow::Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = loan_manager(store.clone());
    let workflow_id = started_loan(&manager).await?;

    let remember = |wf: &mut stageflow::WorkflowState| {
        wf.memorize([("appraisal", json!(410_000)), ("lender", json!("north"))], None)
    };
    manager.execute(workflow_id, "memorize", remember).await?;
    let first = manager.load_workflow(workflow_id).await?.memory().clone();
    let records = store.count(Entity::Memory).await;

    manager.execute(workflow_id, "memorize", remember).await?;
    let second = manager.load_workflow(workflow_id).await?.memory().clone();

    assert_eq!(first, second);
    assert_eq!(first["appraisal"], json!(410_000));
    assert_eq!(store.count(Entity::Memory).await, records);
    Ok(())
}

#[tokio::test]
async fn stale_etag_is_a_concurrency_conflict() -> anyhow::Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = loan_manager(store.clone());
    let workflow_id = started_loan(&manager).await?;

    let mut first = manager.load_workflow(workflow_id).await?;
    let mut stale = manager.load_workflow(workflow_id).await?;

    let ((), log) = first.transaction(|wf| wf.memorize([("writer", "first")], None))?;
    manager.commit(&mut first, log).await?;
    assert_ne!(first.etag(), stale.etag());

    let ((), log) = stale.transaction(|wf| wf.memorize([("writer", "stale")], None))?;
    let err = manager.commit(&mut stale, log.clone()).await.unwrap_err();
    assert!(matches!(err, Error::ConcurrencyConflict { workflow_id: id } if id == workflow_id));

    let state = manager.load_workflow(workflow_id).await?;
    assert_eq!(state.memory()["writer"], json!("first"));

    // The check can be turned off; the last writer then wins.
    let unchecked = WorkflowManager::builder(store)
        .register(loan_definition())
        .config(ManagerConfig {
            check_etag: false,
            ..ManagerConfig::default()
        })
        .build()?;
    unchecked.commit(&mut stale, log).await?;
    let state = unchecked.load_workflow(workflow_id).await?;
    assert_eq!(state.memory()["writer"], json!("stale"));
    Ok(())
}

#[tokio::test]
async fn unknown_encoded_mutation_writes_nothing() -> anyhow::Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = loan_manager(store.clone());
    let workflow_id = started_loan(&manager).await?;

    let logged = manager.fetch_mutations(workflow_id).await?;
    let mut valid = serde_json::to_value(&logged[0])?;
    valid["transaction_id"] = json!(Uuid::new_v4());
    let mut unknown = valid.clone();
    unknown["name"] = json!("explode-workflow");

    let err = manager
        .persist_encoded(vec![valid, unknown])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnrecognizedMutation(name) if name == "explode-workflow"));
    assert_eq!(manager.fetch_mutations(workflow_id).await?.len(), logged.len());
    Ok(())
}

#[tokio::test]
async fn mutation_log_can_be_disabled() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = WorkflowManager::builder(MemoryStore::new())
        .register(loan_definition())
        .config(ManagerConfig {
            record_mutation_log: false,
            record_narrations: false,
            ..ManagerConfig::default()
        })
        .build()?;
    let workflow_id = started_loan(&manager).await?;

    assert!(manager.fetch_mutations(workflow_id).await?.is_empty());
    assert!(manager.fetch_narrations(workflow_id).await?.is_empty());
    assert_eq!(
        manager.load_workflow(workflow_id).await?.steps().len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn workflows_are_listed_by_definition_and_paged() -> anyhow::Result<()> {
    init_test_tracing();
    let intake = WorkflowDefinition::builder("intake")
        .stage(Stage::new("INTAKE", "Intake", 1))
        .step(StepDefinition::builder("Triage", "INTAKE").transition("_FINISHED", |_| {
            Transition::new()
        }))
        .build()?;
    let manager = WorkflowManager::builder(MemoryStore::new())
        .register(loan_definition())
        .register(intake)
        .build()?;

    for _ in 0..3 {
        manager
            .launch_workflow(LOAN_PROCESS, "loan-application", Uuid::new_v4(), loan_params())
            .await?;
    }
    manager
        .launch_workflow("intake", "ticket", Uuid::new_v4(), Default::default())
        .await?;

    assert_eq!(manager.list_workflows(None, 10, 0).await?.len(), 4);
    let first_page = manager.list_workflows(Some(LOAN_PROCESS), 2, 0).await?;
    let second_page = manager.list_workflows(Some(LOAN_PROCESS), 2, 2).await?;
    assert_eq!(first_page.len(), 2);
    assert_eq!(second_page.len(), 1);
    assert!(
        first_page
            .iter()
            .chain(&second_page)
            .all(|w| w.definition_key == LOAN_PROCESS)
    );
    assert!(manager.list_workflows(Some("missing"), 10, 0).await?.is_empty());

    let catalog = manager.definitions();
    let keys: Vec<&str> = catalog.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["intake", LOAN_PROCESS]);
    let loan = &catalog[1];
    assert_eq!(loan.revision, 2);
    assert_eq!(loan.stages.len(), 5);
    assert_eq!(loan.roles.len(), 5);
    assert!(loan.events.iter().any(|e| e.name == "document-received"));
    Ok(())
}

#[tokio::test]
async fn unknown_workflow_and_definition_are_reported() -> anyhow::Result<()> {
    init_test_tracing();
    let manager = loan_manager(MemoryStore::new());

    let missing = stageflow::WorkflowId::new();
    let err = manager.start_workflow(missing).await.unwrap_err();
    assert!(matches!(err, Error::UnknownWorkflow(id) if id == missing));

    let err = manager
        .launch_workflow("mortgage-refinance", "loan", Uuid::new_v4(), loan_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDefinition(key) if key == "mortgage-refinance"));
    Ok(())
}
