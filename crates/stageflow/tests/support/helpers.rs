use serde_json::json;
use stageflow::{
    EventData, JsonMap, Mutation, MutationEnvelope, Store, TransactionId, WorkflowId,
    WorkflowManager,
};

use super::loan::{BASIC_INFO, DOCUMENTS, EMPLOYMENT, LOAN_PROCESS, SOFT_PULL, loan_definition};

/// Initialize tracing for tests. Safe to call multiple times.
///
/// The `try_init()` call is idempotent - subsequent calls are no-ops if
/// already initialized.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stageflow=debug")
        .with_test_writer()
        .try_init();
}

pub fn loan_manager<S: Store>(store: S) -> WorkflowManager<S> {
    WorkflowManager::builder(store)
        .register(loan_definition())
        .build()
        .expect("manager builds")
}

pub fn loan_params() -> JsonMap {
    let params = json!({ "amount": 350_000, "term_months": 360 });
    params.as_object().cloned().unwrap_or_default()
}

/// Mutation names in log order.
pub fn mutation_names(envelopes: &[MutationEnvelope]) -> Vec<&str> {
    envelopes.iter().map(|e| e.name.as_str()).collect()
}

/// Create, persist and start a loan workflow.
pub async fn started_loan<S: Store>(manager: &WorkflowManager<S>) -> anyhow::Result<WorkflowId> {
    let state = manager
        .launch_workflow(LOAN_PROCESS, "loan-application", uuid::Uuid::new_v4(), loan_params())
        .await?;
    manager.start_workflow(state.id()).await?;
    Ok(state.id())
}

/// Drive a started loan until the processing steps are active.
pub async fn reach_processing<S: Store>(
    manager: &WorkflowManager<S>,
    workflow_id: WorkflowId,
) -> anyhow::Result<()> {
    manager
        .inject_event(
            workflow_id,
            "borrower-info-submitted",
            EventData::new(json!({ "borrower_name": "Ada" })).for_selector(BASIC_INFO),
        )
        .await?;
    manager
        .inject_event(
            workflow_id,
            "credit-report-received",
            EventData::new(json!({ "credit_score": 712 })).for_selector(SOFT_PULL),
        )
        .await?;
    manager
        .inject_event(workflow_id, "pre-approval-issued", EventData::default())
        .await?;
    Ok(())
}

/// Drive a started loan through every step until it completes.
pub async fn complete_loan<S: Store>(
    manager: &WorkflowManager<S>,
    workflow_id: WorkflowId,
) -> anyhow::Result<()> {
    reach_processing(manager, workflow_id).await?;

    let employment = manager
        .load_workflow(workflow_id)
        .await?
        .step_by_selector(EMPLOYMENT)
        .map(|s| s.id)
        .ok_or_else(|| anyhow::anyhow!("employment step missing"))?;
    for state in ["PENDING", "DONE", "FINISH"] {
        manager.transit_step(workflow_id, employment, state).await?;
    }

    for document in DOCUMENTS {
        manager
            .inject_event(
                workflow_id,
                "document-received",
                EventData::new(json!({ "file": format!("{document}.pdf") })).for_selector(document),
            )
            .await?;
    }

    manager
        .inject_event(
            workflow_id,
            "loan-funded",
            EventData::new(json!({ "amount": 350_000 })),
        )
        .await?;
    Ok(())
}

/// Wrap a hand-built mutation for [`WorkflowManager::persist_mutations`].
pub fn envelope(
    workflow_id: WorkflowId,
    transaction_id: TransactionId,
    order: u32,
    mutation: Mutation,
) -> MutationEnvelope {
    MutationEnvelope {
        name: mutation.name().to_owned(),
        workflow_id,
        step_id: None,
        transaction_id,
        action: "test".to_owned(),
        order,
        mutation,
    }
}
