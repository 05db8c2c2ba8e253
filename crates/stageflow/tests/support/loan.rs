//! Loan application process used by the integration suites.
//!
//! ```text
//! PRE-QUALIFICATION   basic-info ──► soft-pull
//! APPLICATION                          └──► pre-approval
//! PROCESSING                                  ├──► employment
//!                                             ├──► doc:w2, doc:paystub
//! CLOSING                                     └──► funding
//! ```

use stageflow::{
    Error, NewStep, Role, Stage, StepDefinition, Transition, Trigger, WorkflowDefinition,
    WorkflowState,
};

pub const LOAN_PROCESS: &str = "loan-application-process";

pub const BASIC_INFO: &str = "basic-info";
pub const SOFT_PULL: &str = "soft-pull";
pub const PRE_APPROVAL: &str = "pre-approval";
pub const EMPLOYMENT: &str = "employment";
pub const FUNDING: &str = "funding";
pub const DOCUMENTS: [&str; 2] = ["doc:w2", "doc:paystub"];

fn event_step(trigger: &Trigger) -> stageflow::Result<stageflow::StepId> {
    trigger
        .step_id
        .ok_or_else(|| Error::StepRoutingRequired(trigger.event_name.clone()))
}

fn memorize_payload(wf: &mut WorkflowState, trigger: &Trigger) -> stageflow::Result<()> {
    let step_id = event_step(trigger)?;
    let pairs = trigger.payload.as_object().cloned().unwrap_or_default();
    wf.memorize(pairs, Some(step_id))
}

pub fn loan_definition() -> WorkflowDefinition {
    WorkflowDefinition::builder(LOAN_PROCESS)
        .title("Loan application")
        .revision(2)
        .stage(Stage::new("PRE-QUALIFICATION", "Pre-qualification", 1))
        .stage(Stage::new("APPLICATION", "Application", 2))
        .stage(Stage::new("PROCESSING", "Processing", 3))
        .stage(Stage::new("UNDERWRITING", "Underwriting", 4))
        .stage(Stage::new("CLOSING", "Closing", 5))
        .role(Role::new("LoanOfficer", "Loan officer"))
        .role(Role::new("Borrower", "Borrower"))
        .role(Role::new("Processor", "Processor"))
        .role(Role::new("Underwriter", "Underwriter"))
        .role(Role::new("ClosingAgent", "Closing agent"))
        .step(
            StepDefinition::builder("CollectBasicInformation", "PRE-QUALIFICATION")
                .title("Collect basic information")
                .states(["PENDING", "COLLECTING", "COMPLETED"])
                .begin("PENDING")
                .finish("COMPLETED")
                .transition("COLLECTING", |_| {
                    Transition::new().narrate("collecting borrower information")
                })
                .transition_from("COMPLETED", ["COLLECTING"], |ctx| {
                    let name = ctx
                        .memory
                        .get("borrower_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("borrower")
                        .to_owned();
                    Transition::new()
                        .narrate(format!("{name} pre-qualified"))
                        .memorize_workflow("pre_qualified", true)
                        .add_step(NewStep::new("RequestSoftPull").selector(SOFT_PULL))
                })
                .on_event("borrower-info-submitted", |wf, trigger| {
                    let step_id = event_step(trigger)?;
                    memorize_payload(wf, trigger)?;
                    wf.transit(step_id, "COLLECTING")?;
                    wf.transit(step_id, "COMPLETED")?;
                    Ok(())
                }),
        )
        .step(
            StepDefinition::builder("RequestSoftPull", "PRE-QUALIFICATION")
                .title("Request soft credit pull")
                .states(["REQUESTED", "RECEIVED"])
                .transition("REQUESTED", |_| Transition::new())
                .transition_from("RECEIVED", ["REQUESTED"], |_| Transition::new())
                .transition_from("_FINISHED", ["RECEIVED"], |ctx| {
                    let score = ctx.memory.get("credit_score").cloned().unwrap_or_default();
                    Transition::new()
                        .narrate("credit report received")
                        .memorize_workflow("credit_score", score)
                        .add_step(NewStep::new("IssuePreApproval").selector(PRE_APPROVAL))
                })
                .on_event("credit-report-received", |wf, trigger| {
                    let step_id = event_step(trigger)?;
                    memorize_payload(wf, trigger)?;
                    if wf.step(step_id).is_some_and(|s| s.state == "_CREATED") {
                        wf.transit(step_id, "REQUESTED")?;
                    }
                    wf.transit(step_id, "RECEIVED")?;
                    wf.transit(step_id, "_FINISHED")?;
                    Ok(())
                }),
        )
        .step(
            StepDefinition::builder("IssuePreApproval", "APPLICATION")
                .title("Issue pre-approval letter")
                .states(["DRAFTED"])
                .transition("DRAFTED", |_| Transition::new())
                .transition_from("_FINISHED", ["DRAFTED"], |_| {
                    let mut transition = Transition::new()
                        .narrate("pre-approval letter issued")
                        .output("pre_approval_letter", "pre-approval.pdf")
                        .add_step(NewStep::new("VerifyEmployment").selector(EMPLOYMENT));
                    for document in DOCUMENTS {
                        transition =
                            transition.add_step(NewStep::new("UploadDocument").selector(document));
                    }
                    transition.add_step(NewStep::new("FundLoan").selector(FUNDING))
                }),
        )
        .step(
            StepDefinition::builder("VerifyEmployment", "PROCESSING")
                .title("Verify employment")
                .states(["BEGIN", "PENDING", "DONE", "FINISH"])
                .begin("BEGIN")
                .finish("FINISH")
                .transition("PENDING", |_| Transition::new())
                .transition_from("DONE", ["PENDING"], |_| {
                    Transition::new().narrate("employment verified")
                })
                .transition_from("FINISH", ["DONE"], |_| Transition::new()),
        )
        .step(
            StepDefinition::builder("UploadDocument", "PROCESSING")
                .title("Upload document")
                .multiple()
                .states(["RECEIVED"])
                .transition("RECEIVED", |ctx| {
                    Transition::new().narrate(format!("{} received", ctx.step.selector))
                })
                .transition_from("_FINISHED", ["RECEIVED"], |_| Transition::new())
                .on_event("document-received", |wf, trigger| {
                    let step_id = event_step(trigger)?;
                    memorize_payload(wf, trigger)?;
                    wf.transit(step_id, "RECEIVED")?;
                    wf.transit(step_id, "_FINISHED")?;
                    Ok(())
                }),
        )
        .step(
            StepDefinition::builder("FundLoan", "CLOSING")
                .title("Fund loan")
                .transition("_FINISHED", |_| {
                    Transition::new().output("closing_disclosure", "closing.pdf")
                }),
        )
        .on_event("pre-approval-issued", |wf, _| {
            wf.transit_selector(PRE_APPROVAL, "DRAFTED")?;
            wf.transit_selector(PRE_APPROVAL, "_FINISHED")?;
            Ok(())
        })
        .on_event("loan-funded", |wf, trigger| {
            wf.memorize([("funded_amount", trigger.payload["amount"].clone())], None)?;
            wf.transit_selector(FUNDING, "_FINISHED")?;
            Ok(())
        })
        .on_start(|wf| {
            wf.create_step(NewStep::new("CollectBasicInformation").selector(BASIC_INFO))?;
            wf.narrate("workflow", "loan application opened")
        })
        .on_complete(|wf| wf.narrate("workflow", "loan closed"))
        .on_cancel(|wf| wf.narrate("workflow", "loan application withdrawn"))
        .build()
        .expect("loan definition is valid")
}
