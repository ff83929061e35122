//! Redelivery Tests
//!
//! At-least-once delivery produces repeated history entries. A delivery whose
//! last entry repeats an earlier one is a stale duplicate and does nothing.

use std::sync::Arc;

use super::helpers::*;
use stepwire::{FnWorkflow, InMemoryDispatcher, LazyStep, WorkflowContext, WorkflowHandler};

fn three_steps(invocations: Counter) -> impl WorkflowHandler {
    FnWorkflow(move |ctx: WorkflowContext| {
        let invocations = invocations.clone();
        async move {
            invocations.hit();
            let mut outs = Vec::new();
            for name in ["s1", "s2", "s3"] {
                outs.push(ctx.run(name, move || async move { Ok(format!("{name}-out")) }).await?);
            }
            Ok(outs.join(","))
        }
    })
}

/// Trailing duplicate result: no user code, no dispatcher call.
#[tokio::test]
async fn trailing_duplicate_result_is_a_no_op() {
    let invocations = Counter::default();
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(three_steps(invocations.clone()), &dispatcher);
    let s1 = result_step(1, "s1", "s1-out");

    let response = service
        .handle(continuation(&history("{}", &[s1.clone(), s1])))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(finish_condition(&response), "duplicate-step");
    assert_eq!(body_json(&response)["workflowRunId"], RUN_ID);
    assert_eq!(invocations.get(), 0);
    assert!(dispatcher.calls().await.is_empty());
}

/// A repeated plan step at the end is a duplicate too.
#[tokio::test]
async fn trailing_duplicate_plan_is_a_no_op() {
    let invocations = Counter::default();
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(
        FnWorkflow({
            let invocations = invocations.clone();
            move |ctx: WorkflowContext| {
                let invocations = invocations.clone();
                async move {
                    invocations.hit();
                    ctx.run_all(vec![
                        LazyStep::run("A", || async { Ok("a".to_string()) })?,
                        LazyStep::run("B", || async { Ok("b".to_string()) })?,
                    ])
                    .await?;
                    Ok(String::new())
                }
            }
        }),
        &dispatcher,
    );
    let plan_a = plan_step(1, "A", 2);
    let plan_b = plan_step(2, "B", 2);

    let response = service
        .handle(continuation(&history("{}", &[plan_a.clone(), plan_b, plan_a])))
        .await;

    assert_eq!(finish_condition(&response), "duplicate-step");
    assert_eq!(invocations.get(), 0);
    assert!(dispatcher.calls().await.is_empty());
}

/// A duplicate in the middle of history is dropped and the run proceeds from
/// the deduplicated view.
#[tokio::test]
async fn earlier_duplicates_are_deduplicated() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(three_steps(Counter::default()), &dispatcher);
    let s1 = result_step(1, "s1", "s1-out");
    let s2 = result_step(2, "s2", "s2-out");

    let response = service
        .handle(continuation(&history("{}", &[s1.clone(), s1, s2])))
        .await;

    assert_eq!(finish_condition(&response), "success");
    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    let step = published_step(&published[0]);
    assert_eq!((step.step_id, step.step_name.as_str()), (3, "s3"));
}

/// The first recorded output wins when a result was recorded twice with
/// different outputs.
#[tokio::test]
async fn first_recorded_output_wins() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(three_steps(Counter::default()), &dispatcher);

    service
        .handle(continuation(&history(
            "{}",
            &[
                result_step(1, "s1", "first"),
                result_step(1, "s1", "second"),
                result_step(2, "s2", "s2-out"),
                result_step(3, "s3", "s3-out"),
            ],
        )))
        .await;

    assert_eq!(
        completed_output(&dispatcher).await,
        Some(Some("first,s2-out,s3-out".to_string()))
    );
}

/// Delivering the same request twice through the simulated dispatcher only
/// executes the step once.
#[tokio::test]
async fn redelivered_request_does_not_repeat_side_effects() {
    let counter = Counter::default();
    let c = counter.clone();
    let mut harness = Harness::new(FnWorkflow(move |ctx: WorkflowContext| {
        let c = c.clone();
        async move {
            ctx.run("charge", move || async move {
                c.hit();
                Ok("charged".to_string())
            })
            .await?;
            ctx.run("receipt", || async { Ok("sent".to_string()) }).await?;
            Ok("ok".to_string())
        }
    }));

    harness.trigger("{}").await;
    harness.drive().await;
    assert_eq!(counter.get(), 1);

    // The dispatcher redelivers the charge result after the run moved on.
    let charge = harness
        .dispatcher
        .published()
        .await
        .into_iter()
        .map(|r| published_step(&r))
        .find(|s| s.step_name == "charge")
        .unwrap();
    let mut steps: Vec<_> = harness
        .dispatcher
        .published()
        .await
        .iter()
        .skip(1)
        .map(published_step)
        .collect();
    steps.push(charge);
    harness.dispatcher.clear_calls().await;

    let response = harness.service.handle(continuation(&history("{}", &steps))).await;

    assert_eq!(finish_condition(&response), "duplicate-step");
    assert_eq!(counter.get(), 1);
    assert!(harness.dispatcher.calls().await.is_empty());
}
