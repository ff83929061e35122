//! Sequential Step Tests
//!
//! A single step either replays its recorded output or is executed once and
//! submitted, after which the invocation suspends.

use std::time::Duration;

use super::helpers::*;
use stepwire::dispatcher::{DispatcherCall, Termination};
use stepwire::protocol::{WORKFLOW_ID_HEADER, WORKFLOW_INIT_HEADER, WORKFLOW_PROTOCOL_VERSION_HEADER};
use stepwire::{FnWorkflow, InMemoryDispatcher, StepType, WorkflowContext};
use std::sync::Arc;

fn echo_workflow(counter: Counter) -> impl stepwire::WorkflowHandler {
    FnWorkflow(move |ctx: WorkflowContext| {
        let counter = counter.clone();
        async move {
            let input: String = ctx.payload()?;
            let out = ctx
                .run("s1", move || async move {
                    counter.hit();
                    Ok(format!("{input}-done"))
                })
                .await?;
            Ok(out)
        }
    })
}

// ============================================================================
// First invocation
// ============================================================================

/// A request without protocol headers starts the run: one init publish back to
/// the endpoint, no user step executed.
#[tokio::test]
async fn first_invocation_publishes_init_request() {
    let counter = Counter::default();
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(echo_workflow(counter.clone()), &dispatcher);

    let response = service
        .handle(stepwire::HttpRequest::post(WORKFLOW_URL, "\"input\""))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(finish_condition(&response), "success");
    let run_id = body_json(&response)["workflowRunId"].as_str().unwrap().to_string();
    assert!(run_id.starts_with("wfr_"));
    assert_eq!(counter.get(), 0);

    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    let init = &published[0];
    assert_eq!(init.url, WORKFLOW_URL);
    assert_eq!(init.body.as_deref(), Some("\"input\""));
    assert_eq!(init.headers.get(WORKFLOW_INIT_HEADER), Some("true"));
    assert_eq!(init.headers.get(WORKFLOW_ID_HEADER), Some(run_id.as_str()));
    assert_eq!(
        init.headers.get(&format!("Upstash-Forward-{WORKFLOW_PROTOCOL_VERSION_HEADER}")),
        Some("1")
    );
}

/// A caller-provided run id header is kept on the first invocation.
#[tokio::test]
async fn first_invocation_keeps_supplied_run_id() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(echo_workflow(Counter::default()), &dispatcher);
    let request = stepwire::HttpRequest::post(WORKFLOW_URL, "\"x\"").header(WORKFLOW_ID_HEADER, "wfr_given");

    let response = service.handle(request).await;

    assert_eq!(body_json(&response)["workflowRunId"], "wfr_given");
}

// ============================================================================
// Execute then replay
// ============================================================================

/// History holds only the initial payload: the step function runs once and its
/// result is submitted as step 1.
#[tokio::test]
async fn missing_result_executes_and_submits_step() {
    let counter = Counter::default();
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(echo_workflow(counter.clone()), &dispatcher);

    let response = service.handle(continuation(&history("\"input\"", &[]))).await;

    assert_eq!(response.status, 200);
    assert_eq!(finish_condition(&response), "success");
    assert_eq!(counter.get(), 1);

    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].url, WORKFLOW_URL);
    assert_eq!(published[0].headers.get(WORKFLOW_ID_HEADER), Some(RUN_ID));
    assert_eq!(published[0].headers.get(WORKFLOW_INIT_HEADER), Some("false"));
    let step = published_step(&published[0]);
    assert_eq!(step.step_id, 1);
    assert_eq!(step.step_name, "s1");
    assert_eq!(step.step_type, StepType::Run);
    assert_eq!(step.out.as_deref(), Some("input-done"));
    assert!(completed_output(&dispatcher).await.is_none());
}

/// With the result recorded, the function is not called again and the run
/// completes with the replayed output.
#[tokio::test]
async fn recorded_result_is_replayed_without_side_effects() {
    let counter = Counter::default();
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(echo_workflow(counter.clone()), &dispatcher);
    let recorded = result_step(1, "s1", "input-done");

    let response = service
        .handle(continuation(&history("\"input\"", &[recorded])))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(counter.get(), 0);
    assert!(dispatcher.published().await.is_empty());
    assert_eq!(
        dispatcher.calls().await,
        vec![DispatcherCall::Cancel {
            run_id: RUN_ID.to_string(),
            termination: Termination::Completed(Some("input-done".to_string())),
        }]
    );
}

/// Replaying earlier steps issues no dispatcher call for them; only the first
/// unrecorded step is submitted.
#[tokio::test]
async fn replay_submits_only_the_next_step() {
    let first = Counter::default();
    let second = Counter::default();
    let (c1, c2) = (first.clone(), second.clone());
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(
        FnWorkflow(move |ctx: WorkflowContext| {
            let (c1, c2) = (c1.clone(), c2.clone());
            async move {
                let a = ctx
                    .run("a", move || async move {
                        c1.hit();
                        Ok("1".to_string())
                    })
                    .await?;
                let b = ctx
                    .run("b", move || async move {
                        c2.hit();
                        Ok(format!("{a}2"))
                    })
                    .await?;
                Ok(b)
            }
        }),
        &dispatcher,
    );

    service
        .handle(continuation(&history("{}", &[result_step(1, "a", "1")])))
        .await;

    assert_eq!(first.get(), 0);
    assert_eq!(second.get(), 1);
    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    let step = published_step(&published[0]);
    assert_eq!((step.step_id, step.step_name.as_str()), (2, "b"));
    assert_eq!(step.out.as_deref(), Some("12"));
}

// ============================================================================
// Sleep
// ============================================================================

/// A sleep is submitted with the dispatcher-side delay and no output.
#[tokio::test]
async fn sleep_is_scheduled_by_the_dispatcher() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(
        FnWorkflow(|ctx: WorkflowContext| async move {
            ctx.sleep("nap", Duration::from_secs(30)).await?;
            Ok("awake".to_string())
        }),
        &dispatcher,
    );

    service.handle(continuation(&history("{}", &[]))).await;

    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].delay, Some(Duration::from_secs(30)));
    let step = published_step(&published[0]);
    assert_eq!(step.step_type, StepType::SleepFor);
    assert_eq!(step.sleep_for, Some(30));
    assert!(step.out.is_none());
}

// ============================================================================
// Full runs
// ============================================================================

/// Trigger, then let the simulated dispatcher deliver until the run settles.
#[tokio::test]
async fn run_completes_through_redeliveries() {
    let counter = Counter::default();
    let c = counter.clone();
    let mut harness = Harness::new(FnWorkflow(move |ctx: WorkflowContext| {
        let c = c.clone();
        async move {
            let name: String = ctx.payload()?;
            let c2 = c.clone();
            let greeting = ctx
                .run("greet", move || async move {
                    c.hit();
                    Ok(format!("hello {name}"))
                })
                .await?;
            ctx.sleep("pause", Duration::from_secs(1)).await?;
            let shout = ctx
                .run("shout", move || async move {
                    c2.hit();
                    Ok(greeting.to_uppercase())
                })
                .await?;
            Ok(shout)
        }
    }));

    harness.trigger("\"ada\"").await;
    let deliveries = harness.drive().await;

    // init, greet, pause, shout
    assert_eq!(deliveries, 4);
    assert_eq!(counter.get(), 2);
    assert!(harness.responses.iter().all(|r| r.status == 200));
    assert_eq!(
        completed_output(&harness.dispatcher).await,
        Some(Some("HELLO ADA".to_string()))
    );
}

/// `run_typed` stores JSON and decodes it on replay.
#[tokio::test]
async fn typed_outputs_round_trip_through_history() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Order {
        id: u32,
        total: u64,
    }

    let mut harness = Harness::new(FnWorkflow(|ctx: WorkflowContext| async move {
        let order: Order = ctx
            .run_typed("load", || async { Ok(Order { id: 7, total: 1200 }) })
            .await?;
        Ok(format!("{}:{}", order.id, order.total))
    }));

    harness.trigger("{}").await;
    harness.drive().await;

    let recorded = published_step(&harness.dispatcher.published().await[1]);
    assert_eq!(recorded.out.as_deref(), Some("{\"id\":7,\"total\":1200}"));
    assert_eq!(
        completed_output(&harness.dispatcher).await,
        Some(Some("7:1200".to_string()))
    );
}
