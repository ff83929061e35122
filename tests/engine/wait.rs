//! Event Tests
//!
//! Waiting on events and webhooks registers with the dispatcher instead of
//! publishing; notify and webhook creation record their results like a run.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::helpers::*;
use stepwire::dispatcher::{DispatcherCall, NotifyResponse, Waiter};
use stepwire::lazy::NotifyStepResult;
use stepwire::protocol::WORKFLOW_CALL_TYPE_HEADER;
use stepwire::{FnWorkflow, InMemoryDispatcher, Step, StepType, WaitEventResult, Webhook, WorkflowContext, WorkflowHandler};

fn waiting() -> impl WorkflowHandler {
    FnWorkflow(|ctx: WorkflowContext| async move {
        let result = ctx
            .wait_for_event("approval", "order-7-approved", Duration::from_secs(3600))
            .await?;
        Ok(match (result.timeout, result.event_data) {
            (true, _) => "timed out".to_string(),
            (false, data) => format!("approved: {}", data.unwrap_or_default()),
        })
    })
}

fn wait_result(event_data: Option<&str>, timed_out: bool) -> Step {
    let mut step = typed_result(1, "approval", StepType::Wait, None);
    step.wait_event_id = Some("order-7-approved".to_string());
    step.timeout = Some(3600);
    step.out = event_data.map(|data| STANDARD.encode(data));
    step.wait_timeout = Some(timed_out);
    step
}

/// Waiting registers with the dispatcher and publishes nothing.
#[tokio::test]
async fn wait_registers_with_dispatcher() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(waiting(), &dispatcher);

    let response = service.handle(continuation(&history("{}", &[]))).await;

    assert_eq!(response.status, 200);
    let calls = dispatcher.calls().await;
    assert_eq!(calls.len(), 1, "{calls:?}");
    let DispatcherCall::Wait(wait) = &calls[0] else {
        panic!("expected a wait registration, got {calls:?}");
    };
    assert_eq!(wait.event_id, "order-7-approved");
    assert_eq!(wait.timeout, Duration::from_secs(3600));
    assert_eq!(wait.url, WORKFLOW_URL);
    assert_eq!(wait.timeout_url, WORKFLOW_URL);
    assert_eq!(wait.timeout_headers.get("Upstash-Workflow-Runid"), Some(RUN_ID));
    assert_eq!(wait.timeout_headers.get(WORKFLOW_CALL_TYPE_HEADER), Some("step"));
    assert_eq!((wait.step.step_id, wait.step.step_type), (1, StepType::Wait));
}

/// A notified wait replays with the decoded event data.
#[tokio::test]
async fn notified_wait_replays_event_data() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(waiting(), &dispatcher);

    service
        .handle(continuation(&history("{}", &[wait_result(Some("by alice"), false)])))
        .await;

    assert_eq!(
        completed_output(&dispatcher).await,
        Some(Some("approved: by alice".to_string()))
    );
}

/// A wait resolved by the dispatcher's timeout replays as timed out.
#[tokio::test]
async fn timed_out_wait_replays_as_timeout() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(waiting(), &dispatcher);

    service
        .handle(continuation(&history("{}", &[wait_result(None, true)])))
        .await;

    assert_eq!(completed_output(&dispatcher).await, Some(Some("timed out".to_string())));
}

/// Notify reaches the dispatcher at execution time and records who was woken.
#[tokio::test]
async fn notify_records_woken_waiters() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    dispatcher
        .add_waiter(
            "order-7-approved",
            Waiter {
                url: "https://app.test/api/other".to_string(),
                deadline: 1_700_000_000,
            },
        )
        .await;
    let service = service(
        FnWorkflow(|ctx: WorkflowContext| async move {
            let result = ctx.notify("approve", "order-7-approved", "by alice").await?;
            Ok(result.notify_response.len().to_string())
        }),
        &dispatcher,
    );

    service.handle(continuation(&history("{}", &[]))).await;

    let calls = dispatcher.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        DispatcherCall::Notify {
            event_id: "order-7-approved".to_string(),
            data: "by alice".to_string(),
        }
    );
    let DispatcherCall::Publish(published) = &calls[1] else {
        panic!("expected the notify result to be published, got {calls:?}");
    };
    let step = published_step(published);
    assert_eq!(step.step_type, StepType::Notify);
    let out: NotifyStepResult = serde_json::from_str(step.out.as_deref().unwrap()).unwrap();
    assert_eq!(out.event_data, "by alice");
    assert_eq!(out.notify_response.len(), 1);
    let NotifyResponse { waiter, .. } = &out.notify_response[0];
    assert_eq!(waiter.url, "https://app.test/api/other");
}

/// Replaying a recorded notify does not notify again.
#[tokio::test]
async fn recorded_notify_is_not_repeated() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(
        FnWorkflow(|ctx: WorkflowContext| async move {
            let result = ctx.notify("approve", "evt", "data").await?;
            Ok(result.event_id)
        }),
        &dispatcher,
    );
    let out = serde_json::json!({ "eventId": "evt", "eventData": "data", "notifyResponse": [] }).to_string();

    service
        .handle(continuation(&history(
            "{}",
            &[typed_result(1, "approve", StepType::Notify, Some(&out))],
        )))
        .await;

    let calls = dispatcher.calls().await;
    assert!(!calls.iter().any(|c| matches!(c, DispatcherCall::Notify { .. })));
    assert_eq!(completed_output(&dispatcher).await, Some(Some("evt".to_string())));
}

/// A webhook is minted once under the run and then awaited like an event.
#[tokio::test]
async fn webhook_is_created_then_awaited() {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = service(
        FnWorkflow(|ctx: WorkflowContext| async move {
            let hook = ctx.create_webhook("hook").await?;
            let result = ctx
                .wait_for_webhook("callback", &hook, Duration::from_secs(60))
                .await?;
            Ok(result.event_data.unwrap_or_default())
        }),
        &dispatcher,
    );

    service.handle(continuation(&history("{}", &[]))).await;

    let published = dispatcher.published().await;
    assert_eq!(published.len(), 1);
    let created = published_step(&published[0]);
    assert_eq!(created.step_type, StepType::CreateWebhook);
    let hook: Webhook = serde_json::from_str(created.out.as_deref().unwrap()).unwrap();
    assert_eq!(
        hook.webhook_url,
        format!("http://dispatcher.local/v2/workflows/hooks/{RUN_ID}/{}", hook.event_id)
    );

    dispatcher.clear_calls().await;
    service
        .handle(continuation(&history("{}", &[created.clone()])))
        .await;

    let calls = dispatcher.calls().await;
    assert_eq!(calls.len(), 1);
    let DispatcherCall::Wait(wait) = &calls[0] else {
        panic!("expected a wait registration, got {calls:?}");
    };
    assert_eq!(wait.event_id, hook.event_id);
    assert_eq!(wait.step.step_type, StepType::WaitForWebhook);
    assert_eq!(wait.timeout, Duration::from_secs(60));
}

/// The wait result type decodes from the normalized history record.
#[test]
fn wait_result_decodes_camel_case() {
    let result: WaitEventResult = serde_json::from_str(r#"{"eventData":"x","timeout":false}"#).unwrap();
    assert_eq!(result.event_data.as_deref(), Some("x"));
    assert!(!result.timeout);
}
