use std::sync::Arc;
use std::time::Duration;

use stepwire::dispatcher::{DispatcherCall, Termination};
use stepwire::error::StepResult;
use stepwire::history::RawStep;
use stepwire::runtime::observability::{LogConfig, init_logging};
use stepwire::{
    FnWorkflow, HttpRequest, InMemoryDispatcher, LazyStep, WorkflowContext, WorkflowOptions, WorkflowService,
    workflow_info,
};

const WORKFLOW_URL: &str = "https://app.example.com/api/onboarding";

async fn onboarding(ctx: WorkflowContext) -> StepResult<String> {
    let user: String = ctx.payload()?;
    workflow_info!(ctx, user = %user, "onboarding started");

    let account = ctx
        .run("create-account", move || async move { Ok(format!("acct-{user}")) })
        .await?;
    ctx.sleep("cool-down", Duration::from_secs(2)).await?;

    let welcome = account.clone();
    let report = account.clone();
    let outs = ctx
        .run_all(vec![
            LazyStep::run("send-welcome", move || async move { Ok(format!("welcome sent to {welcome}")) })?,
            LazyStep::run("notify-sales", move || async move { Ok(format!("sales notified about {report}")) })?,
        ])
        .await?;
    let summary: Vec<String> = outs.into_iter().flatten().collect();
    workflow_info!(ctx, steps = ctx.step_count(), "onboarding finished");
    Ok(format!("{account}: {}", summary.join("; ")))
}

/// Plays the dispatcher: every published request becomes a history entry and
/// is delivered back to the service, oldest first.
async fn drive(service: &WorkflowService, dispatcher: &InMemoryDispatcher, first: HttpRequest) {
    let response = service.handle(first).await;
    println!("trigger -> {} {}", response.status, response.body);

    let mut history: Vec<RawStep> = Vec::new();
    let mut delivered = 0;
    let mut message_counter = 0;
    loop {
        let published = dispatcher.published().await;
        if published.len() == delivered {
            break;
        }
        let pending = published[delivered..].to_vec();
        delivered = published.len();
        for request in pending {
            message_counter += 1;
            let message_id = format!("msg-{message_counter}");
            history.push(RawStep::step(&message_id, request.body.as_deref().unwrap_or_default()));
            let delivery = InMemoryDispatcher::delivery(&request, &history, &message_id);
            let response = service.handle(delivery).await;
            println!("{message_id} -> {} {}", response.status, response.body);
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("stepwire-demo: {e}");
    }

    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let service = WorkflowService::new(
        FnWorkflow(onboarding),
        dispatcher.clone(),
        WorkflowOptions::default().with_retries(3),
    );

    drive(&service, &dispatcher, HttpRequest::post(WORKFLOW_URL, "\"ada\"")).await;

    for call in dispatcher.calls().await {
        if let DispatcherCall::Cancel {
            run_id,
            termination: Termination::Completed(output),
        } = call
        {
            println!("COMPLETED {run_id}: {}", output.unwrap_or_default());
        }
    }
}
