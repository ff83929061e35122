//! # stepwire
//!
//! Replay-based durable workflow steps over an at-least-once HTTP message
//! dispatcher.
//!
//! A workflow is ordinary async code. Every invocation re-runs it from the top
//! against the history the dispatcher delivers: completed steps return their
//! recorded output, and the first step without a result is submitted to the
//! dispatcher, after which the invocation ends. The dispatcher calls the
//! endpoint again once the step has executed.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stepwire::{FnWorkflow, HttpDispatcher, HttpRequest, WorkflowContext, WorkflowOptions, WorkflowService};
//! use stepwire::config::DispatcherConfig;
//! use stepwire::error::StepResult;
//!
//! async fn onboarding(ctx: WorkflowContext) -> StepResult<String> {
//!     let email: String = ctx.payload()?;
//!     let greeting = ctx
//!         .run("greet", move || async move { Ok(format!("hello {email}")) })
//!         .await?;
//!     ctx.sleep("cool-down", Duration::from_secs(60)).await?;
//!     Ok(greeting)
//! }
//!
//! # async fn serve(request: HttpRequest) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(HttpDispatcher::new(&DispatcherConfig::from_env()?)?);
//! let service = WorkflowService::new(FnWorkflow(onboarding), dispatcher, WorkflowOptions::from_env());
//! let response = service.handle(request).await;
//! println!("{} {}", response.status, response.body);
//! # Ok(())
//! # }
//! ```
//!
//! Step methods return [`StepResult`](error::StepResult); propagate their
//! errors with `?` so the invocation ends where the engine suspended it.

pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod lazy;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod step;

pub use client::{TriggerOptions, WorkflowClient};
pub use config::{DispatcherConfig, WorkflowOptions};
pub use context::WorkflowContext;
pub use dispatcher::{Dispatcher, DispatcherError, HttpDispatcher, InMemoryDispatcher};
pub use error::{Interrupt, StepResult, WorkflowError};
pub use lazy::{CallRequest, CallResponse, InvokeRequest, InvokeResult, LazyStep, WaitEventResult, Webhook};
pub use protocol::{FlowControl, Headers};
pub use runtime::{
    FailureHandler, Finish, FinishCondition, FnFailure, FnWorkflow, HttpRequest, HttpResponse, WorkflowFailure,
    WorkflowHandler, WorkflowService,
};
pub use step::{Step, StepType};
