use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{Dispatcher, DispatcherError, NotifyResponse, PublishRequest, PublishResponse, Termination, WaitRequest};
use crate::config::DispatcherConfig;
use crate::history::RawStep;
use crate::protocol::{Headers, whole_seconds};

/// Dispatcher backed by the QStash REST API.
pub struct HttpDispatcher {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpDispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self, DispatcherError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DispatcherError::transport("client", e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send(&self, operation: &'static str, builder: RequestBuilder) -> Result<String, DispatcherError> {
        let response = builder
            .send()
            .await
            .map_err(|e| DispatcherError::transport(operation, e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| DispatcherError::transport(operation, e.to_string()))?;
        debug!(operation, status, "dispatcher response");
        if !(200..300).contains(&status) {
            return Err(DispatcherError::from_status(operation, status, text));
        }
        Ok(text)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, DispatcherError> {
        let text = self.send(operation, builder).await?;
        serde_json::from_str(&text)
            .map_err(|e| DispatcherError::rejected(operation, format!("unexpected response body: {e}")))
    }
}

fn scheduling_headers(request: &PublishRequest) -> Headers {
    let mut headers = request.headers.clone();
    if let Some(delay) = request.delay {
        headers.insert("Upstash-Delay", format!("{}s", whole_seconds(delay)));
    }
    if let Some(not_before) = request.not_before {
        headers.insert("Upstash-Not-Before", not_before.to_string());
    }
    if request.method != "POST" {
        headers.insert("Upstash-Method", request.method.clone());
    }
    headers
}

fn apply_headers(mut builder: RequestBuilder, headers: &Headers) -> RequestBuilder {
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
}

fn headers_json(headers: &Headers, as_lists: bool) -> Value {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            let value = if as_lists { json!([value]) } else { json!(value) };
            (name.to_string(), value)
        })
        .collect();
    Value::Object(map)
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, DispatcherError> {
        let headers = scheduling_headers(&request);
        let builder = apply_headers(
            self.request(Method::POST, &format!("v2/publish/{}", request.url)),
            &headers,
        )
        .body(request.body.unwrap_or_default());
        self.send_json("publish", builder).await
    }

    async fn batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<PublishResponse>, DispatcherError> {
        let messages: Vec<Value> = requests
            .iter()
            .map(|request| {
                json!({
                    "destination": request.url,
                    "headers": headers_json(&scheduling_headers(request), false),
                    "body": request.body.clone().unwrap_or_default(),
                })
            })
            .collect();
        let builder = self.request(Method::POST, "v2/batch").json(&messages);
        self.send_json("batch", builder).await
    }

    async fn wait(&self, request: WaitRequest) -> Result<(), DispatcherError> {
        let body = json!({
            "url": request.url,
            "timeout": format!("{}s", whole_seconds(request.timeout)),
            "timeoutUrl": request.timeout_url,
            "timeoutHeaders": headers_json(&request.timeout_headers, true),
            "step": {
                "stepId": request.step.step_id,
                "stepType": request.step.step_type,
                "stepName": request.step.step_name,
                "concurrent": request.step.concurrent,
                "targetStep": request.step.target_step,
            },
        });
        let builder = apply_headers(
            self.request(Method::POST, &format!("v2/wait/{}", request.event_id)),
            &request.headers,
        )
        .json(&body);
        self.send("wait", builder).await.map(|_| ())
    }

    async fn notify(&self, event_id: &str, data: &str) -> Result<Vec<NotifyResponse>, DispatcherError> {
        let builder = self
            .request(Method::POST, &format!("v2/notify/{event_id}"))
            .body(data.to_string());
        self.send_json("notify", builder).await
    }

    async fn cancel(&self, run_id: &str, termination: Termination) -> Result<(), DispatcherError> {
        let (cancel, body) = match termination {
            Termination::Cancelled => (true, None),
            Termination::Completed(output) => (false, output),
        };
        let mut builder = self.request(
            Method::DELETE,
            &format!("v2/workflows/runs/{run_id}?cancel={cancel}"),
        );
        if let Some(body) = body {
            builder = builder.body(body);
        }
        self.send("cancel", builder).await.map(|_| ())
    }

    async fn fetch_history(&self, run_id: &str) -> Result<Vec<RawStep>, DispatcherError> {
        let builder = self.request(
            Method::GET,
            &format!("v2/workflows/runs/{run_id}?groupBy=workflowRunId"),
        );
        self.send_json("fetch_history", builder).await
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
