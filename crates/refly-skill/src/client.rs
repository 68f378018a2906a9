//! HTTP side of a skill invocation.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use refly_common::{BaseResponse, Config, ErrorCode, TokenSource};
use reqwest::{StatusCode, header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::demux::StreamDecoder;
use crate::error::SkillError;
use crate::event::StreamEvent;
use crate::handler::SkillHandler;
use crate::request::InvokeSkillRequest;

pub const STREAM_INVOKE_PATH: &str = "/v1/skill/streamInvoke";

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The stream ran to its end without reporting an error.
    Completed,
    /// The cancellation token fired. No error was reported.
    Aborted,
    /// The request, envelope or stream failed, or the server sent an
    /// `error` event. `on_error` was called.
    Failed,
}

#[derive(Clone)]
pub struct SkillClient {
    http: reqwest::Client,
    endpoint: Url,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for SkillClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

enum Envelope {
    Stream(reqwest::Response),
    /// JSON body that was the whole answer.
    Done(BaseResponse),
    Aborted,
}

impl SkillClient {
    pub fn new(server_origin: &Url, tokens: Arc<dyn TokenSource>) -> Result<Self, SkillError> {
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: server_origin.join(STREAM_INVOKE_PATH)?,
            tokens,
        })
    }

    pub fn from_config(config: &Config, tokens: Arc<dyn TokenSource>) -> Result<Self, SkillError> {
        Self::new(&config.server_origin, tokens)
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Run one invocation, feeding every event to `handler` in stream order.
    ///
    /// `on_completed` is only called after `on_start`. A rejected request
    /// reports `on_error` alone.
    ///
    /// Cancelling `cancel` ends the invocation quietly: no `on_error`, no
    /// `on_completed`, and nothing dispatched after the point it fired.
    pub async fn invoke<H: SkillHandler>(
        &self,
        payload: &InvokeSkillRequest,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> InvokeOutcome {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return InvokeOutcome::Aborted,
            response = self.send_with_refresh(payload) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "skill invocation request failed");
                return fail(handler, e.to_response());
            }
        };

        let response = match read_envelope(response, cancel).await {
            Ok(Envelope::Stream(response)) => response,
            Ok(Envelope::Done(envelope)) if envelope.success => {
                handler.on_start();
                handler.on_completed(false);
                return InvokeOutcome::Completed;
            }
            Ok(Envelope::Done(envelope)) => {
                warn!(code = ?envelope.err_code, message = envelope.message(), "skill invocation rejected");
                return fail(handler, envelope);
            }
            Ok(Envelope::Aborted) => return InvokeOutcome::Aborted,
            Err(e) => {
                warn!(error = %e, "skill invocation rejected");
                return fail(handler, e.to_response());
            }
        };

        handler.on_start();
        pump(response.bytes_stream(), handler, cancel).await
    }

    async fn send_with_refresh(
        &self,
        payload: &InvokeSkillRequest,
    ) -> Result<reqwest::Response, SkillError> {
        let response = self.send(payload, self.tokens.token()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("token rejected, refreshing once");
        let token = self.tokens.refresh().await?;
        Ok(self.send(payload, Some(token)).await?)
    }

    async fn send(
        &self,
        payload: &InvokeSkillRequest,
        token: Option<String>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(header::ACCEPT, "text/event-stream")
            .json(payload);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await
    }
}

fn fail<H: SkillHandler>(handler: &mut H, error: BaseResponse) -> InvokeOutcome {
    handler.on_event(&StreamEvent::failure(error));
    InvokeOutcome::Failed
}

/// Decide from status and content type whether the body is an event stream.
async fn read_envelope(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<Envelope, SkillError> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if status.is_success() && !is_json {
        return Ok(Envelope::Stream(response));
    }

    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Envelope::Aborted),
        body = response.text() => body?,
    };

    if is_json {
        if let Ok(envelope) = serde_json::from_str::<BaseResponse>(&body) {
            if status.is_success() || !envelope.success {
                return Ok(Envelope::Done(envelope));
            }
        }
    }
    Err(SkillError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Decode a byte stream and dispatch its events until it ends, fails or
/// `cancel` fires.
///
/// A server `error` event fails the invocation, but the rest of the stream is
/// still dispatched.
pub async fn pump<S, E, H>(stream: S, handler: &mut H, cancel: &CancellationToken) -> InvokeOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
    H: SkillHandler,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new();
    let mut reported_error = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return InvokeOutcome::Aborted,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for event in decoder.push(&chunk) {
                    if cancel.is_cancelled() {
                        return InvokeOutcome::Aborted;
                    }
                    reported_error |= event.is_error();
                    handler.on_event(&event);
                }
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return InvokeOutcome::Aborted;
                }
                warn!(error = %e, "skill stream interrupted");
                let outcome = fail(
                    handler,
                    BaseResponse::failure(ErrorCode::Connection, e.to_string()),
                );
                handler.on_completed(true);
                return outcome;
            }
            None => break,
        }
    }

    if let Some(event) = decoder.finish() {
        reported_error |= event.is_error();
        handler.on_event(&event);
    }
    debug!(failed = reported_error, "skill stream finished");
    handler.on_completed(reported_error);
    if reported_error {
        InvokeOutcome::Failed
    } else {
        InvokeOutcome::Completed
    }
}
