use std::env;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use futures::stream::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::chat::ChatConfig;
use crate::client_logger::{ClientLogger, StderrLogger};
use crate::error::{Error, Result};
use crate::observability::{CLIENT_REQUESTS, CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS};
use crate::sse::{StreamFrame, process_frames, text_fragments};
use crate::types::{ChatCompletion, Message, RequestSpec};

/// Default DIAL endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://ai-proxy.lab.epam.com";
/// Default deployment to chat with.
pub const DEFAULT_DEPLOYMENT: &str = "gpt-4";
/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "DIAL_API_KEY";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A lazy, finite sequence of text fragments from one streaming completion.
///
/// Dropping the stream releases the underlying connection.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The capability a chat session needs from a completion endpoint.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// The deployment requests are sent to.
    fn deployment(&self) -> &str;

    /// Request a whole reply and return it as one assistant message.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EmptyResponse`] when the response has no choices,
    /// [`Error::Serialization`] when the body cannot be parsed, and a
    /// transport error (see [`Error::is_transport`]) for network or HTTP
    /// status failures.
    async fn complete(&self, messages: &[Message]) -> Result<Message>;

    /// Request a streamed reply and return its text fragments.
    ///
    /// Connection and status failures fail the call itself.  Malformed frames
    /// inside the stream are skipped rather than reported.
    async fn complete_streaming(&self, messages: &[Message]) -> Result<FragmentStream>;
}

/// Client for a DIAL chat-completion deployment.
#[derive(Clone)]
pub struct DialClient {
    api_key: String,
    client: ReqwestClient,
    base_url: Url,
    deployment: String,
    timeout: Duration,
    logger: Option<Arc<dyn ClientLogger>>,
}

impl DialClient {
    /// Create a new client for `deployment` on the default endpoint.
    ///
    /// The API key can be provided directly or read from the DIAL_API_KEY
    /// environment variable.
    pub fn new(api_key: Option<String>, deployment: impl Into<String>) -> Result<Self> {
        Self::with_options(api_key, None, deployment, None)
    }

    /// Create a new client with custom settings.
    pub fn with_options(
        api_key: Option<String>,
        base_url: Option<String>,
        deployment: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_key = match api_key {
            Some(key) => key,
            None => env::var(API_KEY_ENV).map_err(|_| {
                Error::authentication(format!(
                    "API key not provided and {API_KEY_ENV} environment variable not set"
                ))
            })?,
        };
        let base_url = Url::parse(base_url.as_deref().unwrap_or(DEFAULT_ENDPOINT))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::url(
                format!("endpoint {base_url} cannot carry a path"),
                None,
            ));
        }
        let deployment = deployment.into();
        if deployment.is_empty() {
            return Err(Error::validation(
                "deployment must not be empty",
                Some("deployment".to_string()),
            ));
        }

        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        // A streamed reply may take longer than the timeout to generate, so
        // only connecting and whole replies are bounded.
        let client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            api_key,
            client,
            base_url,
            deployment,
            timeout,
            logger: None,
        })
    }

    /// Create a client from resolved chat settings.
    ///
    /// When request logging is enabled the client dumps its traffic to stderr.
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let client = Self::with_options(
            config.api_key.clone(),
            Some(config.endpoint.clone()),
            config.deployment.clone(),
            config.timeout,
        )?;
        if config.log_requests {
            Ok(client.with_logger(Arc::new(StderrLogger::new())))
        } else {
            Ok(client)
        }
    }

    /// Report every request and response to `logger`.
    pub fn with_logger(mut self, logger: Arc<dyn ClientLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The URL completions for this deployment are posted to.
    pub fn completions_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                Error::url(
                    format!("endpoint {} cannot carry a path", self.base_url),
                    None,
                )
            })?
            .pop_if_empty()
            .extend([
                "openai",
                "deployments",
                self.deployment.as_str(),
                "chat",
                "completions",
            ]);
        Ok(url)
    }

    /// Create and return default headers for API requests.
    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| Error::authentication("API key contains invalid header characters"))?;
        headers.insert("api-key", api_key);
        Ok(headers)
    }

    fn request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    async fn post(&self, request: &RequestSpec<'_>) -> Result<Response> {
        if request.messages.is_empty() {
            return Err(Error::validation(
                "at least one message is required",
                Some("messages".to_string()),
            ));
        }
        let url = self.completions_url()?;
        let mut headers = self.default_headers()?;
        if request.stream {
            headers.insert(
                header::ACCEPT,
                HeaderValue::from_static("text/event-stream"),
            );
        }
        if let Some(logger) = &self.logger {
            logger.log_request(url.as_str(), request);
        }

        CLIENT_REQUESTS.click();
        let start = Instant::now();
        let mut builder = self.client.post(url).headers(headers).json(request);
        if !request.stream {
            builder = builder.timeout(self.timeout);
        }
        let result = builder.send().await;
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        result.map_err(|e| {
            CLIENT_REQUEST_ERRORS.click();
            self.request_error(e)
        })
    }

    async fn read_body(&self, response: Response) -> Result<String> {
        response.text().await.map_err(|e| {
            Error::http_client(format!("Failed to read response: {e}"), Some(Box::new(e)))
        })
    }

    async fn fail_with_status(&self, response: Response) -> Error {
        CLIENT_REQUEST_ERRORS.click();
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());
        let body = match self.read_body(response).await {
            Ok(body) => body,
            Err(err) => return err,
        };
        if let Some(logger) = &self.logger {
            logger.log_response(status.as_u16(), &body);
        }
        process_error_response(status, retry_after, &body)
    }
}

impl fmt::Debug for DialClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialClient")
            .field("base_url", &self.base_url.as_str())
            .field("deployment", &self.deployment)
            .field("timeout", &self.timeout)
            .field("logging", &self.logger.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl CompletionClient for DialClient {
    fn deployment(&self) -> &str {
        &self.deployment
    }

    async fn complete(&self, messages: &[Message]) -> Result<Message> {
        let request = RequestSpec::new(&self.deployment, messages);
        let response = self.post(&request).await?;
        if !response.status().is_success() {
            return Err(self.fail_with_status(response).await);
        }

        let status = response.status();
        let body = self.read_body(response).await?;
        if let Some(logger) = &self.logger {
            logger.log_response(status.as_u16(), &body);
        }

        let completion: ChatCompletion = serde_json::from_str(&body).map_err(|e| {
            Error::serialization(format!("Failed to parse response: {e}"), Some(Box::new(e)))
        })?;
        let content = completion
            .first_content()
            .ok_or_else(|| Error::empty_response("No choices in response found"))?;
        Ok(Message::assistant(content))
    }

    async fn complete_streaming(&self, messages: &[Message]) -> Result<FragmentStream> {
        let request = RequestSpec::streaming(&self.deployment, messages);
        let response = self.post(&request).await?;
        if !response.status().is_success() {
            return Err(self.fail_with_status(response).await);
        }

        let status = response.status();
        let frames = process_frames(response.bytes_stream());
        match self.logger.clone() {
            Some(logger) => {
                logger.log_stream_start(status.as_u16());
                let frames = frames.inspect(move |frame| match frame {
                    Ok(StreamFrame::Delta(text)) => logger.log_stream_fragment(text),
                    Ok(StreamFrame::Done) => logger.log_stream_end(true),
                    Ok(StreamFrame::Truncated) => logger.log_stream_end(false),
                    Err(_) => {}
                });
                Ok(Box::pin(text_fragments(frames)))
            }
            None => Ok(Box::pin(text_fragments(frames))),
        }
    }
}

/// Map a non-success status and its body to an error.
///
/// The body is read as `{"error": {"message", "type", "param"}}` when it has
/// that shape; otherwise the raw body becomes the message.
pub fn process_error_response(status: StatusCode, retry_after: Option<u64>, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: Option<ErrorDetail>,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        #[serde(rename = "type")]
        error_type: Option<String>,
        message: Option<String>,
        param: Option<String>,
    }

    let detail = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|parsed| parsed.error);
    let error_type = detail.as_ref().and_then(|e| e.error_type.clone());
    let error_param = detail.as_ref().and_then(|e| e.param.clone());
    let error_message = detail
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.to_string());

    match status.as_u16() {
        400 => Error::bad_request(error_message, error_param),
        401 => Error::authentication(error_message),
        403 => Error::permission(error_message),
        404 => Error::not_found(error_message),
        408 => Error::timeout(error_message, None),
        429 => Error::rate_limit(error_message, retry_after),
        500 => Error::internal_server(error_message),
        502..=504 => Error::service_unavailable(error_message, retry_after),
        status_code => Error::api(status_code, error_type, error_message),
    }
}
