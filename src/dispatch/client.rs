use anyhow::{Result, anyhow};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::model::{ExecutionRequest, ExecutionResult, HealthCheckRequest, HealthCheckResponse};

pub type ResultStream = BoxStream<'static, Result<ExecutionResult>>;

/// The worker-facing half of the protocol.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Start `ExecuteDagPart` on the processor at `address`.
    ///
    /// The returned stream yields results as the processor produces them and
    /// ends when the processor closes it.
    async fn execute_dag_part(&self, address: &str, request: ExecutionRequest)
    -> Result<ResultStream>;

    async fn health_check(
        &self,
        address: &str,
        request: HealthCheckRequest,
    ) -> Result<HealthCheckResponse>;
}

/// JSON over HTTP; `execute_dag_part` answers with newline-delimited JSON.
#[derive(Clone, Default)]
pub struct HttpProcessorClient {
    client: reqwest::Client,
}

impl HttpProcessorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn execute_dag_part(
        &self,
        address: &str,
        request: ExecutionRequest,
    ) -> Result<ResultStream> {
        let url = format!("{}/execute_dag_part", address.trim_end_matches('/'));
        let response = self.client.post(url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("execute_dag_part returned {status}: {text}"));
        }

        Ok(ndjson_results(response.bytes_stream()).boxed())
    }

    async fn health_check(
        &self,
        address: &str,
        request: HealthCheckRequest,
    ) -> Result<HealthCheckResponse> {
        let url = format!("{}/health_check", address.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Split a byte stream into lines and decode each non-blank line.
pub fn ndjson_results<S, B, E>(bytes: S) -> impl Stream<Item = Result<ExecutionResult>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(chunk.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(item) = decode_line(&line)? {
                    yield item;
                }
            }
        }

        if let Some(item) = decode_line(&buf)? {
            yield item;
        }
    }
}

fn decode_line(line: &[u8]) -> Result<Option<ExecutionResult>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(line)?))
}
