use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stork_types::api::{
    ChunkResponse, ErrorResponse, FinalizeRequest, FinalizeResponse, HandshakeRequest,
    HandshakeResponse, InfoResponse, InitTransferRequest, InitTransferResponse, paths,
};

use crate::TransferError;

/// Request/response channel to one peer. Every method maps to one call of
/// the wire contract; failures come back already classified.
pub trait Transport: Send + Sync {
    fn info(&self) -> impl Future<Output = Result<InfoResponse, TransferError>> + Send;

    fn handshake(
        &self,
        req: HandshakeRequest,
    ) -> impl Future<Output = Result<HandshakeResponse, TransferError>> + Send;

    fn init_transfer(
        &self,
        req: InitTransferRequest,
    ) -> impl Future<Output = Result<InitTransferResponse, TransferError>> + Send;

    /// `envelope` is an encoded [`stork_crypto::ChunkEnvelope`].
    fn send_chunk(
        &self,
        envelope: Vec<u8>,
    ) -> impl Future<Output = Result<ChunkResponse, TransferError>> + Send;

    fn finalize(
        &self,
        req: FinalizeRequest,
    ) -> impl Future<Output = Result<FinalizeResponse, TransferError>> + Send;
}

/// HTTP transport over `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    /// `initTransfer` can block on a pending approval.
    init_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, request_timeout: Duration, init_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransferError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            init_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, TransferError> {
        let resp = self
            .client
            .post(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}

fn transport_error(e: reqwest::Error) -> TransferError {
    TransferError::Transport(e.to_string())
}

async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, TransferError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<R>()
            .await
            .map_err(|e| TransferError::Protocol(format!("bad response body: {e}")));
    }
    let body = resp.json::<ErrorResponse>().await.ok();
    Err(TransferError::from_response(status.as_u16(), body))
}

impl Transport for HttpTransport {
    async fn info(&self) -> Result<InfoResponse, TransferError> {
        let resp = self
            .client
            .get(self.url(paths::INFO))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }

    async fn handshake(&self, req: HandshakeRequest) -> Result<HandshakeResponse, TransferError> {
        self.post_json(paths::HANDSHAKE, &req, self.request_timeout).await
    }

    async fn init_transfer(&self, req: InitTransferRequest) -> Result<InitTransferResponse, TransferError> {
        self.post_json(paths::INIT_TRANSFER, &req, self.init_timeout).await
    }

    async fn send_chunk(&self, envelope: Vec<u8>) -> Result<ChunkResponse, TransferError> {
        let resp = self
            .client
            .post(self.url(paths::CHUNK))
            .timeout(self.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(envelope)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }

    async fn finalize(&self, req: FinalizeRequest) -> Result<FinalizeResponse, TransferError> {
        self.post_json(paths::FINALIZE, &req, self.request_timeout).await
    }
}
