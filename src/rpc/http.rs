//! JSON over HTTP transport for [`WorkqueueService`].
//!
//! `POST /process` takes a [`ProcessRequest`], `POST /state` a
//! [`GetKeyStateRequest`]. Failures answer with the HTTP status matching the
//! error's [`Code`] and the [`ServiceError`] itself as the body, so
//! [`NoRetryDetails`](crate::queue::NoRetryDetails) survive the hop.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{
    Code, GetKeyStateRequest, ProcessRequest, ProcessResponse, ServiceError, WorkqueueService,
};
use crate::queue::KeyState;

type ServiceState = Arc<dyn WorkqueueService>;

/// Serves `service` on `/process` and `/state`.
pub fn service_router(service: Arc<dyn WorkqueueService>) -> Router {
    Router::new()
        .route("/process", post(process))
        .route("/state", post(key_state))
        .with_state(service)
}

async fn process(
    State(service): State<ServiceState>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    reply(service.process(request).await)
}

async fn key_state(
    State(service): State<ServiceState>,
    Json(request): Json<GetKeyStateRequest>,
) -> Response {
    reply(service.get_key_state(request).await)
}

fn reply<T: Serialize>(result: Result<T, ServiceError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => (status_for(err.code), Json(err)).into_response(),
    }
}

const fn status_for(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn code_for(status: StatusCode) -> Code {
    match status.as_u16() {
        400 | 422 => Code::InvalidArgument,
        404 => Code::NotFound,
        502..=504 => Code::Unavailable,
        _ => Code::Internal,
    }
}

/// [`WorkqueueService`] client for a peer serving [`service_router`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base: String,
}

impl HttpClient {
    /// Client for the service at `base` (e.g. `http://worker:8080`).
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(request)
            .send()
            .await
            .map_err(|err| ServiceError::new(Code::Unavailable, err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| ServiceError::internal(format!("malformed response: {err}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(serde_json::from_str::<ServiceError>(&body)
            .unwrap_or_else(|_| ServiceError::new(code_for(status), format!("{status}: {body}"))))
    }
}

#[async_trait]
impl WorkqueueService for HttpClient {
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ServiceError> {
        self.call("/process", &request).await
    }

    async fn get_key_state(&self, request: GetKeyStateRequest) -> Result<KeyState, ServiceError> {
        self.call("/state", &request).await
    }
}
