//! Remote document store consumed by the sync queue.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Why a remote call failed. Permanent kinds are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Network,
    Timeout,
    Unavailable,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    InvalidRequest,
}

impl RemoteErrorKind {
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::Unauthenticated
                | Self::ResourceExhausted
                | Self::InvalidRequest
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::PermissionDenied => "permission-denied",
            Self::Unauthenticated => "unauthenticated",
            Self::ResourceExhausted => "resource-exhausted",
            Self::InvalidRequest => "invalid-request",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }

    /// Map an HTTP failure status to an error kind.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        let kind = match status.as_u16() {
            400 | 404 | 409 | 422 => RemoteErrorKind::InvalidRequest,
            401 => RemoteErrorKind::Unauthenticated,
            403 => RemoteErrorKind::PermissionDenied,
            408 => RemoteErrorKind::Timeout,
            413 | 429 | 507 => RemoteErrorKind::ResourceExhausted,
            _ => RemoteErrorKind::Unavailable,
        };
        Self::new(kind, format!("HTTP {}: {message}", status.as_u16()))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            RemoteErrorKind::Timeout
        } else if e.is_decode() {
            RemoteErrorKind::InvalidRequest
        } else {
            RemoteErrorKind::Network
        };
        Self::new(kind, e.to_string())
    }
}

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Documents keyed by user and collection.
pub trait RemoteStore: Send + Sync {
    fn write<'a>(
        &'a self,
        user_id: &'a str,
        collection: &'a str,
        document: &'a Value,
    ) -> RemoteFuture<'a, ()>;

    fn read<'a>(&'a self, user_id: &'a str, collection: &'a str) -> RemoteFuture<'a, Option<Value>>;
}

/// JSON over HTTP: `PUT`/`GET {base}/users/{user}/{collection}`.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, user_id: &str, collection: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, user_id, collection)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    fn write<'a>(
        &'a self,
        user_id: &'a str,
        collection: &'a str,
        document: &'a Value,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let resp = self
                .authorized(self.client.put(self.url(user_id, collection)))
                .json(document)
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let message = resp.text().await.unwrap_or_default();
                return Err(RemoteError::from_status(status, message));
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, user_id: &'a str, collection: &'a str) -> RemoteFuture<'a, Option<Value>> {
        Box::pin(async move {
            let resp = self
                .authorized(self.client.get(self.url(user_id, collection)))
                .send()
                .await?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                let status = resp.status();
                let message = resp.text().await.unwrap_or_default();
                return Err(RemoteError::from_status(status, message));
            }
            Ok(Some(resp.json().await?))
        })
    }
}

/// In-process remote, for offline use and tests. Failures can be queued up
/// and are returned by the next writes in order.
#[derive(Default)]
pub struct MemoryRemoteStore {
    documents: Mutex<HashMap<(String, String), Value>>,
    failures: Mutex<Vec<RemoteErrorKind>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `kind`.
    pub fn fail_next(&self, kind: RemoteErrorKind, count: usize) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.extend(std::iter::repeat(kind).take(count));
    }

    /// `(user, collection)` of every successful write, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn document(&self, user_id: &str, collection: &str) -> Option<Value> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user_id.to_string(), collection.to_string()))
            .cloned()
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn write<'a>(
        &'a self,
        user_id: &'a str,
        collection: &'a str,
        document: &'a Value,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let failure = {
                let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
                (!failures.is_empty()).then(|| failures.remove(0))
            };
            if let Some(kind) = failure {
                return Err(RemoteError::new(kind, "injected failure"));
            }
            let key = (user_id.to_string(), collection.to_string());
            self.documents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.clone(), document.clone());
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(key);
            Ok(())
        })
    }

    fn read<'a>(&'a self, user_id: &'a str, collection: &'a str) -> RemoteFuture<'a, Option<Value>> {
        Box::pin(async move { Ok(self.document(user_id, collection)) })
    }
}
