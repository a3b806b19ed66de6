//! Scripted in-memory remote for engine and scheduler tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::models::{HttpMethod, ResourceKind};
use crate::remote::{RemoteApi, RemoteRequest, RemoteResponse, TransportError, TransportResult};

#[derive(Default)]
pub struct MockRemote {
    no_credential: AtomicBool,
    unreachable: AtomicBool,
    records: Mutex<HashMap<ResourceKind, Vec<serde_json::Value>>>,
    fetch_failures: Mutex<HashMap<ResourceKind, TransportError>>,
    send_failure: Mutex<Option<TransportError>>,
    path_failures: Mutex<HashMap<String, TransportError>>,
    /// Failures keyed by 1-based send number
    numbered_failures: Mutex<HashMap<usize, TransportError>>,
    response_updated_at: Mutex<Option<i64>>,
    fetches: Mutex<Vec<(ResourceKind, Option<i64>)>>,
    sent: Mutex<Vec<RemoteRequest>>,
    created: AtomicUsize,
    probes: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_credential(&self, present: bool) {
        self.no_credential.store(!present, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_records(&self, kind: ResourceKind, records: Vec<serde_json::Value>) {
        self.records.lock().unwrap().insert(kind, records);
    }

    pub fn fail_fetch(&self, kind: ResourceKind, error: TransportError) {
        self.fetch_failures.lock().unwrap().insert(kind, error);
    }

    /// Every send fails with `error`
    pub fn fail_sends(&self, error: TransportError) {
        *self.send_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_path(&self, path: &str, error: TransportError) {
        self.path_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), error);
    }

    /// Only the `nth` send (1-based) fails with `error`
    pub fn fail_send_number(&self, nth: usize, error: TransportError) {
        self.numbered_failures.lock().unwrap().insert(nth, error);
    }

    /// Write responses carry this server `updated_at`
    pub fn stamp_responses(&self, updated_at: i64) {
        *self.response_updated_at.lock().unwrap() = Some(updated_at);
    }

    pub fn fetches(&self) -> Vec<(ResourceKind, Option<i64>)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<RemoteRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|request| request.path)
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    fn has_credential(&self) -> bool {
        !self.no_credential.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.unreachable.load(Ordering::SeqCst)
    }

    async fn fetch_since(
        &self,
        kind: ResourceKind,
        since: Option<i64>,
        _timeout: Duration,
    ) -> TransportResult<Vec<serde_json::Value>> {
        self.fetches.lock().unwrap().push((kind, since));
        if let Some(error) = self.fetch_failures.lock().unwrap().get(&kind) {
            return Err(error.clone());
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    /// Echoes the body back; creates get ids `srv-1`, `srv-2`, ...
    async fn send(&self, request: RemoteRequest) -> TransportResult<RemoteResponse> {
        let send_number = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(request.clone());
            sent.len()
        };
        if let Some(error) = self.numbered_failures.lock().unwrap().get(&send_number) {
            return Err(error.clone());
        }
        if let Some(error) = self.path_failures.lock().unwrap().get(&request.path) {
            return Err(error.clone());
        }
        if let Some(error) = self.send_failure.lock().unwrap().clone() {
            return Err(error);
        }

        let id = if request.method == HttpMethod::Post {
            format!("srv-{}", self.created.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            request
                .path
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        };
        let updated_at = *self.response_updated_at.lock().unwrap();
        let body = match (request.method, request.body) {
            (HttpMethod::Delete, _) => None,
            (_, body) => {
                let mut object = match body {
                    Some(serde_json::Value::Object(object)) => object,
                    _ => serde_json::Map::new(),
                };
                object.insert("id".to_string(), json!(id));
                if let Some(updated_at) = updated_at {
                    object.insert("updated_at".to_string(), json!(updated_at));
                }
                Some(serde_json::Value::Object(object))
            }
        };

        Ok(RemoteResponse {
            status: if body.is_some() { 200 } else { 204 },
            body,
        })
    }

    async fn get(
        &self,
        path_and_query: &str,
        _timeout: Duration,
    ) -> TransportResult<serde_json::Value> {
        let (kind, _) = ResourceKind::from_path(path_and_query).ok_or_else(|| {
            TransportError::Status {
                status: 404,
                message: format!("no route for {path_and_query}"),
            }
        })?;
        Ok(serde_json::Value::Array(
            self.records
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or_default(),
        ))
    }
}
