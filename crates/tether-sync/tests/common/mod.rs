//! Shared fixtures for tether-sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use tether_core::PersistableEntity;
use tether_db::{Database, DbConfig};
use tether_sync::{JsonDecoder, Ledger, SyncError, SyncResult, Transport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    #[serde(rename = "objID")]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub views: i64,
}

impl PersistableEntity for Article {}

/// In-process transport serving canned bodies by URL.
///
/// URLs registered with [`MockTransport::gate`] block until
/// [`MockTransport::release`] is called, after signalling `entered`.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    gated: Mutex<Vec<String>>,
    requests: Mutex<Vec<String>>,
    pub entered: Notify,
    released: Notify,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, body: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string().into_bytes());
    }

    pub fn respond_raw(&self, url: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    pub fn gate(&self, url: &str) {
        self.gated.lock().unwrap().push(url.to_string());
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_bytes(&self, url: &str) -> SyncResult<Vec<u8>> {
        self.requests.lock().unwrap().push(url.to_string());

        let gated = self.gated.lock().unwrap().iter().any(|g| g == url);
        if gated {
            self.entered.notify_one();
            self.released.notified().await;
        }

        let body = self.responses.lock().unwrap().get(url).cloned();
        body.ok_or_else(|| SyncError::Network {
            url: url.to_string(),
            status: Some(404),
            reason: "Not Found".to_string(),
        })
    }
}

pub async fn ledger_with(transport: Arc<MockTransport>) -> Ledger {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    Ledger::with_parts(Arc::new(db), transport, Arc::new(JsonDecoder)).unwrap()
}

pub async fn ledger() -> Ledger {
    ledger_with(MockTransport::new()).await
}

pub fn fields(value: serde_json::Value) -> tether_core::FieldMap {
    value.as_object().cloned().unwrap()
}
