//! In-memory document store.
//!
//! Behaves like the remote store as far as this crate can observe: ETags
//! change on every write, conditional writes are honored, queries page with
//! opaque continuation tokens, and time is read from a store clock that tests
//! can move forward. Faults can be queued per operation to simulate throttling
//! and transient failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::client::{
    ClientError, CollectionLink, CollectionSettings, Document, DocumentClient, DocumentQuery,
    QueryPage, StoredDocument, StoredProcedure,
};

/// Operations that can be targeted by fault injection and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DatabaseExists,
    CreateDatabase,
    CreateCollection,
    ReadCollection,
    ReplaceCollection,
    ReadStoredProcedure,
    UpsertStoredProcedure,
    ReadDocument,
    CreateDocument,
    ReplaceDocument,
    UpsertDocument,
    DeleteDocument,
    QueryDocuments,
    ServerTime,
}

#[derive(Debug, Default)]
struct MemoryCollection {
    settings: Option<CollectionSettings>,
    documents: BTreeMap<(String, String), StoredDocument>,
    procedures: BTreeMap<String, StoredProcedure>,
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: HashMap<String, Option<u32>>,
    collections: HashMap<CollectionLink, MemoryCollection>,
    etag_counter: u64,
    clock_offset: TimeDelta,
    faults: HashMap<OperationKind, VecDeque<ClientError>>,
    request_counts: HashMap<OperationKind, u64>,
    lost_acks: Vec<(OperationKind, String)>,
}

impl MemoryState {
    fn begin(&mut self, kind: OperationKind) -> Result<(), ClientError> {
        *self.request_counts.entry(kind).or_default() += 1;
        match self.faults.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Reports an applied write as transient if its acknowledgement was
    /// marked to be lost.
    fn acknowledge(
        &mut self,
        kind: OperationKind,
        stored: StoredDocument,
    ) -> Result<StoredDocument, ClientError> {
        let lost = self
            .lost_acks
            .iter()
            .position(|(k, id)| *k == kind && *id == stored.id);
        match lost {
            Some(index) => {
                self.lost_acks.remove(index);
                Err(ClientError::Transient(format!(
                    "connection reset after writing {}",
                    stored.id
                )))
            }
            None => Ok(stored),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("\"{:08x}\"", self.etag_counter)
    }

    fn collection(&self, link: &CollectionLink) -> Result<&MemoryCollection, ClientError> {
        self.collections
            .get(link)
            .filter(|c| c.settings.is_some())
            .ok_or_else(|| ClientError::CollectionMissing(link.to_string()))
    }

    fn collection_mut(
        &mut self,
        link: &CollectionLink,
    ) -> Result<&mut MemoryCollection, ClientError> {
        self.collections
            .get_mut(link)
            .filter(|c| c.settings.is_some())
            .ok_or_else(|| ClientError::CollectionMissing(link.to_string()))
    }

    fn store(&mut self, link: &CollectionLink, document: Document) -> Result<StoredDocument, ClientError> {
        let stored = StoredDocument {
            id: document.id,
            partition_key: document.partition_key,
            body: document.body,
            etag: self.next_etag(),
            timestamp: self.now(),
        };
        let key = (stored.partition_key.clone(), stored.id.clone());
        self.collection_mut(link)?
            .documents
            .insert(key, stored.clone());
        Ok(stored)
    }
}

/// An in-process [`DocumentClient`].
///
/// Cloning shares the underlying state, so several "processes" can be
/// simulated by handing clones to independent components.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentClient {
    state: Arc<Mutex<MemoryState>>,
    latency: Option<Duration>,
}

impl InMemoryDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request by `latency`, letting concurrent callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Moves the store clock forward.
    pub fn advance_clock(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        let mut state = self.state.lock();
        state.clock_offset += delta;
    }

    /// Makes the next request of `kind` fail with `error`.
    pub fn inject_fault(&self, kind: OperationKind, error: ClientError) {
        self.inject_faults(kind, error, 1);
    }

    /// Makes the next `times` requests of `kind` fail with `error`.
    pub fn inject_faults(&self, kind: OperationKind, error: ClientError, times: usize) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(kind).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Applies the next successful write of `kind` to `document_id`, then
    /// fails it with [`ClientError::Transient`] as if the reply was lost.
    pub fn lose_acknowledgement(&self, kind: OperationKind, document_id: impl Into<String>) {
        self.state.lock().lost_acks.push((kind, document_id.into()));
    }

    /// Drops any queued faults.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.lost_acks.clear();
    }

    /// Number of requests of `kind` received so far, failed ones included.
    pub fn request_count(&self, kind: OperationKind) -> u64 {
        self.state
            .lock()
            .request_counts
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Number of documents currently held by `collection`.
    pub fn document_count(&self, collection: &CollectionLink) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.documents.len())
            .unwrap_or_default()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn encode_continuation(partition_key: &str, id: &str) -> String {
    let raw = serde_json::json!([partition_key, id]).to_string();
    URL_SAFE_NO_PAD.encode(raw)
}

fn decode_continuation(token: &str) -> Result<(String, String), ClientError> {
    let invalid = || ClientError::Fatal(format!("invalid continuation token: {token}"));
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    let (pk, id): (String, String) = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
    Ok((pk, id))
}

#[async_trait]
impl DocumentClient for InMemoryDocumentClient {
    async fn database_exists(&self, database_id: &str) -> Result<bool, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::DatabaseExists)?;
        Ok(state.databases.contains_key(database_id))
    }

    async fn create_database_if_not_exists(
        &self,
        database_id: &str,
        throughput: Option<u32>,
    ) -> Result<bool, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::CreateDatabase)?;
        if state.databases.contains_key(database_id) {
            return Ok(false);
        }
        state.databases.insert(database_id.to_string(), throughput);
        Ok(true)
    }

    async fn create_collection_if_not_exists(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<bool, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::CreateCollection)?;
        if !state.databases.contains_key(&collection.database_id) {
            return Err(ClientError::Fatal(format!(
                "database {} does not exist",
                collection.database_id
            )));
        }
        let entry = state.collections.entry(collection.clone()).or_default();
        if entry.settings.is_some() {
            return Ok(false);
        }
        entry.settings = Some(settings.clone());
        Ok(true)
    }

    async fn read_collection(
        &self,
        collection: &CollectionLink,
    ) -> Result<Option<CollectionSettings>, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ReadCollection)?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.settings.clone()))
    }

    async fn replace_collection(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<(), ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ReplaceCollection)?;
        let entry = state.collection_mut(collection)?;
        if entry.settings.as_ref().map(|s| &s.partition_key_path) != Some(&settings.partition_key_path)
        {
            return Err(ClientError::Fatal(
                "partition key path cannot be changed".to_string(),
            ));
        }
        entry.settings = Some(settings.clone());
        Ok(())
    }

    async fn read_stored_procedure(
        &self,
        collection: &CollectionLink,
        id: &str,
    ) -> Result<Option<StoredProcedure>, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ReadStoredProcedure)?;
        Ok(state.collection(collection)?.procedures.get(id).cloned())
    }

    async fn upsert_stored_procedure(
        &self,
        collection: &CollectionLink,
        procedure: &StoredProcedure,
    ) -> Result<(), ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::UpsertStoredProcedure)?;
        state
            .collection_mut(collection)?
            .procedures
            .insert(procedure.id.clone(), procedure.clone());
        Ok(())
    }

    async fn read_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ReadDocument)?;
        Ok(state
            .collection(collection)?
            .documents
            .get(&(partition_key.to_string(), id.to_string()))
            .cloned())
    }

    async fn create_document(
        &self,
        collection: &CollectionLink,
        document: Document,
    ) -> Result<StoredDocument, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::CreateDocument)?;
        let key = (document.partition_key.clone(), document.id.clone());
        if state.collection(collection)?.documents.contains_key(&key) {
            return Err(ClientError::Conflict);
        }
        let stored = state.store(collection, document)?;
        state.acknowledge(OperationKind::CreateDocument, stored)
    }

    async fn replace_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ReplaceDocument)?;
        let key = (document.partition_key.clone(), document.id.clone());
        let Some(existing) = state.collection(collection)?.documents.get(&key) else {
            return Err(ClientError::NotFound);
        };
        if let Some(expected) = if_match {
            if existing.etag != expected {
                return Err(ClientError::PreconditionFailed);
            }
        }
        let stored = state.store(collection, document)?;
        state.acknowledge(OperationKind::ReplaceDocument, stored)
    }

    async fn upsert_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::UpsertDocument)?;
        if let Some(expected) = if_match {
            let key = (document.partition_key.clone(), document.id.clone());
            let existing = state.collection(collection)?.documents.get(&key);
            if existing.map(|d| d.etag.as_str()) != Some(expected) {
                return Err(ClientError::PreconditionFailed);
            }
        }
        let stored = state.store(collection, document)?;
        state.acknowledge(OperationKind::UpsertDocument, stored)
    }

    async fn delete_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::DeleteDocument)?;
        let key = (partition_key.to_string(), id.to_string());
        let documents = &mut state.collection_mut(collection)?.documents;
        let Some(existing) = documents.get(&key) else {
            return Err(ClientError::NotFound);
        };
        if let Some(expected) = if_match {
            if existing.etag != expected {
                return Err(ClientError::PreconditionFailed);
            }
        }
        documents.remove(&key);
        Ok(())
    }

    async fn query_documents(
        &self,
        collection: &CollectionLink,
        query: &DocumentQuery,
        continuation: Option<&str>,
        max_items: usize,
    ) -> Result<QueryPage, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::QueryDocuments)?;
        let after = continuation.map(decode_continuation).transpose()?;
        let max_items = max_items.max(1);

        let mut matching = state
            .collection(collection)?
            .documents
            .iter()
            .filter(|(key, _)| after.as_ref().is_none_or(|after| *key > after))
            .filter(|(_, doc)| query.matches(&doc.partition_key, &doc.body))
            .map(|(_, doc)| doc);

        let documents: Vec<StoredDocument> = matching.by_ref().take(max_items).cloned().collect();
        let continuation = match (matching.next(), documents.last()) {
            (Some(_), Some(last)) => Some(encode_continuation(&last.partition_key, &last.id)),
            _ => None,
        };

        Ok(QueryPage {
            documents,
            continuation,
        })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ClientError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(OperationKind::ServerTime)?;
        Ok(state.now())
    }
}
