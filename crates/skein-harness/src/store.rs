//! Simulated keyed store with optimistic concurrency.
//!
//! Every request is a timed wait before it touches the table, standing in
//! for the round trip to a real database. The table update itself is
//! atomic, so races show up exactly where a real client would see them:
//! between two requests.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use skein_core::Context;
use thiserror::Error;

/// Simulated latency of one request. Only the suspension matters.
pub const REQUEST_LATENCY: Duration = Duration::from_millis(5);

/// Entity tag; changes on every write of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ETag(u64);

impl ETag {
    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// Stored value and its current tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Payload.
    pub value: Bytes,
    /// Tag of the last write.
    pub etag: ETag,
}

/// Store request failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// `create` on a key that already has a row.
    #[error("row already exists: {key}")]
    RowAlreadyExists {
        /// Key.
        key: String,
    },

    /// Conditional write whose tag no longer matches.
    #[error("precondition failed for {key}: expected {expected}, found {actual:?}")]
    PreconditionFailed {
        /// Key.
        key: String,
        /// Tag the caller expected.
        expected: ETag,
        /// Current tag, if the row exists.
        actual: Option<ETag>,
    },

    /// Injected failure. The request may or may not have been applied.
    #[error("store unavailable during {request}")]
    Unavailable {
        /// Request that failed.
        request: &'static str,
    },
}

/// Keyed store API used by the code under test.
#[async_trait(?Send)]
pub trait Store {
    /// Read a row.
    async fn get(&self, key: &str) -> Result<Option<Row>, StoreError>;

    /// Insert a row. Fails with [`StoreError::RowAlreadyExists`] if the key
    /// is taken.
    async fn create(&self, key: &str, value: Bytes) -> Result<ETag, StoreError>;

    /// Insert or replace a row. With `if_match`, only replaces a row whose
    /// tag equals it.
    async fn upsert(
        &self,
        key: &str,
        value: Bytes,
        if_match: Option<ETag>,
    ) -> Result<ETag, StoreError>;
}

/// In-memory [`Store`] driven by the exploration engine.
#[derive(Debug)]
pub struct SimStore {
    cx: Context,
    rows: RefCell<BTreeMap<String, Row>>,
    next_etag: Cell<u64>,
}

impl SimStore {
    /// Empty store whose requests suspend through `cx`.
    pub fn new(cx: Context) -> Self {
        Self { cx, rows: RefCell::new(BTreeMap::new()), next_etag: Cell::new(1) }
    }

    /// Current row for `key`, read without a scheduling point. For oracles
    /// and invariants.
    pub fn peek(&self, key: &str) -> Option<Row> {
        self.rows.borrow().get(key).cloned()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    fn next_etag(&self) -> ETag {
        let tag = self.next_etag.get();
        self.next_etag.set(tag + 1);
        ETag(tag)
    }

    async fn round_trip(&self, request: &'static str, key: &str) {
        tracing::trace!(request, key, "store request");
        self.cx.delay(REQUEST_LATENCY).await;
    }
}

#[async_trait(?Send)]
impl Store for SimStore {
    async fn get(&self, key: &str) -> Result<Option<Row>, StoreError> {
        self.round_trip("get", key).await;
        Ok(self.peek(key))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<ETag, StoreError> {
        self.round_trip("create", key).await;

        if self.rows.borrow().contains_key(key) {
            return Err(StoreError::RowAlreadyExists { key: key.to_string() });
        }

        let etag = self.next_etag();
        self.rows.borrow_mut().insert(key.to_string(), Row { value, etag });
        Ok(etag)
    }

    async fn upsert(
        &self,
        key: &str,
        value: Bytes,
        if_match: Option<ETag>,
    ) -> Result<ETag, StoreError> {
        self.round_trip("upsert", key).await;

        if let Some(expected) = if_match {
            let actual = self.rows.borrow().get(key).map(|row| row.etag);
            if actual != Some(expected) {
                return Err(StoreError::PreconditionFailed {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }

        let etag = self.next_etag();
        self.rows.borrow_mut().insert(key.to_string(), Row { value, etag });
        Ok(etag)
    }
}

/// Wraps a store and fails a share of requests, chosen by the strategy.
///
/// A failing request is either dropped before it reaches the inner store or
/// applied and then reported as failed (a lost acknowledgement). Both
/// decisions are recorded choices, so a failing trace replays the same
/// faults.
#[derive(Debug)]
pub struct ChaoticStore<S> {
    inner: S,
    cx: Context,
    failure_percent: u64,
}

impl<S: Store> ChaoticStore<S> {
    /// Wrap `inner`, failing roughly `failure_percent` percent of requests.
    pub fn new(inner: S, cx: Context, failure_percent: u64) -> Self {
        Self { inner, cx, failure_percent: failure_percent.min(100) }
    }

    /// Wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.failure_percent > 0 && self.cx.choose_integer(100) < self.failure_percent
    }

    async fn inject<T>(
        &self,
        request: &'static str,
        forward: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        if !self.should_fail() {
            return forward.await;
        }

        if self.cx.choose_boolean() {
            // Lost acknowledgement; the outcome is discarded either way.
            let _ = forward.await;
            tracing::trace!(request, "injected failure after apply");
        } else {
            self.cx.delay(REQUEST_LATENCY).await;
            tracing::trace!(request, "injected failure before apply");
        }
        Err(StoreError::Unavailable { request })
    }
}

#[async_trait(?Send)]
impl<S: Store> Store for ChaoticStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Row>, StoreError> {
        self.inject("get", self.inner.get(key)).await
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<ETag, StoreError> {
        self.inject("create", self.inner.create(key, value)).await
    }

    async fn upsert(
        &self,
        key: &str,
        value: Bytes,
        if_match: Option<ETag>,
    ) -> Result<ETag, StoreError> {
        self.inject("upsert", self.inner.upsert(key, value, if_match)).await
    }
}
