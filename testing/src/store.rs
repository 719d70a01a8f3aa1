//! In-memory transactional store with optimistic concurrency.
//!
//! Every document carries a version. A transaction remembers the version of each
//! document it read and buffers its writes; `commit` validates all remembered
//! versions under one lock and applies the writes only if none changed. That is
//! the same contract `PostgresStore` provides, so allocator and lease code can be
//! exercised under real contention without a database.
//!
//! Reads yield to the scheduler, so concurrently spawned operations interleave
//! between read and commit the way they would against a remote store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use voucher_core::event::Event;
use voucher_core::ids::{EventId, VoucherId};
use voucher_core::store::{
    Collection, StoreError, StoreFuture, Transaction, TransactionalStore,
};
use voucher_core::voucher::Voucher;

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    doc: T,
}

#[derive(Debug, Default)]
struct Documents {
    events: HashMap<EventId, Versioned<Event>>,
    vouchers: HashMap<VoucherId, Versioned<Voucher>>,
    codes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: Mutex<Documents>,
    commit_faults: Mutex<VecDeque<StoreError>>,
    begin_faults: Mutex<VecDeque<StoreError>>,
    commits: AtomicU64,
    conflicts: AtomicU64,
    aborts: AtomicU64,
}

impl Inner {
    fn docs(&self) -> Result<MutexGuard<'_, Documents>, StoreError> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store poisoned".to_string()))
    }

    fn next_fault(queue: &Mutex<VecDeque<StoreError>>) -> Option<StoreError> {
        queue.lock().ok().and_then(|mut q| q.pop_front())
    }
}

/// In-memory [`TransactionalStore`] for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use voucher_testing::InMemoryStore;
/// use voucher_core::event::Event;
/// use chrono::Utc;
///
/// let store = InMemoryStore::new();
/// let event = Event::new("Demo", 10, Utc::now());
/// let id = event.id;
/// store.seed_event(event);
/// assert_eq!(store.event(id).map(|e| e.capacity), Some(10));
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event directly, bypassing transactions.
    pub fn seed_event(&self, event: Event) {
        if let Ok(mut docs) = self.inner.docs() {
            docs.events.insert(event.id, Versioned { version: 1, doc: event });
        }
    }

    /// Current committed state of an event.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<Event> {
        self.inner
            .docs()
            .ok()
            .and_then(|docs| docs.events.get(&id).map(|v| v.doc.clone()))
    }

    /// Current committed state of a voucher.
    #[must_use]
    pub fn voucher(&self, id: VoucherId) -> Option<Voucher> {
        self.inner
            .docs()
            .ok()
            .and_then(|docs| docs.vouchers.get(&id).map(|v| v.doc.clone()))
    }

    /// Every committed voucher for `event_id`.
    #[must_use]
    pub fn vouchers_for(&self, event_id: EventId) -> Vec<Voucher> {
        self.inner
            .docs()
            .map(|docs| {
                docs.vouchers
                    .values()
                    .filter(|v| v.doc.event_id == event_id)
                    .map(|v| v.doc.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make the next `commit` fail with `error` instead of applying its writes.
    ///
    /// Queued faults are consumed in order, one per commit.
    pub fn fail_next_commit(&self, error: StoreError) {
        if let Ok(mut faults) = self.inner.commit_faults.lock() {
            faults.push_back(error);
        }
    }

    /// Make the next `times` commits fail with `error`.
    pub fn fail_next_commits(&self, times: usize, error: &StoreError) {
        for _ in 0..times {
            self.fail_next_commit(error.clone());
        }
    }

    /// Make the next `begin` fail with `error`.
    pub fn fail_next_begin(&self, error: StoreError) {
        if let Ok(mut faults) = self.inner.begin_faults.lock() {
            faults.push_back(error);
        }
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of commits rejected with a conflict (real or injected).
    #[must_use]
    pub fn conflicts(&self) -> u64 {
        self.inner.conflicts.load(Ordering::SeqCst)
    }

    /// Number of explicit aborts.
    #[must_use]
    pub fn aborts(&self) -> u64 {
        self.inner.aborts.load(Ordering::SeqCst)
    }
}

enum Write<T> {
    Insert(T),
    Update(T),
}

struct InMemoryTransaction {
    inner: Arc<Inner>,
    /// Version observed per document; 0 means "absent when read".
    event_reads: HashMap<EventId, u64>,
    voucher_reads: HashMap<VoucherId, u64>,
    event_writes: HashMap<EventId, Write<Event>>,
    voucher_writes: HashMap<VoucherId, Write<Voucher>>,
}

impl InMemoryTransaction {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            event_reads: HashMap::new(),
            voucher_reads: HashMap::new(),
            event_writes: HashMap::new(),
            voucher_writes: HashMap::new(),
        }
    }

    fn read_event(&mut self, id: EventId) -> Result<Option<Event>, StoreError> {
        if let Some(Write::Insert(event) | Write::Update(event)) = self.event_writes.get(&id) {
            return Ok(Some(event.clone()));
        }
        let docs = self.inner.docs()?;
        let found = docs.events.get(&id);
        self.event_reads
            .entry(id)
            .or_insert_with(|| found.map_or(0, |v| v.version));
        Ok(found.map(|v| v.doc.clone()))
    }

    fn read_voucher(&mut self, id: VoucherId) -> Result<Option<Voucher>, StoreError> {
        if let Some(Write::Insert(voucher) | Write::Update(voucher)) = self.voucher_writes.get(&id)
        {
            return Ok(Some(voucher.clone()));
        }
        let docs = self.inner.docs()?;
        let found = docs.vouchers.get(&id);
        self.voucher_reads
            .entry(id)
            .or_insert_with(|| found.map_or(0, |v| v.version));
        Ok(found.map(|v| v.doc.clone()))
    }

    fn validate(&self, docs: &Documents) -> Result<(), StoreError> {
        for (id, seen) in &self.event_reads {
            let current = docs.events.get(id).map_or(0, |v| v.version);
            if current != *seen {
                return Err(StoreError::WriteConflict {
                    collection: Collection::Events,
                    id: id.to_string(),
                });
            }
        }
        for (id, seen) in &self.voucher_reads {
            let current = docs.vouchers.get(id).map_or(0, |v| v.version);
            if current != *seen {
                return Err(StoreError::WriteConflict {
                    collection: Collection::Vouchers,
                    id: id.to_string(),
                });
            }
        }

        for (id, write) in &self.event_writes {
            let exists = docs.events.contains_key(id);
            match write {
                Write::Insert(_) if exists => {
                    return Err(StoreError::DuplicateKey {
                        collection: Collection::Events,
                        field: "id",
                        value: id.to_string(),
                    });
                }
                Write::Update(_) if !exists => {
                    return Err(StoreError::MissingDocument {
                        collection: Collection::Events,
                        id: id.to_string(),
                    });
                }
                _ => {}
            }
        }

        let mut staged_codes = HashSet::new();
        for (id, write) in &self.voucher_writes {
            match write {
                Write::Insert(voucher) => {
                    if docs.vouchers.contains_key(id) {
                        return Err(StoreError::DuplicateKey {
                            collection: Collection::Vouchers,
                            field: "id",
                            value: id.to_string(),
                        });
                    }
                    let code = voucher.code.as_str();
                    if docs.codes.contains(code) || !staged_codes.insert(code) {
                        return Err(StoreError::DuplicateKey {
                            collection: Collection::Vouchers,
                            field: "code",
                            value: code.to_string(),
                        });
                    }
                }
                Write::Update(_) if !docs.vouchers.contains_key(id) => {
                    return Err(StoreError::MissingDocument {
                        collection: Collection::Vouchers,
                        id: id.to_string(),
                    });
                }
                Write::Update(_) => {}
            }
        }
        Ok(())
    }

    fn apply(self, docs: &mut Documents) {
        for (id, write) in self.event_writes {
            match write {
                Write::Insert(doc) => {
                    docs.events.insert(id, Versioned { version: 1, doc });
                }
                Write::Update(doc) => {
                    if let Some(entry) = docs.events.get_mut(&id) {
                        entry.version += 1;
                        entry.doc = doc;
                    }
                }
            }
        }
        for (id, write) in self.voucher_writes {
            match write {
                Write::Insert(doc) => {
                    docs.codes.insert(doc.code.as_str().to_string());
                    docs.vouchers.insert(id, Versioned { version: 1, doc });
                }
                Write::Update(doc) => {
                    if let Some(entry) = docs.vouchers.get_mut(&id) {
                        entry.version += 1;
                        entry.doc = doc;
                    }
                }
            }
        }
    }

    fn try_commit(self) -> Result<(), StoreError> {
        let inner = Arc::clone(&self.inner);
        if let Some(fault) = Inner::next_fault(&inner.commit_faults) {
            if fault.is_transient() {
                inner.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            return Err(fault);
        }

        let mut docs = inner.docs()?;
        if let Err(err) = self.validate(&docs) {
            if err.is_transient() {
                inner.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            tracing::debug!(error = %err, "In-memory commit rejected");
            return Err(err);
        }
        self.apply(&mut docs);
        drop(docs);
        inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Transaction for InMemoryTransaction {
    fn get_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let found = self.read_event(id);
            tokio::task::yield_now().await;
            found
        })
    }

    fn get_voucher(&mut self, id: VoucherId) -> StoreFuture<'_, Option<Voucher>> {
        Box::pin(async move {
            let found = self.read_voucher(id);
            tokio::task::yield_now().await;
            found
        })
    }

    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        self.event_writes.insert(event.id, Write::Insert(event));
        Box::pin(async { Ok(()) })
    }

    fn insert_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()> {
        self.voucher_writes.insert(voucher.id, Write::Insert(voucher));
        Box::pin(async { Ok(()) })
    }

    fn update_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        let id = event.id;
        let write = match self.event_writes.remove(&id) {
            Some(Write::Insert(_)) => Write::Insert(event),
            _ => Write::Update(event),
        };
        self.event_writes.insert(id, write);
        Box::pin(async { Ok(()) })
    }

    fn update_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()> {
        let id = voucher.id;
        let write = match self.voucher_writes.remove(&id) {
            Some(Write::Insert(_)) => Write::Insert(voucher),
            _ => Write::Update(voucher),
        };
        self.voucher_writes.insert(id, write);
        Box::pin(async { Ok(()) })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        let result = (*self).try_commit();
        Box::pin(async move { result })
    }

    fn abort(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.inner.aborts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

impl TransactionalStore for InMemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if let Some(fault) = Inner::next_fault(&inner.begin_faults) {
                return Err(fault);
            }
            Ok(Box::new(InMemoryTransaction::new(inner)) as Box<dyn Transaction>)
        })
    }

    fn list_events(&self) -> StoreFuture<'_, Vec<Event>> {
        Box::pin(async move {
            let docs = self.inner.docs()?;
            let mut events: Vec<Event> = docs.events.values().map(|v| v.doc.clone()).collect();
            events.sort_by_key(|e| e.created_at);
            Ok(events)
        })
    }

    fn list_vouchers(&self, event_id: Option<EventId>) -> StoreFuture<'_, Vec<Voucher>> {
        Box::pin(async move {
            let docs = self.inner.docs()?;
            let mut vouchers: Vec<Voucher> = docs
                .vouchers
                .values()
                .filter(|v| event_id.is_none_or(|id| v.doc.event_id == id))
                .map(|v| v.doc.clone())
                .collect();
            vouchers.sort_by_key(|v| v.created_at);
            Ok(vouchers)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use voucher_core::ids::{RequesterId, VoucherCode};

    fn voucher_for(event_id: EventId, code: &str) -> Voucher {
        Voucher::issue(
            event_id,
            VoucherCode::new(code),
            RequesterId::new("u1").unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn commit_applies_staged_writes() {
        let store = InMemoryStore::new();
        let event = Event::new("Meetup", 5, Utc::now());
        let id = event.id;
        store.seed_event(event);

        let mut tx = store.begin().await.unwrap();
        let mut event = tx.get_event(id).await.unwrap().unwrap();
        event.record_issue().unwrap();
        tx.update_event(event).await.unwrap();
        tx.insert_voucher(voucher_for(id, "VC-1")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.event(id).unwrap().issued_count, 1);
        assert_eq!(store.vouchers_for(id).len(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_conflict_on_commit() {
        let store = InMemoryStore::new();
        let event = Event::new("Meetup", 5, Utc::now());
        let id = event.id;
        store.seed_event(event);

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let mut a = first.get_event(id).await.unwrap().unwrap();
        let mut b = second.get_event(id).await.unwrap().unwrap();
        a.record_issue().unwrap();
        b.record_issue().unwrap();
        first.update_event(a).await.unwrap();
        second.update_event(b).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();

        assert!(matches!(err, StoreError::WriteConflict { collection: Collection::Events, .. }));
        assert_eq!(store.event(id).unwrap().issued_count, 1);
        assert_eq!(store.conflicts(), 1);
    }

    #[tokio::test]
    async fn duplicate_codes_are_rejected() {
        let store = InMemoryStore::new();
        let event_id = EventId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_voucher(voucher_for(event_id, "VC-SAME")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_voucher(voucher_for(event_id, "VC-SAME")).await.unwrap();
        let err = tx.commit().await.unwrap_err();

        assert_eq!(
            err,
            StoreError::DuplicateKey {
                collection: Collection::Vouchers,
                field: "code",
                value: "VC-SAME".to_string()
            }
        );
    }

    #[tokio::test]
    async fn aborted_writes_are_discarded() {
        let store = InMemoryStore::new();
        let event = Event::new("Meetup", 5, Utc::now());
        let id = event.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(event).await.unwrap();
        tx.abort().await;

        assert!(store.event(id).is_none());
        assert_eq!(store.aborts(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = InMemoryStore::new();
        store.fail_next_commit(StoreError::Database("disk full".to_string()));

        let tx = store.begin().await.unwrap();
        assert_eq!(
            tx.commit().await.unwrap_err(),
            StoreError::Database("disk full".to_string())
        );

        let tx = store.begin().await.unwrap();
        tx.commit().await.expect("fault queue should be drained");
    }

    #[tokio::test]
    async fn list_vouchers_filters_by_event() {
        let store = InMemoryStore::new();
        let (e1, e2) = (EventId::new(), EventId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_voucher(voucher_for(e1, "VC-A")).await.unwrap();
        tx.insert_voucher(voucher_for(e2, "VC-B")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.list_vouchers(None).await.unwrap().len(), 2);
        let only_e1 = store.list_vouchers(Some(e1)).await.unwrap();
        assert_eq!(only_e1.len(), 1);
        assert_eq!(only_e1[0].code.as_str(), "VC-A");
    }
}
