//! Keyed request cache with staleness, eviction and invalidate-then-refetch.
//!
//! Values are fetched through caller-supplied fetchers and cached under a
//! [`QueryKey`]. Concurrent reads of one key share a single in-flight fetch.
//! Mutations never patch cached values; they invalidate keys and let the next
//! read (or a mounted [`QueryObserver`]) refetch.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    time::Instant,
};
use tracing::{debug, warn};

use crate::error::{FetchError, MutationError, QueryError};

/// Ordered key segments; the first is the semantic key, the rest are
/// parameters. Invalidation matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(vec![scope.into()])
    }

    pub fn with(mut self, segment: impl ToString) -> Self {
        self.0.push(segment.to_string());
        self
    }

    pub fn scope(&self) -> &str {
        &self.0[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl From<&str> for QueryKey {
    fn from(scope: &str) -> Self {
        Self::new(scope)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueryOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStatus {
    pub has_data: bool,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub observers: usize,
    pub updated_at: Option<Instant>,
    pub error: Option<QueryError>,
}

type Value = Arc<dyn Any + Send + Sync>;
type FetchResult = Result<Value, QueryError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchFailure>> + Send + Sync>;

struct FetchFailure {
    message: String,
    transient: bool,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    waiters: usize,
}

struct Entry {
    data: Option<Value>,
    updated_at: Option<Instant>,
    error: Option<QueryError>,
    invalidated: bool,
    generation: u64,
    stale_time: Duration,
    gc_time: Duration,
    gc_token: u64,
    observers: usize,
    refetch: Option<(ErasedFetcher, QueryOptions)>,
    in_flight: Option<InFlight>,
    version: watch::Sender<u64>,
}

impl Entry {
    fn new(options: &QueryOptions) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            data: None,
            updated_at: None,
            error: None,
            invalidated: false,
            generation: 0,
            stale_time: options.stale_time,
            gc_time: options.gc_time,
            gc_token: 0,
            observers: 0,
            refetch: None,
            in_flight: None,
            version,
        }
    }

    fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
        match (&self.data, self.updated_at) {
            (Some(_), Some(updated_at)) => !self.invalidated && now < updated_at + stale_time,
            _ => false,
        }
    }

    fn bump_version(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

fn erase<T, F, Fut, E>(fetcher: F) -> ErasedFetcher
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: FetchError,
{
    Arc::new(move || {
        let fut = fetcher();
        async move {
            fut.await
                .map(|value| Arc::new(value) as Value)
                .map_err(|err| FetchFailure {
                    transient: err.is_transient(),
                    message: err.to_string(),
                })
        }
        .boxed()
    })
}

fn downcast<T: Send + Sync + 'static>(key: &QueryKey, value: Value) -> Result<Arc<T>, QueryError> {
    value
        .downcast::<T>()
        .map_err(|_| QueryError::TypeMismatch {
            key: key.to_string(),
        })
}

/// Process-wide query cache, shared by every consumer of the client.
pub struct QueryClient {
    defaults: QueryOptions,
    next_fetch_id: AtomicU64,
    entries: Mutex<HashMap<QueryKey, Entry>>,
    this: Weak<QueryClient>,
}

impl QueryClient {
    pub fn new(defaults: QueryOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            defaults,
            next_fetch_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn defaults(&self) -> &QueryOptions {
        &self.defaults
    }

    /// Returns the cached value while fresh; otherwise joins or starts the
    /// single fetch for `key`.
    pub async fn query<T, F, Fut, E>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: FetchError,
    {
        let (fetch, fetch_id) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(&options));
            entry.stale_time = options.stale_time;
            entry.gc_time = options.gc_time;

            if entry.is_fresh(options.stale_time, Instant::now()) {
                let value = entry.data.clone();
                if entry.observers == 0 {
                    self.schedule_gc(&key, entry);
                }
                if let Some(value) = value {
                    debug!(key = %key, "query: fresh cache hit");
                    return downcast(&key, value);
                }
            }
            // A consumer is active; hold off eviction until the fetch settles.
            entry.gc_token += 1;
            self.join_or_start(&key, entry, || erase(fetcher), &options)
        };

        let _waiter = Waiter {
            client: self,
            key: &key,
            fetch_id,
        };
        let value = fetch.await?;
        downcast(&key, value)
    }

    /// Mounts a long-lived consumer of `key`. The observer is refetched
    /// whenever its key is invalidated, until it is dropped.
    pub fn observe<T, F, Fut, E>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> QueryObserver<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: FetchError,
    {
        let fetcher = erase(fetcher);
        let (receiver, needs_fetch) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(&options));
            entry.observers += 1;
            entry.gc_token += 1;
            entry.stale_time = options.stale_time;
            entry.gc_time = options.gc_time;
            entry.refetch = Some((Arc::clone(&fetcher), options.clone()));
            (
                entry.version.subscribe(),
                !entry.is_fresh(options.stale_time, Instant::now()),
            )
        };
        if needs_fetch {
            self.spawn_refetch(&key);
        }
        QueryObserver {
            client: self.this.upgrade(),
            key,
            receiver,
            _marker: PhantomData,
        }
    }

    /// Marks every entry under `pattern` stale. Mounted entries refetch now;
    /// the rest refetch on their next read. Returns how many entries matched.
    pub fn invalidate(&self, pattern: &QueryKey) -> usize {
        let mut to_refetch = Vec::new();
        let matched = {
            let mut entries = self.entries.lock();
            let mut matched = 0;
            for (key, entry) in entries.iter_mut().filter(|(key, _)| key.starts_with(pattern)) {
                matched += 1;
                entry.invalidated = true;
                entry.generation += 1;
                // Results of fetches started before this point are not trusted.
                entry.in_flight = None;
                if entry.observers > 0 && entry.refetch.is_some() {
                    to_refetch.push(key.clone());
                }
            }
            matched
        };
        debug!(pattern = %pattern, matched, mounted = to_refetch.len(), "query: invalidated");
        for key in to_refetch {
            self.spawn_refetch(&key);
        }
        matched
    }

    /// Runs a mutation once. On success the given patterns are invalidated;
    /// on failure the cache is left exactly as it was.
    pub async fn mutate<T, E, Fut>(
        &self,
        action: Fut,
        invalidates: &[QueryKey],
    ) -> Result<T, MutationError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match action.await {
            Ok(value) => {
                for pattern in invalidates {
                    self.invalidate(pattern);
                }
                Ok(value)
            }
            Err(err) => {
                warn!(%err, "query: mutation failed; cache untouched");
                Err(MutationError(err))
            }
        }
    }

    pub fn peek<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        let value = self.entries.lock().get(key)?.data.clone()?;
        value.downcast::<T>().ok()
    }

    pub fn entry_status(&self, key: &QueryKey) -> Option<EntryStatus> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        Some(EntryStatus {
            has_data: entry.data.is_some(),
            is_stale: !entry.is_fresh(entry.stale_time, Instant::now()),
            is_fetching: entry.in_flight.is_some(),
            observers: entry.observers,
            updated_at: entry.updated_at,
            error: entry.error.clone(),
        })
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn join_or_start(
        &self,
        key: &QueryKey,
        entry: &mut Entry,
        make_fetcher: impl FnOnce() -> ErasedFetcher,
        options: &QueryOptions,
    ) -> (SharedFetch, u64) {
        if let Some(in_flight) = &mut entry.in_flight {
            debug!(key = %key, "query: joining in-flight fetch");
            in_flight.waiters += 1;
            return (in_flight.fetch.clone(), in_flight.id);
        }
        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let fetch = self.fetch_future(
            key.clone(),
            id,
            entry.generation,
            make_fetcher(),
            options.retry.clone(),
        );
        entry.in_flight = Some(InFlight {
            id,
            fetch: fetch.clone(),
            waiters: 1,
        });
        (fetch, id)
    }

    fn fetch_future(
        &self,
        key: QueryKey,
        fetch_id: u64,
        generation: u64,
        fetcher: ErasedFetcher,
        retry: RetryPolicy,
    ) -> SharedFetch {
        let client = self.this.clone();
        async move {
            let mut failed = 0u32;
            let result = loop {
                match fetcher().await {
                    Ok(value) => break Ok(value),
                    Err(FetchFailure { message, transient }) => {
                        failed += 1;
                        if !transient || failed > retry.max_retries {
                            break Err(QueryError::Fetch {
                                key: key.to_string(),
                                attempts: failed,
                                message,
                            });
                        }
                        let delay = retry.delay_for(failed - 1);
                        debug!(key = %key, attempt = failed, %message, "query: fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            };
            if let Some(client) = client.upgrade() {
                client.complete_fetch(&key, fetch_id, generation, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn complete_fetch(&self, key: &QueryKey, fetch_id: u64, generation: u64, result: &FetchResult) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug!(key = %key, "query: entry evicted before fetch settled; discarding result");
            return;
        };
        if entry.in_flight.as_ref().is_some_and(|f| f.id == fetch_id) {
            entry.in_flight = None;
        }
        if entry.generation != generation {
            debug!(key = %key, "query: discarding result of fetch started before invalidation");
            if entry.observers == 0 && entry.in_flight.is_none() {
                self.schedule_gc(key, entry);
            }
            return;
        }
        match result {
            Ok(value) => {
                entry.data = Some(Arc::clone(value));
                entry.updated_at = Some(Instant::now());
                entry.error = None;
                entry.invalidated = false;
            }
            Err(err) => {
                warn!(key = %key, %err, "query: fetch failed");
                entry.error = Some(err.clone());
            }
        }
        entry.bump_version();
        if entry.observers == 0 {
            self.schedule_gc(key, entry);
        }
    }

    fn spawn_refetch(&self, key: &QueryKey) {
        let fetch = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            let Some((fetcher, options)) = entry.refetch.clone() else {
                return;
            };
            self.join_or_start(key, entry, || fetcher, &options).0
        };
        tokio::spawn(async move {
            let _ = fetch.await;
        });
    }

    fn schedule_gc(&self, key: &QueryKey, entry: &mut Entry) {
        entry.gc_token += 1;
        let token = entry.gc_token;
        let gc_time = entry.gc_time;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.this.clone();
        let key = key.clone();
        runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(client) = client.upgrade() {
                client.collect(&key, token);
            }
        });
    }

    fn collect(&self, key: &QueryKey, token: u64) {
        let mut entries = self.entries.lock();
        let evict = entries.get(key).is_some_and(|entry| {
            entry.gc_token == token && entry.observers == 0 && entry.in_flight.is_none()
        });
        if evict {
            entries.remove(key);
            debug!(key = %key, "query: evicted inactive entry");
        }
    }

    /// Called when a reader stops waiting, settled or not. Once nobody waits
    /// on an unsettled fetch it is dropped and the entry becomes collectable.
    fn release(&self, key: &QueryKey, fetch_id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        let Some(in_flight) = entry.in_flight.as_mut().filter(|f| f.id == fetch_id) else {
            return;
        };
        in_flight.waiters = in_flight.waiters.saturating_sub(1);
        if in_flight.waiters > 0 {
            return;
        }
        entry.in_flight = None;
        debug!(key = %key, "query: fetch abandoned by every reader");
        if entry.observers == 0 {
            self.schedule_gc(key, entry);
        }
    }

    fn unmount(&self, key: &QueryKey) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers == 0 {
            entry.refetch = None;
            self.schedule_gc(key, entry);
        }
    }
}

struct Waiter<'a> {
    client: &'a QueryClient,
    key: &'a QueryKey,
    fetch_id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.client.release(self.key, self.fetch_id);
    }
}

/// A mounted consumer of one key. Dropping it unmounts the consumer; results
/// that arrive afterwards are not delivered to it.
pub struct QueryObserver<T> {
    client: Option<Arc<QueryClient>>,
    key: QueryKey,
    receiver: watch::Receiver<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest cached value, if any.
    pub fn current(&self) -> Result<Option<Arc<T>>, QueryError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let value = client
            .entries
            .lock()
            .get(&self.key)
            .and_then(|entry| entry.data.clone());
        value.map(|value| downcast(&self.key, value)).transpose()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.client
            .as_ref()?
            .entries
            .lock()
            .get(&self.key)?
            .error
            .clone()
    }

    /// Waits until the entry settles another fetch. Returns `false` once the
    /// entry is gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            client.unmount(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
