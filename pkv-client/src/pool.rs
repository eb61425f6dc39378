//! # Connection Pool
//!
//! Purpose: Lend a bounded set of connections to concurrent callers,
//! validating, evicting, and recycling them.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: The state mutex is held only while moving entries;
//!    factory IO (create/validate/destroy) always runs unlocked.
//! 3. **FIFO Fairness**: Borrowers take a ticket; only the front ticket may
//!    claim an idle connection or a free slot.
//! 4. **RAII Leases**: `PooledConnection` returns itself on drop, or is
//!    invalidated when a transport error marked it broken.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool (Arc handle)
//!   └── PoolInner<F>
//!         ├── factory: F (create / validate / destroy)
//!         ├── state: Mutex<PoolState>
//!         │     ├── idle: VecDeque<IdleEntry>   (front = longest idle)
//!         │     ├── waiters: VecDeque<ticket>
//!         │     └── total / borrowed counters
//!         ├── available: Condvar
//!         ├── destroy_listeners: notified with each destroyed id
//!         └── evictor: background thread (Weak back-reference)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Deserialize;

use pkv_common::{CommandArguments, PkvError, PkvResult};

use crate::connection::{Connection, ConnectionFactory};
use crate::resp::RespValue;

/// Pool configuration. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum total connections (idle + borrowed).
    pub max_total: usize,
    /// Idle connections the evictor keeps (and tops up to).
    pub min_idle: usize,
    /// Maximum idle connections; surplus returns are closed.
    pub max_idle: usize,
    /// Borrow wait: 0 fails fast, negative waits forever.
    pub max_wait_millis: i64,
    /// Validate idle connections before lending them.
    pub test_on_borrow: bool,
    /// Validate connections when they are returned.
    pub test_on_return: bool,
    /// Period of the background eviction scan.
    pub eviction_interval_millis: u64,
    /// Idle time after which a connection may be evicted.
    pub min_evictable_idle_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 16,
            min_idle: 0,
            max_idle: 8,
            max_wait_millis: -1,
            test_on_borrow: false,
            test_on_return: false,
            eviction_interval_millis: 30_000,
            min_evictable_idle_millis: 60_000,
        }
    }
}

impl PoolConfig {
    /// Checks the numeric constraints between fields.
    pub fn validate(&self) -> PkvResult<()> {
        if self.max_total == 0 {
            return Err(PkvError::Config("max_total must be greater than 0".into()));
        }
        if self.max_idle < self.min_idle {
            return Err(PkvError::Config("max_idle must be at least min_idle".into()));
        }
        if self.eviction_interval_millis == 0 {
            return Err(PkvError::Config(
                "eviction_interval_millis must be greater than 0".into(),
            ));
        }
        if self.min_evictable_idle_millis == 0 {
            return Err(PkvError::Config(
                "min_evictable_idle_millis must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Default borrow timeout; `None` means wait forever.
    pub fn max_wait(&self) -> Option<Duration> {
        if self.max_wait_millis < 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_wait_millis as u64))
        }
    }

    fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_millis)
    }

    fn min_evictable_idle(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_millis)
    }
}

/// Lifecycle timestamps of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Pool-assigned id, unique for the pool's lifetime. Never 0.
    pub id: u64,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_validated: Option<Instant>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle + borrowed + being created.
    pub total: usize,
    pub idle: usize,
    pub borrowed: usize,
    /// Callers currently queued in `borrow`.
    pub waiters: usize,
    /// Connections created over the pool's lifetime.
    pub created: u64,
    /// Connections destroyed over the pool's lifetime.
    pub destroyed: u64,
}

struct IdleEntry<C> {
    conn: C,
    info: ConnectionInfo,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    total: usize,
    borrowed: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    next_conn_id: u64,
    closed: bool,
    created: u64,
    destroyed: u64,
}

impl<C> PoolState<C> {
    fn new(max_idle: usize) -> Self {
        PoolState {
            idle: VecDeque::with_capacity(max_idle),
            total: 0,
            borrowed: 0,
            waiters: VecDeque::new(),
            next_ticket: 0,
            next_conn_id: 1,
            closed: false,
            created: 0,
            destroyed: 0,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    fn withdraw(&mut self, ticket: u64) {
        if let Some(pos) = self.waiters.iter().position(|queued| *queued == ticket) {
            self.waiters.remove(pos);
        }
    }

    fn forget_slot(&mut self) {
        self.total = self.total.saturating_sub(1);
        self.destroyed += 1;
    }
}

struct PoolInner<F: ConnectionFactory> {
    config: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
    evictor: Mutex<Option<EvictorHandle>>,
    destroy_listeners: RwLock<Vec<DestroyListener>>,
}

/// Called with the id of every connection the pool destroys.
type DestroyListener = Box<dyn Fn(u64) + Send + Sync>;

/// Connection pool handle. Clones share the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates a pool and starts its eviction thread.
    pub fn new(config: PoolConfig, factory: F) -> PkvResult<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::new(config.max_idle)),
            config,
            factory,
            available: Condvar::new(),
            evictor: Mutex::new(None),
            destroy_listeners: RwLock::new(Vec::new()),
        });
        let handle = start_evictor(&inner);
        *inner.evictor.lock() = handle;
        Ok(ConnectionPool { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Registers `listener` to run after each connection is destroyed,
    /// whatever the reason: invalidation, eviction, surplus, or close.
    pub fn on_destroy(&self, listener: impl Fn(u64) + Send + Sync + 'static) {
        self.inner.destroy_listeners.write().push(Box::new(listener));
    }

    /// Borrows with the configured `max_wait_millis`.
    pub fn borrow(&self) -> PkvResult<PooledConnection<F>> {
        self.borrow_inner(self.inner.config.max_wait(), None)
    }

    /// Borrows with an explicit timeout; `None` waits forever.
    pub fn borrow_timeout(&self, timeout: Option<Duration>) -> PkvResult<PooledConnection<F>> {
        self.borrow_inner(timeout, None)
    }

    /// Borrows until success, timeout, pool close, or `token` is canceled.
    pub fn borrow_cancelable(
        &self,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> PkvResult<PooledConnection<F>> {
        let waker: Weak<dyn WakeWaiters> = Arc::downgrade(&self.inner) as Weak<dyn WakeWaiters>;
        token.attach(waker);
        self.borrow_inner(timeout, Some(token))
    }

    /// Returns a connection to the pool (same as dropping it).
    pub fn return_connection(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Destroys a connection instead of recycling it.
    pub fn invalidate(&self, mut conn: PooledConnection<F>) {
        conn.broken = true;
        drop(conn);
    }

    /// Closes the pool: idle connections now, borrowed ones when they come back.
    pub fn close(&self) {
        let drained: Vec<IdleEntry<F::Connection>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            for _ in &drained {
                state.forget_slot();
            }
            drained
        };
        self.inner.available.notify_all();

        for entry in drained {
            tracing::debug!(id = entry.info.id, "closing idle connection on shutdown");
            self.inner.destroy(entry.conn, entry.info.id);
        }

        let handle = self.inner.evictor.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            waiters: state.waiters.len(),
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Runs one eviction pass as of `now`, then tops idle up to `min_idle`.
    ///
    /// Returns the number of evicted connections. The background thread
    /// calls this with `Instant::now()`.
    pub fn evict_at(&self, now: Instant) -> usize {
        let evicted = self.inner.evict(now);
        self.inner.ensure_min_idle();
        evicted
    }

    fn borrow_inner(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> PkvResult<PooledConnection<F>> {
        let inner = &self.inner;
        // A timeout past the end of `Instant` is the same as waiting forever.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let mut state = inner.state.lock();
        if state.closed {
            return Err(PkvError::PoolClosed);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        let outcome = loop {
            if state.closed {
                break Err(PkvError::PoolClosed);
            }
            if cancel.map_or(false, CancelToken::is_canceled) {
                break Err(PkvError::BorrowCanceled);
            }

            if state.waiters.front() == Some(&ticket) {
                if let Some(entry) = state.idle.pop_front() {
                    state.borrowed += 1;
                    if !inner.config.test_on_borrow {
                        break Ok(entry);
                    }
                    // Keep our place at the front while validating unlocked.
                    match MutexGuard::unlocked(&mut state, || inner.validate_idle(entry)) {
                        Some(entry) => break Ok(entry),
                        None => {
                            state.borrowed = state.borrowed.saturating_sub(1);
                            state.forget_slot();
                            continue;
                        }
                    }
                }

                if state.total < inner.config.max_total {
                    state.total += 1;
                    state.borrowed += 1;
                    let id = state.allocate_id();
                    match MutexGuard::unlocked(&mut state, || inner.factory.create()) {
                        Ok(conn) => {
                            state.created += 1;
                            let now = Instant::now();
                            tracing::debug!(id, "created pooled connection");
                            break Ok(IdleEntry {
                                conn,
                                info: ConnectionInfo {
                                    id,
                                    created_at: now,
                                    last_used: now,
                                    last_validated: None,
                                },
                            });
                        }
                        Err(err) => {
                            state.total = state.total.saturating_sub(1);
                            state.borrowed = state.borrowed.saturating_sub(1);
                            break Err(err);
                        }
                    }
                }
            }

            match deadline {
                None => inner.available.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Err(PkvError::PoolExhausted);
                    }
                    inner.available.wait_until(&mut state, deadline);
                }
            }
        };

        state.withdraw(ticket);
        drop(state);
        // The next ticket may now be at the front.
        inner.available.notify_all();

        outcome.map(|entry| PooledConnection {
            pool: Arc::clone(inner),
            conn: Some(entry.conn),
            info: entry.info,
            broken: false,
        })
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Closes a connection and notifies listeners. Never called under the state lock.
    fn destroy(&self, conn: F::Connection, id: u64) {
        self.factory.destroy(conn);
        for listener in self.destroy_listeners.read().iter() {
            listener(id);
        }
    }

    fn validate_idle(&self, mut entry: IdleEntry<F::Connection>) -> Option<IdleEntry<F::Connection>> {
        if self.factory.validate(&mut entry.conn) {
            entry.info.last_validated = Some(Instant::now());
            return Some(entry);
        }
        tracing::warn!(id = entry.info.id, "idle connection failed validation on borrow");
        self.destroy(entry.conn, entry.info.id);
        None
    }

    /// Puts a borrowed connection back into the idle set.
    fn release(&self, mut conn: F::Connection, mut info: ConnectionInfo) {
        let now = Instant::now();
        if self.config.test_on_return {
            if self.factory.validate(&mut conn) {
                info.last_validated = Some(now);
            } else {
                tracing::warn!(id = info.id, "connection failed validation on return");
                self.discard(conn, info);
                return;
            }
        }

        let mut state = self.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if state.closed || state.idle.len() >= self.config.max_idle {
            state.forget_slot();
            drop(state);
            self.available.notify_all();
            tracing::debug!(id = info.id, "closing returned connection");
            self.destroy(conn, info.id);
            return;
        }

        info.last_used = now;
        state.idle.push_back(IdleEntry { conn, info });
        drop(state);
        self.available.notify_all();
    }

    /// Removes a borrowed connection from accounting and destroys it.
    fn discard(&self, conn: F::Connection, info: ConnectionInfo) {
        {
            let mut state = self.state.lock();
            state.borrowed = state.borrowed.saturating_sub(1);
            state.forget_slot();
        }
        self.available.notify_all();
        tracing::debug!(id = info.id, "destroying invalidated connection");
        self.destroy(conn, info.id);
    }

    /// Closes idle connections older than `min_evictable_idle`, oldest first,
    /// never dropping below `min_idle`.
    fn evict(&self, now: Instant) -> usize {
        let min_evictable = self.config.min_evictable_idle();
        let evicted: Vec<IdleEntry<F::Connection>> = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let mut remaining = state.idle.len();
            let mut kept = VecDeque::with_capacity(remaining);
            let mut evicted = Vec::new();
            while let Some(entry) = state.idle.pop_front() {
                let idle_for = now.saturating_duration_since(entry.info.last_used);
                if remaining > self.config.min_idle && idle_for > min_evictable {
                    remaining -= 1;
                    evicted.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.idle = kept;
            for _ in &evicted {
                state.forget_slot();
            }
            evicted
        };

        if evicted.is_empty() {
            return 0;
        }
        self.available.notify_all();
        let count = evicted.len();
        for entry in evicted {
            tracing::debug!(id = entry.info.id, "evicting idle connection");
            self.destroy(entry.conn, entry.info.id);
        }
        count
    }

    /// Creates idle connections until `min_idle` is met or `max_total` is hit.
    fn ensure_min_idle(&self) -> usize {
        let mut added = 0;
        loop {
            let id = {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() >= self.config.min_idle
                    || state.total >= self.config.max_total
                {
                    break;
                }
                state.total += 1;
                state.allocate_id()
            };

            match self.factory.create() {
                Ok(conn) => {
                    let now = Instant::now();
                    let mut state = self.state.lock();
                    state.created += 1;
                    if state.closed {
                        state.forget_slot();
                        drop(state);
                        self.destroy(conn, id);
                        break;
                    }
                    state.idle.push_back(IdleEntry {
                        conn,
                        info: ConnectionInfo {
                            id,
                            created_at: now,
                            last_used: now,
                            last_validated: None,
                        },
                    });
                    drop(state);
                    self.available.notify_all();
                    added += 1;
                }
                Err(err) => {
                    {
                        let mut state = self.state.lock();
                        state.total = state.total.saturating_sub(1);
                    }
                    self.available.notify_all();
                    tracing::warn!(error = %err, "failed to top up idle connections");
                    break;
                }
            }
        }
        added
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        // May run on the evictor thread itself, so signal without joining.
        if let Some(handle) = self.evictor.get_mut().take() {
            handle.signal();
        }
        let idle: Vec<_> = self.state.get_mut().idle.drain(..).collect();
        for entry in idle {
            self.destroy(entry.conn, entry.info.id);
        }
    }
}

/// A borrowed connection.
///
/// Dropping it returns the connection to the pool; if a send failed at the
/// transport level the connection is invalidated instead.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    conn: Option<F::Connection>,
    info: ConnectionInfo,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Pool-assigned connection id.
    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Sends a command, marking the connection broken on transport errors.
    pub fn send(&mut self, args: &CommandArguments) -> PkvResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(PkvError::PoolClosed),
        };
        let response = conn.send(args);
        if let Err(err) = &response {
            if err.is_connection_broken() {
                // If IO/protocol fails, do not return this connection to the pool.
                self.broken = true;
            }
        }
        response
    }

    /// Flags the connection so dropping it invalidates instead of returning.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.broken {
            tracing::warn!(id = self.info.id, "invalidating broken connection");
            self.pool.discard(conn, self.info);
        } else {
            self.pool.release(conn, self.info);
        }
    }
}

trait WakeWaiters: Send + Sync {
    fn wake_waiters(&self);
}

impl<F: ConnectionFactory> WakeWaiters for PoolInner<F> {
    fn wake_waiters(&self) {
        // Taking the lock orders the wakeup after any in-progress cancel check.
        let _state = self.state.lock();
        self.available.notify_all();
    }
}

/// Cancels a blocked `borrow_cancelable` call from another thread.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    canceled: AtomicBool,
    waker: Mutex<Option<Weak<dyn WakeWaiters>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the borrow and wakes it if it is waiting.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        let waker = self.inner.waker.lock().as_ref().and_then(Weak::upgrade);
        if let Some(waker) = waker {
            waker.wake_waiters();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    fn attach(&self, waker: Weak<dyn WakeWaiters>) {
        *self.inner.waker.lock() = Some(waker);
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle for the background eviction thread.
struct EvictorHandle {
    signal: Arc<StopSignal>,
    join: Option<JoinHandle<()>>,
}

impl EvictorHandle {
    fn signal(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
    }

    /// Stops the evictor and waits for the thread to finish.
    fn stop(mut self) {
        self.signal();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn start_evictor<F: ConnectionFactory>(inner: &Arc<PoolInner<F>>) -> Option<EvictorHandle> {
    let interval = inner.config.eviction_interval();
    let signal = Arc::new(StopSignal::default());
    let thread_signal = Arc::clone(&signal);
    let pool = Arc::downgrade(inner);

    let spawned = std::thread::Builder::new()
        .name("pkv-evictor".to_string())
        .spawn(move || {
            let mut stopped = thread_signal.stopped.lock();
            while !*stopped {
                thread_signal.wake.wait_for(&mut stopped, interval);
                if *stopped {
                    break;
                }
                // The strong reference must be dropped unlocked: if it is the
                // last one, PoolInner::drop signals this same mutex.
                let alive = MutexGuard::unlocked(&mut stopped, || match pool.upgrade() {
                    Some(pool) => {
                        let evicted = pool.evict(Instant::now());
                        let added = pool.ensure_min_idle();
                        if evicted > 0 || added > 0 {
                            tracing::debug!(evicted, added, "eviction pass finished");
                        }
                        true
                    }
                    None => false,
                });
                if !alive {
                    break;
                }
            }
        });

    match spawned {
        Ok(join) => Some(EvictorHandle {
            signal,
            join: Some(join),
        }),
        Err(err) => {
            tracing::warn!(error = %err, "failed to start eviction thread");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFactory;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn config(max_total: usize) -> PoolConfig {
        PoolConfig {
            max_total,
            min_idle: 0,
            max_idle: max_total,
            max_wait_millis: 0,
            ..PoolConfig::default()
        }
    }

    fn pool(config: PoolConfig) -> (ConnectionPool<FakeFactory>, FakeFactory) {
        crate::testing::init_tracing();
        let factory = FakeFactory::default();
        let pool = ConnectionPool::new(config, factory.clone()).unwrap();
        (pool, factory)
    }

    #[test]
    fn rejects_invalid_config() {
        let bad = PoolConfig {
            max_total: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(
            ConnectionPool::new(bad, FakeFactory::default()),
            Err(PkvError::Config(_))
        ));

        let bad = PoolConfig {
            min_idle: 4,
            max_idle: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(bad.validate(), Err(PkvError::Config(_))));
    }

    #[test]
    fn max_wait_semantics() {
        let mut config = PoolConfig::default();
        config.max_wait_millis = -1;
        assert_eq!(config.max_wait(), None);
        config.max_wait_millis = 0;
        assert_eq!(config.max_wait(), Some(Duration::ZERO));
        config.max_wait_millis = 250;
        assert_eq!(config.max_wait(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn fail_fast_exhaustion_then_recovery() {
        let (pool, _) = pool(config(2));
        let first = pool.borrow().unwrap();
        let second = pool.borrow().unwrap();
        assert_ne!(first.id(), second.id());

        assert!(matches!(pool.borrow(), Err(PkvError::PoolExhausted)));
        assert_eq!(pool.stats().waiters, 0);

        let recycled = first.id();
        pool.return_connection(first);
        let third = pool.borrow().unwrap();
        assert_eq!(third.id(), recycled);
        drop(second);
    }

    #[test]
    fn returned_connection_is_reused() {
        let (pool, factory) = pool(config(4));
        let conn = pool.borrow().unwrap();
        let id = conn.id();
        drop(conn);

        let again = pool.borrow().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn invalidated_connection_is_never_lent_again() {
        let (pool, factory) = pool(config(1));
        let conn = pool.borrow().unwrap();
        let id = conn.id();
        pool.invalidate(conn);

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(factory.destroyed(), 1);

        let fresh = pool.borrow().unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[test]
    fn transport_error_invalidates_on_drop() {
        let (pool, factory) = pool(config(1));
        let mut conn = pool.borrow().unwrap();
        factory.break_next_send();
        let mut ping = CommandArguments::new(pkv_common::Command::Ping);
        ping.add(b"x");
        assert!(conn.send(&ping).unwrap_err().is_connection_broken());
        assert!(conn.is_broken());
        drop(conn);

        assert_eq!(pool.stats().total, 0);
        assert_eq!(factory.destroyed(), 1);
    }

    #[test]
    fn test_on_borrow_replaces_dead_idle_connection() {
        let mut cfg = config(2);
        cfg.test_on_borrow = true;
        let (pool, factory) = pool(cfg);

        let conn = pool.borrow().unwrap();
        let stale = conn.id();
        drop(conn);

        factory.set_healthy(false);
        // New connections skip validation, so the stale one is swapped for a fresh one.
        let conn = pool.borrow().unwrap();
        assert_ne!(conn.id(), stale);
        assert_eq!(factory.destroyed(), 1);
        assert!(conn.info().last_validated.is_none());
    }

    #[test]
    fn test_on_return_discards_failing_connection() {
        let mut cfg = config(2);
        cfg.test_on_return = true;
        let (pool, factory) = pool(cfg);

        let conn = pool.borrow().unwrap();
        factory.set_healthy(false);
        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total, 0);

        factory.set_healthy(true);
        let conn = pool.borrow().unwrap();
        drop(conn);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn surplus_returns_respect_max_idle() {
        let mut cfg = config(3);
        cfg.max_idle = 1;
        let (pool, factory) = pool(cfg);
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[test]
    fn close_rejects_borrows_and_closes_returns() {
        let (pool, factory) = pool(config(2));
        let held = pool.borrow().unwrap();
        let idle = pool.borrow().unwrap();
        drop(idle);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(factory.destroyed(), 1);
        assert!(matches!(pool.borrow(), Err(PkvError::PoolClosed)));

        drop(held);
        assert_eq!(factory.destroyed(), 2);
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let (pool, _) = pool(config(1));
        let held = pool.borrow().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow_timeout(None).map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(PkvError::PoolClosed)));
        drop(held);
    }

    #[test]
    fn blocked_borrow_gets_returned_connection() {
        let (pool, _) = pool(config(1));
        let held = pool.borrow().unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.borrow_timeout(Some(Duration::from_secs(2)))
                    .map(|conn| conn.id())
            })
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn timed_out_borrow_leaves_no_trace() {
        let (pool, _) = pool(config(1));
        let held = pool.borrow().unwrap();
        let before = pool.stats();

        let result = pool.borrow_timeout(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(PkvError::PoolExhausted)));
        assert_eq!(pool.stats(), before);
        drop(held);
    }

    #[test]
    fn unbounded_timeout_waits_instead_of_overflowing() {
        let (pool, _) = pool(config(1));
        let conn = pool.borrow_timeout(Some(Duration::MAX)).unwrap();
        let id = conn.id();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow_timeout(Some(Duration::MAX)).map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(conn);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn canceled_borrow_withdraws_from_queue() {
        let (pool, _) = pool(config(1));
        let held = pool.borrow().unwrap();
        let token = CancelToken::new();

        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            thread::spawn(move || pool.borrow_cancelable(None, &token).map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(PkvError::BorrowCanceled)));
        assert_eq!(pool.stats().waiters, 0);
        assert_eq!(pool.stats().borrowed, 1);
        drop(held);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let (pool, _) = pool(config(1));
        let held = pool.borrow().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for idx in 0..3 {
            let worker = pool.clone();
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let conn = worker.borrow_timeout(Some(Duration::from_secs(5))).unwrap();
                order.lock().push(idx);
                thread::sleep(Duration::from_millis(5));
                drop(conn);
            }));
            // Make arrival order deterministic.
            while pool.stats().waiters < idx + 1 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_borrows_never_exceed_max_total() {
        let mut cfg = config(3);
        cfg.max_wait_millis = -1;
        let (pool, factory) = pool(cfg);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let conn = pool.borrow().unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(pool.stats().borrowed <= 3);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        drop(conn);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(factory.created() <= 3);
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[test]
    fn eviction_respects_age_and_min_idle() {
        let mut cfg = config(4);
        cfg.min_idle = 1;
        cfg.min_evictable_idle_millis = 50;
        let (pool, factory) = pool(cfg);

        let conns: Vec<_> = (0..3).map(|_| pool.borrow().unwrap()).collect();
        drop(conns);
        assert_eq!(pool.stats().idle, 3);

        // Nothing is old enough yet.
        assert_eq!(pool.evict_at(Instant::now()), 0);

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(pool.evict_at(later), 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(factory.destroyed(), 2);
    }

    #[test]
    fn destroy_listeners_see_every_destroyed_connection() {
        let mut cfg = config(3);
        cfg.max_idle = 1;
        cfg.min_evictable_idle_millis = 10;
        let (pool, factory) = pool(cfg);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            pool.on_destroy(move |id| seen.lock().push(id));
        }

        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        let c = pool.borrow().unwrap();
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

        // Surplus over max_idle.
        drop(a);
        drop(b);
        // Invalidation.
        pool.invalidate(c);
        // Eviction.
        assert_eq!(pool.evict_at(Instant::now() + Duration::from_secs(10)), 1);

        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![a_id, b_id, c_id]);
        assert_eq!(factory.destroyed(), 3);

        // Close.
        let d = pool.borrow().unwrap();
        let d_id = d.id();
        drop(d);
        pool.close();
        assert_eq!(seen.lock().last(), Some(&d_id));
    }

    #[test]
    fn eviction_never_touches_borrowed() {
        let mut cfg = config(2);
        cfg.min_evictable_idle_millis = 1;
        let (pool, _) = pool(cfg);
        let held = pool.borrow().unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(pool.evict_at(later), 0);
        assert_eq!(pool.stats().borrowed, 1);
        drop(held);
    }

    #[test]
    fn evictor_thread_settles_idle_to_min_idle() {
        let cfg = PoolConfig {
            max_total: 4,
            min_idle: 2,
            max_idle: 4,
            max_wait_millis: 0,
            eviction_interval_millis: 10,
            min_evictable_idle_millis: 20,
            ..PoolConfig::default()
        };
        let (pool, _) = pool(cfg);

        // Tops up from zero.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.stats().idle, 2);

        let burst: Vec<_> = (0..4).map(|_| pool.borrow().unwrap()).collect();
        drop(burst);
        assert_eq!(pool.stats().idle, 4);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(pool.stats().idle, 2);
        pool.close();
    }
}
