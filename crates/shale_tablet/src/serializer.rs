//! Hot-row transaction serializer.
//!
//! Queues transactions that target the same row key so a hot row cannot
//! drain the transaction pool. Each key admits `max_concurrency` holders;
//! the rest wait FIFO, bounded per key and globally. Waiters respect their
//! request context, so a canceled or timed-out caller leaves the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::{HotRowProtectionConfig, HotRowProtectionMode};
use crate::error::{ErrorCode, TabletError};
use crate::stats::ThrottledLog;
use crate::types::{BindVars, Context, Done};

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct KeyQueue {
    running: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct SerializerState {
    /// Running plus waiting entries across all keys.
    global_count: usize,
    keys: HashMap<String, KeyQueue>,
}

/// Keyed wait queue for contending transactions.
pub struct TxSerializer {
    config: HotRowProtectionConfig,
    state: Mutex<SerializerState>,
    next_waiter_id: AtomicU64,
    log_waits: ThrottledLog,

    pub waits: AtomicU64,
    pub wait_errors: AtomicU64,
    pub queue_exceeded: AtomicU64,
    pub global_queue_exceeded: AtomicU64,
    pub dry_run_waits: AtomicU64,
}

/// Releases the caller's slot for its key when dropped, handing the slot to
/// the next queued waiter.
pub struct DoneGuard<'a> {
    serializer: &'a TxSerializer,
    key: String,
}

impl std::fmt::Debug for DoneGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoneGuard").field("key", &self.key).finish()
    }
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.serializer.release(&self.key);
    }
}

impl TxSerializer {
    pub fn new(config: HotRowProtectionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SerializerState::default()),
            next_waiter_id: AtomicU64::new(1),
            log_waits: ThrottledLog::new(Duration::from_secs(60)),
            waits: AtomicU64::new(0),
            wait_errors: AtomicU64::new(0),
            queue_exceeded: AtomicU64::new(0),
            global_queue_exceeded: AtomicU64::new(0),
            dry_run_waits: AtomicU64::new(0),
        }
    }

    /// Admit a transaction for `key`, waiting if the key is already at its
    /// concurrency limit. Returns the release guard and whether the caller
    /// actually waited.
    pub async fn wait(
        &self,
        ctx: &Context,
        key: &str,
        table: &str,
    ) -> Result<(DoneGuard<'_>, bool), TabletError> {
        let mut rx = {
            let mut state = self.state.lock().unwrap();
            if state.global_count >= self.config.max_global_queue_size {
                self.global_queue_exceeded.fetch_add(1, Ordering::Relaxed);
                return Err(TabletError::new(
                    ErrorCode::ResourceExhausted,
                    format!(
                        "hot row protection: global queue full ({} >= {})",
                        state.global_count, self.config.max_global_queue_size
                    ),
                ));
            }
            let queue = state.keys.entry(key.to_string()).or_default();
            if queue.running + queue.waiters.len() >= self.config.max_queue_size {
                let queued = queue.running + queue.waiters.len();
                self.queue_exceeded.fetch_add(1, Ordering::Relaxed);
                return Err(TabletError::new(
                    ErrorCode::ResourceExhausted,
                    format!(
                        "hot row protection: too many queued transactions ({} >= {}) for the same row in table {}",
                        queued, self.config.max_queue_size, table
                    ),
                ));
            }

            state.global_count += 1;
            let queue = state.keys.get_mut(key).unwrap();
            if queue.running < self.config.max_concurrency {
                queue.running += 1;
                return Ok((self.guard(key), false));
            }
            if self.config.mode == HotRowProtectionMode::DryRun {
                // Report the contention but admit the transaction anyway.
                queue.running += 1;
                self.dry_run_waits.fetch_add(1, Ordering::Relaxed);
                if self.log_waits.ready() {
                    tracing::warn!(table, "hot row detected (dry-run), transaction not queued");
                }
                return Ok((self.guard(key), false));
            }

            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (grant, rx) = oneshot::channel();
            queue.waiters.push_back(Waiter { id, grant });
            self.waits.fetch_add(1, Ordering::Relaxed);
            if self.log_waits.ready() {
                tracing::warn!(table, "hot row detected, queueing transaction");
            }
            WaiterHandle { id, rx }
        };

        tokio::select! {
            granted = &mut rx.rx => {
                match granted {
                    Ok(()) => Ok((self.guard(key), true)),
                    // The serializer never drops a grant sender without
                    // sending, so this means the queue entry vanished.
                    Err(_) => {
                        self.wait_errors.fetch_add(1, Ordering::Relaxed);
                        Err(TabletError::new(
                            ErrorCode::Internal,
                            "hot row protection: wait queue entry lost",
                        ))
                    }
                }
            }
            done = ctx.done() => {
                self.wait_errors.fetch_add(1, Ordering::Relaxed);
                let removed = self.remove_waiter(key, rx.id);
                if !removed {
                    // The grant raced with cancellation: the slot is ours,
                    // give it straight back.
                    drop(self.guard(key));
                }
                Err(done_error(done))
            }
        }
    }

    fn guard(&self, key: &str) -> DoneGuard<'_> {
        DoneGuard {
            serializer: self,
            key: key.to_string(),
        }
    }

    /// Drop a canceled waiter from its queue. Returns false if the waiter
    /// had already been granted the slot.
    fn remove_waiter(&self, key: &str, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.keys.get_mut(key) else {
            return false;
        };
        let Some(pos) = queue.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        queue.waiters.remove(pos);
        let empty = queue.running == 0 && queue.waiters.is_empty();
        if empty {
            state.keys.remove(key);
        }
        state.global_count -= 1;
        true
    }

    fn release(&self, key: &str) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(queue) = state.keys.get_mut(key) else {
            return;
        };
        queue.running -= 1;
        state.global_count -= 1;
        while let Some(waiter) = queue.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                queue.running += 1;
                break;
            }
            // The waiting future was dropped without cancel cleanup.
            state.global_count -= 1;
        }
        let empty = queue.running == 0 && queue.waiters.is_empty();
        if empty {
            state.keys.remove(key);
        }
    }

    /// Keys currently tracked (running or queued). Exposed for status pages.
    pub fn active_keys(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }
}

struct WaiterHandle {
    id: u64,
    rx: oneshot::Receiver<()>,
}

fn done_error(done: Done) -> TabletError {
    match done {
        Done::Canceled => TabletError::new(
            ErrorCode::Canceled,
            "context canceled while waiting for hot row queue",
        ),
        Done::DeadlineExceeded => TabletError::new(
            ErrorCode::DeadlineExceeded,
            "deadline exceeded while waiting for hot row queue",
        ),
    }
}

/// Render a where-clause template by substituting `:name` placeholders with
/// the call's bind values. The result is a stable equality string for two
/// queries targeting the same row.
pub fn render_where_clause(template: &str, bind_vars: &BindVars) -> Result<String, TabletError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(':') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if end == 0 {
            out.push(':');
            rest = after;
            continue;
        }
        let name = &after[..end];
        let value = bind_vars.get(name).ok_or_else(|| {
            TabletError::new(ErrorCode::InvalidArgument, format!("missing bind var {name}"))
        })?;
        out.push_str(&value.sql_literal());
        rest = &after[end..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn serializer(mode: HotRowProtectionMode, concurrency: usize, queue: usize) -> Arc<TxSerializer> {
        Arc::new(TxSerializer::new(HotRowProtectionConfig {
            mode,
            max_concurrency: concurrency,
            max_queue_size: queue,
            max_global_queue_size: 100,
        }))
    }

    #[tokio::test]
    async fn second_transaction_waits_until_first_releases() {
        let ser = serializer(HotRowProtectionMode::Enable, 1, 10);
        let ctx = Context::background();

        let (first, waited) = ser.wait(&ctx, "t1 where id = 1", "t1").await.unwrap();
        assert!(!waited);

        let ser2 = ser.clone();
        let ctx2 = ctx.clone();
        let second = tokio::spawn(async move {
            let (guard, waited) = ser2.wait(&ctx2, "t1 where id = 1", "t1").await.unwrap();
            drop(guard);
            waited
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second waiter should be queued");

        drop(first);
        assert!(second.await.unwrap(), "second waiter should report waiting");
        assert_eq!(ser.active_keys(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_serialize() {
        let ser = serializer(HotRowProtectionMode::Enable, 1, 10);
        let ctx = Context::background();
        let (_a, waited_a) = ser.wait(&ctx, "t1 where id = 1", "t1").await.unwrap();
        let (_b, waited_b) = ser.wait(&ctx, "t1 where id = 2", "t1").await.unwrap();
        assert!(!waited_a);
        assert!(!waited_b);
    }

    #[tokio::test]
    async fn per_key_queue_limit_rejects_with_resource_exhausted() {
        let ser = serializer(HotRowProtectionMode::Enable, 1, 2);
        let ctx = Context::background();
        let (_running, _) = ser.wait(&ctx, "k", "t1").await.unwrap();

        let ser2 = ser.clone();
        let ctx2 = ctx.clone();
        let _waiting = tokio::spawn(async move {
            // Queue a waiter; the guard is released as soon as it is granted.
            ser2.wait(&ctx2, "k", "t1").await.map(|(_guard, waited)| waited)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = ser.wait(&ctx, "k", "t1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(ser.queue_exceeded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn canceled_waiter_leaves_the_queue() {
        let ser = serializer(HotRowProtectionMode::Enable, 1, 10);
        let ctx = Context::background();
        let (first, _) = ser.wait(&ctx, "k", "t1").await.unwrap();

        let waiter_ctx = Context::background().child_with_timeout(Some(Duration::from_millis(30)));
        let err = ser.wait(&waiter_ctx, "k", "t1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);

        // The abandoned slot must not leak: a new waiter gets through.
        drop(first);
        let (_g, waited) = ser.wait(&ctx, "k", "t1").await.unwrap();
        assert!(!waited);
    }

    #[tokio::test]
    async fn dry_run_reports_but_does_not_block() {
        let ser = serializer(HotRowProtectionMode::DryRun, 1, 10);
        let ctx = Context::background();
        let (_a, _) = ser.wait(&ctx, "k", "t1").await.unwrap();
        let (_b, waited) = ser.wait(&ctx, "k", "t1").await.unwrap();
        assert!(!waited);
        assert_eq!(ser.dry_run_waits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn where_clause_rendering_is_stable() {
        let mut binds = BindVars::new();
        binds.insert("id".to_string(), Value::Int(42));
        binds.insert("name".to_string(), Value::VarChar("a".to_string()));
        let rendered =
            render_where_clause(" where id = :id and name = :name", &binds).unwrap();
        assert_eq!(rendered, " where id = 42 and name = 'a'");
    }

    #[test]
    fn where_clause_missing_bind_is_an_error() {
        let err = render_where_clause(" where id = :missing", &BindVars::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
