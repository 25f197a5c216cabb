//! The tablet server: serving-state lifecycle, request admission and the
//! client-visible query/transaction surface.
//!
//! A `TabletServer` composes the external engines behind a single serving
//! state. State is mutated only under `sm`; long operations (subsystem
//! opens, closes, drains) run with the lock released while the state is
//! parked in `Transitioning` or `ShuttingDown`, which blocks competing
//! transitions. Every admitted request holds a `RequestGuard`; transitions
//! out of `Serving` drain the guard count to zero before completing.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tracing::Instrument;

use crate::config::{DbConfig, TabletConfig};
use crate::engine::{CdcEvent, CdcRowsFrame, EngineResult, Engines};
use crate::error::{convert_error_code, query_as_string, truncate_sql_and_binds, ErrorCode, TabletError};
use crate::health::HealthStreamer;
use crate::history::HistoryRing;
use crate::serializer::{render_where_clause, DoneGuard, TxSerializer};
use crate::stats::{ExecLogRecord, Stats, ThrottledLog};
use crate::types::{
    BindVars, BoundQuery, Context, Done, ExecuteOptions, QueryResult, RealtimeStats,
    StreamHealthResponse, TabletAlias, TabletType, Target, TransactionIsolation,
    TransactionMetadata, Value, Workload, split_margin_comments,
};

/// Shutdown waits at most this multiple of the query timeout before the
/// fatal hook fires. A wedged drain is worse than a crash-and-restart.
const TIME_BOMB_MULTIPLIER: u32 = 10;

const HISTORY_CAPACITY: usize = 10;

/// Serving state of the node. `Transitioning` and `ShuttingDown` are
/// transient and reject competing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Not connected to the backing storage instance.
    NotConnected,
    /// Connected, but not serving queries.
    NotServing,
    /// Serving queries.
    Serving,
    /// A transition to a new serving state is in progress.
    Transitioning,
    /// Draining outstanding requests and transactions.
    ShuttingDown,
}

/// Public name of a state, as reported to health checks and errors.
pub fn state_name(state: ServingState) -> &'static str {
    match state {
        ServingState::NotConnected | ServingState::NotServing | ServingState::Transitioning => {
            "NOT_SERVING"
        }
        ServingState::Serving => "SERVING",
        ServingState::ShuttingDown => "SHUTTING_DOWN",
    }
}

fn state_detail(state: ServingState) -> &'static str {
    match state {
        ServingState::NotConnected => "Not Connected",
        ServingState::NotServing => "Not Serving",
        ServingState::Serving => "",
        ServingState::Transitioning => "Transitioning",
        ServingState::ShuttingDown => "Shutting Down",
    }
}

fn state_info(state: ServingState) -> String {
    if state == ServingState::Serving {
        return "SERVING".to_string();
    }
    format!("{} ({})", state_name(state), state_detail(state))
}

#[derive(Default)]
struct Inflight {
    count: AtomicU64,
}

impl Inflight {
    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_for_zero(&self) {
        loop {
            if self.count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Registration of one in-flight request. Dropping the guard unregisters
/// the request on every exit path, including panics.
pub struct RequestGuard {
    inflight: Arc<Inflight>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inflight.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Watchdog armed for the duration of a shutdown. Dropping it disarms.
struct TimeBomb {
    _disarm: oneshot::Sender<()>,
}

struct SmInner {
    state: ServingState,
    target: Target,
    also_allow: Vec<TabletType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    FullStart,
    ServeNewType,
    GracefulStop,
}

/// Validate a caller-presented target against the node's current target.
/// A missing target is only legal for internally originated requests.
fn check_target(
    ctx: &Context,
    target: Option<&Target>,
    current: &Target,
    also_allow: &[TabletType],
) -> Result<(), TabletError> {
    let Some(target) = target else {
        if ctx.is_local() {
            return Ok(());
        }
        return Err(TabletError::new(ErrorCode::InvalidArgument, "no target"));
    };
    if target.keyspace != current.keyspace {
        return Err(TabletError::new(
            ErrorCode::InvalidArgument,
            format!("invalid keyspace {}", target.keyspace),
        ));
    }
    if target.shard != current.shard {
        return Err(TabletError::new(
            ErrorCode::InvalidArgument,
            format!("invalid shard {}", target.shard),
        ));
    }
    if target.tablet_type != current.tablet_type && !also_allow.contains(&target.tablet_type) {
        return Err(TabletError::new(
            ErrorCode::FailedPrecondition,
            format!(
                "invalid tablet type: {}, want: {} or {:?}",
                target.tablet_type, current.tablet_type, also_allow
            ),
        ));
    }
    Ok(())
}

/// No deadline for zero timeouts, DBA workloads and local requests.
fn derive_timeout(
    ctx: &Context,
    timeout: Duration,
    options: Option<&ExecuteOptions>,
) -> Option<Duration> {
    if timeout.is_zero()
        || options.map(|o| o.workload) == Some(Workload::Dba)
        || ctx.is_local()
    {
        return None;
    }
    Some(timeout)
}

fn done_error(done: Done) -> TabletError {
    match done {
        Done::Canceled => TabletError::new(ErrorCode::Canceled, "context canceled"),
        Done::DeadlineExceeded => TabletError::new(ErrorCode::DeadlineExceeded, "deadline exceeded"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builds a [`TabletServer`] with explicit collaborator injection. Nothing
/// here touches process-wide state, so several servers can share a process.
pub struct TabletServerBuilder {
    config: TabletConfig,
    alias: TabletAlias,
    engines: Engines,
    fatal: Arc<dyn Fn() + Send + Sync>,
}

impl TabletServerBuilder {
    pub fn new(config: TabletConfig, alias: TabletAlias, engines: Engines) -> Self {
        Self {
            config,
            alias,
            engines,
            fatal: Arc::new(|| std::process::abort()),
        }
    }

    /// Replace the action taken when shutdown exceeds the time bomb window.
    pub fn fatal_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.fatal = Arc::new(hook);
        self
    }

    pub fn build(self) -> Arc<TabletServer> {
        let query_timeout_us = self.config.query_timeout.as_micros().min(u128::from(u64::MAX)) as u64;
        Arc::new(TabletServer {
            terse_errors: self.config.terse_errors,
            enable_hot_row_protection: self.config.hot_row_protection_enabled(),
            tx_serializer: Arc::new(TxSerializer::new(self.config.hot_row_protection.clone())),
            config: self.config,
            alias: self.alias,
            query_timeout_us: AtomicU64::new(query_timeout_us),
            sm: Mutex::new(SmInner {
                state: ServingState::NotConnected,
                target: Target::default(),
                also_allow: Vec::new(),
            }),
            lameduck: AtomicBool::new(false),
            inflight: Arc::new(Inflight::default()),
            history: HistoryRing::new(HISTORY_CAPACITY),
            health: HealthStreamer::new(),
            stats: Stats::default(),
            check_mysql_gate: Arc::new(Semaphore::new(1)),
            log_pool_full: ThrottledLog::new(Duration::from_secs(60)),
            log_serializer_key: ThrottledLog::new(Duration::from_secs(60)),
            engines: self.engines,
            fatal: self.fatal,
        })
    }
}

/// The query service node.
pub struct TabletServer {
    config: TabletConfig,
    alias: TabletAlias,
    query_timeout_us: AtomicU64,
    terse_errors: bool,
    enable_hot_row_protection: bool,

    sm: Mutex<SmInner>,
    lameduck: AtomicBool,
    inflight: Arc<Inflight>,
    history: HistoryRing,
    health: HealthStreamer,
    tx_serializer: Arc<TxSerializer>,
    stats: Stats,
    check_mysql_gate: Arc<Semaphore>,
    log_pool_full: ThrottledLog,
    log_serializer_key: ThrottledLog,
    engines: Engines,
    fatal: Arc<dyn Fn() + Send + Sync>,
}

impl TabletServer {
    // ------------------------------------------------------------------
    // State machine.
    // ------------------------------------------------------------------

    pub fn serving_state(&self) -> ServingState {
        self.sm.lock().unwrap().state
    }

    /// Public state name. Lameduck reports `NOT_SERVING` regardless of the
    /// actual state.
    pub fn get_state(&self) -> &'static str {
        if self.lameduck.load(Ordering::SeqCst) {
            return "NOT_SERVING";
        }
        state_name(self.serving_state())
    }

    pub fn is_serving(&self) -> bool {
        self.get_state() == "SERVING"
    }

    pub fn current_target(&self) -> Target {
        self.sm.lock().unwrap().target.clone()
    }

    pub fn alias(&self) -> &TabletAlias {
        &self.alias
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn tx_serializer(&self) -> &Arc<TxSerializer> {
        &self.tx_serializer
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.count()
    }

    pub fn health_subscriber_count(&self) -> usize {
        self.health.subscriber_count()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_micros(self.query_timeout_us.load(Ordering::SeqCst))
    }

    pub fn set_query_timeout(&self, timeout: Duration) {
        let us = timeout.as_micros().min(u128::from(u64::MAX)) as u64;
        self.query_timeout_us.store(us, Ordering::SeqCst);
    }

    /// Report unhealthy to load balancers while continuing to serve.
    pub fn enter_lameduck(&self) {
        self.lameduck.store(true, Ordering::SeqCst);
    }

    pub fn exit_lameduck(&self) {
        self.lameduck.store(false, Ordering::SeqCst);
    }

    fn set_state_locked(&self, sm: &mut SmInner, state: ServingState) {
        tracing::info!(
            from = %state_info(sm.state),
            to = %state_info(state),
            "tablet server state change"
        );
        sm.state = state;
        self.history
            .add(&state_info(state), sm.target.tablet_type.name());
    }

    fn transition(&self, state: ServingState) {
        let mut sm = self.sm.lock().unwrap();
        self.set_state_locked(&mut sm, state);
    }

    /// Operator status document.
    pub fn status_json(&self) -> Result<String, TabletError> {
        let (state, target, also_allow) = {
            let sm = self.sm.lock().unwrap();
            (sm.state, sm.target.clone(), sm.also_allow.clone())
        };
        let doc = serde_json::json!({
            "state": state_name(state),
            "detail": state_detail(state),
            "lameduck": self.lameduck.load(Ordering::SeqCst),
            "target": target,
            "also_allow": also_allow,
            "history": self.history.records(),
        });
        serde_json::to_string_pretty(&doc)
            .map_err(|err| TabletError::new(ErrorCode::Internal, err.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle.
    // ------------------------------------------------------------------

    /// Record the target and forward connection parameters to the
    /// subsystems. Must be called once before the first transition.
    pub fn init_db_config(&self, target: Target, db_config: &DbConfig) -> Result<(), TabletError> {
        let mut sm = self.sm.lock().unwrap();
        if sm.state != ServingState::NotConnected {
            return Err(TabletError::new(
                ErrorCode::Unknown,
                format!("init_db_config failed, current state: {}", state_name(sm.state)),
            ));
        }
        sm.target = target.clone();
        self.engines.schema.init_db_config(db_config);
        self.engines.heartbeat_writer.init_db_config(&target);
        self.engines.heartbeat_reader.init_db_config(&target);
        self.engines.tx_throttler.init_db_config(&target);
        Ok(())
    }

    /// `init_db_config` followed by a serving transition to the target's
    /// tablet type.
    pub async fn start_service(
        &self,
        target: Target,
        db_config: &DbConfig,
    ) -> Result<(), TabletError> {
        let tablet_type = target.tablet_type;
        self.init_db_config(target, db_config)?;
        self.set_serving_type(tablet_type, true, Vec::new())
            .await
            .map(|_changed| ())
    }

    /// Change the primary serving type and serving state, opening or closing
    /// subsystems as required. Returns whether the state changed. Always
    /// clears lameduck.
    pub async fn set_serving_type(
        &self,
        tablet_type: TabletType,
        serving: bool,
        also_allow: Vec<TabletType>,
    ) -> Result<bool, TabletError> {
        let result = self.transition_to(tablet_type, serving, also_allow).await;
        self.exit_lameduck();
        result
    }

    async fn transition_to(
        &self,
        tablet_type: TabletType,
        serving: bool,
        also_allow: Vec<TabletType>,
    ) -> Result<bool, TabletError> {
        match self.decide_action(tablet_type, serving, also_allow)? {
            Action::None => Ok(false),
            Action::FullStart => {
                if let Err(err) = self.full_start().await {
                    self.close_all().await;
                    return Err(err);
                }
                Ok(true)
            }
            Action::ServeNewType => {
                if let Err(err) = self.serve_new_type().await {
                    self.close_all().await;
                    return Err(err);
                }
                Ok(true)
            }
            Action::GracefulStop => {
                self.graceful_stop().await;
                Ok(true)
            }
        }
    }

    fn decide_action(
        &self,
        tablet_type: TabletType,
        serving: bool,
        also_allow: Vec<TabletType>,
    ) -> Result<Action, TabletError> {
        let mut sm = self.sm.lock().unwrap();
        sm.also_allow = also_allow;

        // Same type, already serving: nothing to do. There is no shortcut
        // for serving=false because the not-serving states differ.
        if sm.target.tablet_type == tablet_type && serving && sm.state == ServingState::Serving {
            return Ok(Action::None);
        }
        sm.target.tablet_type = tablet_type;
        match sm.state {
            ServingState::NotConnected => {
                if serving {
                    self.set_state_locked(&mut sm, ServingState::Transitioning);
                    return Ok(Action::FullStart);
                }
                Ok(Action::None)
            }
            ServingState::NotServing => {
                if serving {
                    self.set_state_locked(&mut sm, ServingState::Transitioning);
                    return Ok(Action::ServeNewType);
                }
                Ok(Action::None)
            }
            ServingState::Serving => {
                if !serving {
                    self.set_state_locked(&mut sm, ServingState::ShuttingDown);
                    return Ok(Action::GracefulStop);
                }
                self.set_state_locked(&mut sm, ServingState::Transitioning);
                Ok(Action::ServeNewType)
            }
            ServingState::Transitioning | ServingState::ShuttingDown => Err(TabletError::new(
                ErrorCode::FailedPrecondition,
                format!("cannot change serving type, current state: {}", state_name(sm.state)),
            )),
        }
    }

    async fn full_start(&self) -> Result<(), TabletError> {
        if !self.engines.query.is_reachable().await {
            return Err(TabletError::new(
                ErrorCode::Unavailable,
                "cannot connect to the backing storage instance",
            ));
        }
        self.engines.schema.open().await?;
        let (keyspace, cell) = {
            let sm = self.sm.lock().unwrap();
            (sm.target.keyspace.clone(), self.alias.cell.clone())
        };
        self.engines.cdc.open(&keyspace, &cell).await;
        self.engines.query.open().await?;
        self.engines.tx_throttler.open().await?;
        self.engines.tx.init().await?;
        self.serve_new_type().await
    }

    async fn serve_new_type(&self) -> Result<(), TabletError> {
        let tablet_type = self.sm.lock().unwrap().target.tablet_type;
        if tablet_type == TabletType::Master {
            self.engines.watcher.close().await;
            self.engines.heartbeat_reader.close().await;

            self.engines.heartbeat_writer.open().await?;
            self.engines.tracker.open().await;
            self.engines.tx.accept_read_write();
            self.engines.messager.open().await;
        } else {
            self.engines.messager.close().await;
            self.engines.tx.accept_read_only();
            self.engines.tracker.close().await;
            self.engines.heartbeat_writer.close().await;
            self.engines.schema.make_non_master();

            self.engines.heartbeat_reader.open().await;
            self.engines.watcher.open().await;
        }
        self.transition(ServingState::Serving);
        Ok(())
    }

    async fn graceful_stop(&self) {
        let _bomb = self.arm_time_bomb();
        self.wait_for_shutdown().await;
        self.transition(ServingState::NotServing);
    }

    /// Forced stop from any stable state: drain, then close everything.
    /// Called before process termination or when the backing storage is
    /// unreachable. Under normal circumstances use `set_serving_type`.
    pub async fn stop_service(&self) {
        {
            let mut sm = self.sm.lock().unwrap();
            if sm.state != ServingState::Serving && sm.state != ServingState::NotServing {
                return;
            }
            self.set_state_locked(&mut sm, ServingState::ShuttingDown);
        }
        let _bomb = self.arm_time_bomb();
        tracing::info!("executing complete shutdown");
        self.wait_for_shutdown().await;
        self.engines.query.close().await;
        self.engines.watcher.close().await;
        self.engines.cdc.close().await;
        self.engines.heartbeat_reader.close().await;
        self.engines.heartbeat_writer.close().await;
        self.engines.schema.close().await;
        tracing::info!("shutdown complete");
        self.transition(ServingState::NotConnected);
    }

    async fn wait_for_shutdown(&self) {
        self.engines.messager.close().await;
        self.engines.tx.close().await;
        self.engines.tx_throttler.close().await;
        self.engines.tracker.close().await;
        self.engines.query.stop_serving();
        self.inflight.wait_for_zero().await;
    }

    /// Forcibly close every subsystem. Used when a start fails part-way.
    /// Idempotent, ends in `NotConnected`.
    async fn close_all(&self) {
        self.engines.messager.close().await;
        self.engines.tx.close().await;
        self.engines.tx_throttler.close().await;
        self.engines.query.stop_serving();
        self.engines.query.close().await;
        self.engines.watcher.close().await;
        self.engines.tracker.close().await;
        self.engines.cdc.close().await;
        self.engines.heartbeat_reader.close().await;
        self.engines.heartbeat_writer.close().await;
        self.engines.schema.close().await;
        self.transition(ServingState::NotConnected);
    }

    fn arm_time_bomb(&self) -> Option<TimeBomb> {
        let timeout = self.query_timeout();
        if timeout.is_zero() {
            return None;
        }
        let (disarm, fired) = oneshot::channel::<()>();
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout * TIME_BOMB_MULTIPLIER) => {
                    tracing::error!("shutdown took too long, terminating the process");
                    fatal();
                }
                _ = fired => {}
            }
        });
        Some(TimeBomb { _disarm: disarm })
    }

    // ------------------------------------------------------------------
    // Request gate and envelope.
    // ------------------------------------------------------------------

    /// Admit a request: state check, target check, then registration
    /// against the drain counter. Every successful call returns a guard
    /// whose drop is the matching `end_request`.
    pub fn start_request(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        allow_on_shutdown: bool,
    ) -> Result<RequestGuard, TabletError> {
        let sm = self.sm.lock().unwrap();
        let admitted = sm.state == ServingState::Serving
            || (allow_on_shutdown && sm.state == ServingState::ShuttingDown);
        if !admitted {
            return Err(TabletError::new(
                ErrorCode::FailedPrecondition,
                format!("operation not allowed in state {}", state_name(sm.state)),
            ));
        }
        check_target(ctx, target, &sm.target, &sm.also_allow)?;
        Ok(self.register_request())
    }

    fn register_request(&self) -> RequestGuard {
        self.inflight.count.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            inflight: Arc::clone(&self.inflight),
        }
    }

    /// Target check without the serving-state check; long-lived CDC streams
    /// use this so they survive non-serving states.
    pub fn verify_target(&self, ctx: &Context, target: Option<&Target>) -> Result<(), TabletError> {
        let sm = self.sm.lock().unwrap();
        check_target(ctx, target, &sm.target, &sm.also_allow)
    }

    /// The uniform request envelope: span, log record, admission, deadline,
    /// panic isolation and error classification.
    async fn exec_request<T, F, Fut>(
        &self,
        ctx: &Context,
        timeout: Duration,
        method: &str,
        sql: &str,
        bind_vars: Option<&BindVars>,
        target: Option<&Target>,
        options: Option<&ExecuteOptions>,
        allow_on_shutdown: bool,
        body: F,
    ) -> Result<T, TabletError>
    where
        F: FnOnce(Context, Arc<Mutex<ExecLogRecord>>) -> Fut,
        Fut: std::future::Future<Output = Result<T, TabletError>>,
    {
        let span = tracing::info_span!(
            "tablet_request",
            operation = method,
            keyspace = target.map(|t| t.keyspace.as_str()).unwrap_or(""),
            shard = target.map(|t| t.shard.as_str()).unwrap_or(""),
            sql,
        );
        async {
            let start = Instant::now();
            let record = Arc::new(Mutex::new(ExecLogRecord::new(method, sql)));
            {
                let mut rec = record.lock().unwrap();
                rec.target = target.cloned();
                if let Some(bind_vars) = bind_vars {
                    rec.bind_vars = bind_vars.clone();
                }
            }

            let guard = match self.start_request(ctx, target, allow_on_shutdown) {
                Ok(guard) => guard,
                Err(err) => {
                    record.lock().unwrap().send(start);
                    return Err(err);
                }
            };

            let child = ctx.child_with_timeout(derive_timeout(ctx, timeout, options));
            let result = tokio::select! {
                outcome = AssertUnwindSafe(body(child.clone(), record.clone())).catch_unwind() => {
                    match outcome {
                        Ok(inner) => inner,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            self.stats.internal_errors.add("Panic", 1);
                            tracing::error!(method, panic = %message, "uncaught panic in request");
                            Err(TabletError::new(
                                ErrorCode::Unknown,
                                format!(
                                    "uncaught panic: {message} for {}",
                                    query_as_string(sql, &bind_vars.cloned().unwrap_or_default())
                                ),
                            ))
                        }
                    }
                }
                done = child.done() => Err(done_error(done)),
            };
            child.cancel();
            drop(guard);

            let result = result.map_err(|err| {
                self.convert_and_log_error(ctx, sql, bind_vars, err, &record)
            });
            record.lock().unwrap().send(start);
            result
        }
        .instrument(span)
        .await
    }

    /// Classify an error into the public code set, count it, log it at the
    /// code-appropriate severity and apply terse-mode redaction.
    fn convert_and_log_error(
        &self,
        ctx: &Context,
        sql: &str,
        bind_vars: Option<&BindVars>,
        err: TabletError,
        record: &Arc<Mutex<ExecLogRecord>>,
    ) -> TabletError {
        let code = convert_error_code(&err);
        self.stats.error_counters.add(code.name(), 1);

        let caller = ctx
            .caller_id()
            .map(|id| format!(" (CallerID: {id})"))
            .unwrap_or_default();
        let empty_binds = BindVars::new();
        let binds = bind_vars.unwrap_or(&empty_binds);
        let have_binds = !binds.is_empty();
        let redact = self.terse_errors && have_binds && code != ErrorCode::FailedPrecondition;

        let (returned, log_message) = match err.sql_error() {
            Some(sql_err) => {
                let prefix = format!("(errno {}) (sqlstate {})", sql_err.num, sql_err.sql_state);
                let log_message = format!(
                    "{} {prefix}{caller}: {}",
                    sql_err.message,
                    truncate_sql_and_binds(sql, binds, self.config.max_error_sql_len)
                );
                let returned = if redact {
                    err.clone().with_code(code).with_message(format!(
                        "{prefix}{caller}: {}",
                        query_as_string(sql, &empty_binds)
                    ))
                } else {
                    err.clone().with_code(code).with_message(format!(
                        "{} {prefix}{caller}: {}",
                        sql_err.message,
                        query_as_string(sql, binds)
                    ))
                };
                (returned, log_message)
            }
            None => {
                let returned = err
                    .clone()
                    .with_code(code)
                    .with_message(format!("{}{caller}", err.message()));
                let logged_binds = if redact { &empty_binds } else { binds };
                let log_message = format!(
                    "{}: {}",
                    returned.message(),
                    truncate_sql_and_binds(sql, logged_binds, self.config.max_error_sql_len)
                );
                (returned, log_message)
            }
        };

        match code {
            ErrorCode::FailedPrecondition | ErrorCode::AlreadyExists => {}
            ErrorCode::ResourceExhausted => {
                if self.log_pool_full.ready() {
                    tracing::warn!(code = code.name(), "{log_message}");
                }
            }
            ErrorCode::Aborted => tracing::warn!(code = code.name(), "{log_message}"),
            ErrorCode::InvalidArgument | ErrorCode::DeadlineExceeded => {
                tracing::info!(code = code.name(), "{log_message}")
            }
            _ => tracing::error!(code = code.name(), "{log_message}"),
        }

        record.lock().unwrap().error = Some(returned.message().to_string());
        returned
    }

    // ------------------------------------------------------------------
    // Transactions.
    // ------------------------------------------------------------------

    /// Start a transaction. Returns the transaction id and this node's
    /// alias so the caller can address the transaction back to us.
    pub async fn begin(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        options: &ExecuteOptions,
    ) -> Result<(i64, TabletAlias), TabletError> {
        self.begin_with(ctx, target, &[], 0, options).await
    }

    async fn begin_with(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        pre_queries: &[String],
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> Result<(i64, TabletAlias), TabletError> {
        let transaction_id = self
            .exec_request(
                ctx,
                self.query_timeout(),
                "Begin",
                "begin",
                None,
                target,
                Some(options),
                false,
                |ctx, record| async move {
                    let start = Instant::now();
                    if self.engines.tx_throttler.throttle() {
                        return Err(TabletError::new(
                            ErrorCode::ResourceExhausted,
                            "Transaction throttled",
                        ));
                    }
                    let (transaction_id, begin_sql) = self
                        .engines
                        .tx
                        .begin(&ctx, pre_queries, reserved_id, options)
                        .await?;
                    {
                        let mut rec = record.lock().unwrap();
                        rec.transaction_id = transaction_id;
                        rec.reserved_id = reserved_id;
                        rec.original_sql = begin_sql.clone();
                        // A pool slot without BEGIN is a no-op; keep it out
                        // of the query log and the timings.
                        if begin_sql.is_empty() {
                            rec.method.clear();
                        }
                    }
                    if !begin_sql.is_empty() {
                        self.stats.query_timings.record("BEGIN", start);
                    }
                    Ok(transaction_id)
                },
            )
            .await?;
        Ok((transaction_id, self.alias.clone()))
    }

    /// Commit a transaction. A non-zero return is the reserved-connection
    /// id that outlives the transaction.
    pub async fn commit(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        transaction_id: i64,
    ) -> Result<i64, TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Commit",
            "commit",
            None,
            target,
            None,
            true,
            |ctx, record| async move {
                let start = Instant::now();
                record.lock().unwrap().transaction_id = transaction_id;
                let (new_reserved_id, commit_sql) =
                    self.engines.tx.commit(&ctx, transaction_id).await?;
                {
                    let mut rec = record.lock().unwrap();
                    if new_reserved_id > 0 {
                        // Commit ran on a reserved connection.
                        rec.reserved_id = transaction_id;
                    }
                    if commit_sql.is_empty() {
                        rec.method.clear();
                    }
                }
                if !commit_sql.is_empty() {
                    self.stats.query_timings.record("COMMIT", start);
                }
                Ok(new_reserved_id)
            },
        )
        .await
    }

    /// Roll back a transaction. See [`commit`] for the return value.
    ///
    /// [`commit`]: TabletServer::commit
    pub async fn rollback(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        transaction_id: i64,
    ) -> Result<i64, TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Rollback",
            "rollback",
            None,
            target,
            None,
            true,
            |ctx, record| async move {
                let start = Instant::now();
                record.lock().unwrap().transaction_id = transaction_id;
                let result = self.engines.tx.rollback(&ctx, transaction_id).await;
                self.stats.query_timings.record("ROLLBACK", start);
                let new_reserved_id = result?;
                if new_reserved_id > 0 {
                    record.lock().unwrap().reserved_id = transaction_id;
                }
                Ok(new_reserved_id)
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Two-phase commit coordinator surface. All of these resolve in-flight
    // distributed transactions, so they stay available during the drain.
    // ------------------------------------------------------------------

    pub async fn prepare(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        transaction_id: i64,
        dtid: &str,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Prepare",
            "prepare",
            None,
            target,
            None,
            true,
            |ctx, _record| async move { self.engines.tx.prepare(&ctx, transaction_id, dtid).await },
        )
        .await
    }

    pub async fn commit_prepared(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "CommitPrepared",
            "commit_prepared",
            None,
            target,
            None,
            true,
            |ctx, _record| async move { self.engines.tx.commit_prepared(&ctx, dtid).await },
        )
        .await
    }

    pub async fn rollback_prepared(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
        original_id: i64,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "RollbackPrepared",
            "rollback_prepared",
            None,
            target,
            None,
            true,
            |ctx, _record| async move {
                self.engines.tx.rollback_prepared(&ctx, dtid, original_id).await
            },
        )
        .await
    }

    pub async fn create_transaction(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
        participants: &[Target],
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "CreateTransaction",
            "create_transaction",
            None,
            target,
            None,
            true,
            |ctx, _record| async move {
                self.engines.tx.create_transaction(&ctx, dtid, participants).await
            },
        )
        .await
    }

    pub async fn start_commit(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        transaction_id: i64,
        dtid: &str,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "StartCommit",
            "start_commit",
            None,
            target,
            None,
            true,
            |ctx, _record| async move {
                self.engines.tx.start_commit(&ctx, transaction_id, dtid).await
            },
        )
        .await
    }

    pub async fn set_rollback(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
        transaction_id: i64,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "SetRollback",
            "set_rollback",
            None,
            target,
            None,
            true,
            |ctx, _record| async move {
                self.engines.tx.set_rollback(&ctx, dtid, transaction_id).await
            },
        )
        .await
    }

    pub async fn conclude_transaction(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "ConcludeTransaction",
            "conclude_transaction",
            None,
            target,
            None,
            true,
            |ctx, _record| async move { self.engines.tx.conclude_transaction(&ctx, dtid).await },
        )
        .await
    }

    pub async fn read_transaction(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        dtid: &str,
    ) -> Result<TransactionMetadata, TabletError> {
        self.exec_request(
            ctx,
            self.query_timeout(),
            "ReadTransaction",
            "read_transaction",
            None,
            target,
            None,
            true,
            |ctx, _record| async move { self.engines.tx.read_transaction(&ctx, dtid).await },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Query execution.
    // ------------------------------------------------------------------

    /// Execute a query, optionally inside a transaction or on a reserved
    /// connection. Allowed during shutdown only for transactional calls.
    pub async fn execute(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, TabletError> {
        if transaction_id != 0 && reserved_id != 0 && transaction_id != reserved_id {
            return Err(TabletError::new(
                ErrorCode::Internal,
                "transaction id and reserved id must match if both are non-zero",
            ));
        }
        let allow_on_shutdown = transaction_id != 0;
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Execute",
            sql,
            Some(bind_vars),
            target,
            Some(options),
            allow_on_shutdown,
            |ctx, record| async move {
                let (query, _comments) = split_margin_comments(sql);
                let plan = self
                    .engines
                    .query
                    .get_plan(&ctx, &query, options.skip_query_plan_cache)
                    .await?;
                // If both ids are non-zero they are equal, so either works.
                let conn_id = if transaction_id != 0 {
                    transaction_id
                } else {
                    reserved_id
                };
                {
                    let mut rec = record.lock().unwrap();
                    rec.transaction_id = transaction_id;
                    rec.reserved_id = reserved_id;
                }
                let result = self
                    .engines
                    .query
                    .execute(&ctx, plan, &query, bind_vars, conn_id, options)
                    .await?;
                Ok(result.strip_metadata(options.included_fields))
            },
        )
        .await
    }

    /// Execute a query and stream results to `send`. The first frame
    /// carries fields only, the rest rows only. Runs without a deadline.
    pub async fn stream_execute(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        options: &ExecuteOptions,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            Duration::ZERO,
            "StreamExecute",
            sql,
            Some(bind_vars),
            target,
            Some(options),
            false,
            |ctx, _record| async move {
                let (query, _comments) = split_margin_comments(sql);
                let plan = self.engines.query.get_stream_plan(&query)?;
                self.engines
                    .query
                    .stream_execute(&ctx, plan, &query, bind_vars, transaction_id, options, send)
                    .await
            },
        )
        .await
    }

    /// Execute a batch, optionally as one independent transaction with an
    /// implicit begin/commit and a rollback on failure.
    pub async fn execute_batch(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        queries: &[BoundQuery],
        as_transaction: bool,
        transaction_id: i64,
        options: &ExecuteOptions,
    ) -> Result<Vec<QueryResult>, TabletError> {
        if queries.is_empty() {
            return Err(TabletError::new(ErrorCode::InvalidArgument, "empty query list"));
        }
        if as_transaction && transaction_id != 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidArgument,
                "cannot start a new transaction in the scope of an existing one",
            ));
        }

        // The hot-row gate runs before this call registers with the drain
        // counter; the serializer wait registers itself, and the two
        // registrations must not overlap.
        let _hot_row_done = if self.enable_hot_row_protection && as_transaction {
            self.begin_wait_for_same_range_transactions(
                ctx,
                target,
                options,
                &queries[0].sql,
                &queries[0].bind_vars,
            )
            .await?
        } else {
            None
        };

        let allow_on_shutdown = transaction_id != 0;
        let _guard = self.start_request(ctx, target, allow_on_shutdown)?;

        let mut options = options.clone();
        // Passthrough DMLs can skip BEGIN/COMMIT entirely: an autocommit
        // slot gives better throughput. Keyed off the first query's options
        // even though it applies to the whole batch.
        if options.transaction_isolation == TransactionIsolation::Default
            && as_transaction
            && self.config.passthrough_dmls
        {
            options.transaction_isolation = TransactionIsolation::Autocommit;
        }

        let mut tx_id = transaction_id;
        if as_transaction {
            // The alias is irrelevant: this transaction never leaves the call.
            let (id, _alias) = self.begin(ctx, target, &options).await?;
            tx_id = id;
        }

        let mut results = Vec::with_capacity(queries.len());
        let mut failure: Option<TabletError> = None;
        for bound in queries {
            match self
                .execute(ctx, target, &bound.sql, &bound.bind_vars, tx_id, 0, &options)
                .await
            {
                Ok(result) => results.push(result),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_none() && as_transaction {
            match self.commit(ctx, target, tx_id).await {
                Ok(_) => tx_id = 0,
                Err(err) => {
                    // The engine owns cleanup of a failed commit; do not
                    // also roll back.
                    tx_id = 0;
                    failure = Some(err);
                }
            }
        }
        if let Some(err) = failure {
            if as_transaction && tx_id != 0 {
                let _ = self.rollback(ctx, target, tx_id).await;
            }
            return Err(err);
        }
        Ok(results)
    }

    /// Begin a transaction and execute the first statement in it. On an
    /// execution error the new transaction stays live and its id rides on
    /// the returned error for the caller to resolve.
    pub async fn begin_execute(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        pre_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> Result<(QueryResult, i64, TabletAlias), TabletError> {
        // Reserved connections are already pinned; serializing them would
        // only add latency.
        let _hot_row_done = if self.enable_hot_row_protection && reserved_id == 0 {
            self.begin_wait_for_same_range_transactions(ctx, target, options, sql, bind_vars)
                .await?
        } else {
            None
        };

        let (transaction_id, alias) = self
            .begin_with(ctx, target, pre_queries, reserved_id, options)
            .await?;
        match self
            .execute(ctx, target, sql, bind_vars, transaction_id, reserved_id, options)
            .await
        {
            Ok(result) => Ok((result, transaction_id, alias)),
            Err(err) => Err(err.with_transaction_id(transaction_id)),
        }
    }

    /// Begin a transaction and execute a batch in it. As with
    /// [`begin_execute`], a failed batch leaves the transaction live and
    /// reports its id on the error.
    ///
    /// [`begin_execute`]: TabletServer::begin_execute
    pub async fn begin_execute_batch(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        queries: &[BoundQuery],
        as_transaction: bool,
        options: &ExecuteOptions,
    ) -> Result<(Vec<QueryResult>, i64, TabletAlias), TabletError> {
        // TODO: hot-row protection does not cover this path yet; gate it the
        // way begin_execute does once the batch key derivation is settled.
        let (transaction_id, alias) = self.begin(ctx, target, options).await?;
        match self
            .execute_batch(ctx, target, queries, as_transaction, transaction_id, options)
            .await
        {
            Ok(results) => Ok((results, transaction_id, alias)),
            Err(err) => Err(err.with_transaction_id(transaction_id)),
        }
    }

    /// Pin a connection, begin a transaction on it and execute. Transaction
    /// id and reserved id are the same connection. A failed execute does
    /// not unpin the connection: the ids ride on the error and the session
    /// may retry on the same connection or release it explicitly.
    pub async fn reserve_begin_execute(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        sql: &str,
        pre_queries: &[String],
        bind_vars: &BindVars,
        options: &ExecuteOptions,
    ) -> Result<(QueryResult, i64, i64, TabletAlias), TabletError> {
        let conn_id = self
            .exec_request(
                ctx,
                self.query_timeout(),
                "ReserveBegin",
                "begin",
                Some(bind_vars),
                target,
                Some(options),
                false,
                |ctx, record| async move {
                    let start = Instant::now();
                    let conn_id = self.engines.tx.reserve_begin(&ctx, options, pre_queries).await?;
                    {
                        let mut rec = record.lock().unwrap();
                        rec.transaction_id = conn_id;
                        rec.reserved_id = conn_id;
                    }
                    self.stats.query_timings.record("RESERVE", start);
                    Ok(conn_id)
                },
            )
            .await?;

        match self
            .execute(ctx, target, sql, bind_vars, conn_id, conn_id, options)
            .await
        {
            Ok(result) => Ok((result, conn_id, conn_id, self.alias.clone())),
            Err(err) => Err(err.with_transaction_id(conn_id).with_reserved_id(conn_id)),
        }
    }

    /// Pin a connection (adopting `transaction_id` if non-zero) and execute.
    /// A failed execute leaves the connection pinned; its id rides on the
    /// error.
    pub async fn reserve_execute(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        sql: &str,
        pre_queries: &[String],
        bind_vars: &BindVars,
        transaction_id: i64,
        options: &ExecuteOptions,
    ) -> Result<(QueryResult, i64, TabletAlias), TabletError> {
        let conn_id = self
            .exec_request(
                ctx,
                self.query_timeout(),
                "Reserve",
                "",
                Some(bind_vars),
                target,
                Some(options),
                false,
                |ctx, record| async move {
                    let start = Instant::now();
                    let conn_id = self
                        .engines
                        .tx
                        .reserve(&ctx, options, transaction_id, pre_queries)
                        .await?;
                    {
                        let mut rec = record.lock().unwrap();
                        rec.transaction_id = transaction_id;
                        rec.reserved_id = conn_id;
                    }
                    self.stats.query_timings.record("RESERVE", start);
                    Ok(conn_id)
                },
            )
            .await?;

        match self
            .execute(ctx, target, sql, bind_vars, conn_id, conn_id, options)
            .await
        {
            Ok(result) => Ok((result, conn_id, self.alias.clone())),
            Err(err) => Err(err.with_transaction_id(transaction_id).with_reserved_id(conn_id)),
        }
    }

    /// Release a reserved connection (also rolling back any transaction on
    /// it), or roll back a plain transaction. At least one id is required.
    pub async fn release(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        transaction_id: i64,
        reserved_id: i64,
    ) -> Result<(), TabletError> {
        if reserved_id == 0 && transaction_id == 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidArgument,
                "connection id and transaction id are both absent",
            ));
        }
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Release",
            "",
            None,
            target,
            None,
            true,
            |ctx, record| async move {
                let start = Instant::now();
                {
                    let mut rec = record.lock().unwrap();
                    rec.transaction_id = transaction_id;
                    rec.reserved_id = reserved_id;
                }
                let result = if reserved_id != 0 {
                    self.engines.tx.release(&ctx, reserved_id).await
                } else {
                    // No pinned connection: clean up the transaction before
                    // its slot returns to the pool.
                    self.engines.tx.rollback(&ctx, transaction_id).await.map(|_| ())
                };
                self.stats.query_timings.record("RELEASE", start);
                result
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Hot-row serializer gate.
    // ------------------------------------------------------------------

    /// Wait until transactions targeting the same row (range) have drained
    /// below the concurrency limit. Returns the release guard, or `None`
    /// when the query is not subject to serialization.
    async fn begin_wait_for_same_range_transactions(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        options: &ExecuteOptions,
        sql: &str,
        bind_vars: &BindVars,
    ) -> Result<Option<DoneGuard<'_>>, TabletError> {
        // The (potentially longer) query timeout bounds the wait, not the
        // transaction-pool timeout.
        self.exec_request(
            ctx,
            self.query_timeout(),
            "",
            "waitForSameRangeTransactions",
            None,
            target,
            Some(options),
            false,
            |ctx, _record| async move {
                let (key, table) = self.compute_tx_serializer_key(&ctx, sql, bind_vars).await;
                if key.is_empty() {
                    return Ok(None);
                }
                let start = Instant::now();
                let (done, waited) = self.tx_serializer.wait(&ctx, &key, &table).await?;
                if waited {
                    self.stats.wait_timings.record("TxSerializer", start);
                }
                Ok(Some(done))
            },
        )
        .await
    }

    /// Derive the hot-row key `"<table><rendered where>"` for a query, or
    /// empty when the query does not qualify for serialization.
    async fn compute_tx_serializer_key(
        &self,
        ctx: &Context,
        sql: &str,
        bind_vars: &BindVars,
    ) -> (String, String) {
        // Strip trailing comments so we don't pollute the plan cache.
        let (query, _comments) = split_margin_comments(sql);
        let plan = match self.engines.query.get_plan(ctx, &query, false).await {
            Ok(plan) => plan,
            Err(err) => {
                if self.log_serializer_key.ready() {
                    tracing::error!(query = %query, error = %err, "failed to get plan for hot row key");
                }
                return (String::new(), String::new());
            }
        };
        if !plan.kind.is_serializable_dml() || plan.table_name.is_empty() {
            return (String::new(), String::new());
        }
        let Some(template) = &plan.where_template else {
            return (String::new(), String::new());
        };
        match render_where_clause(template, bind_vars) {
            // Example: "t1 where id = 1 and sub_id = 2"
            Ok(where_clause) => (
                format!("{}{}", plan.table_name, where_clause),
                plan.table_name.clone(),
            ),
            Err(err) => {
                if self.log_serializer_key.ready() {
                    tracing::error!(query = %query, error = %err, "failed to substitute bind vars in where clause");
                }
                (String::new(), String::new())
            }
        }
    }

    // ------------------------------------------------------------------
    // Message-table surface.
    // ------------------------------------------------------------------

    /// Stream messages from a message table.
    pub async fn message_stream(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        name: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> Result<(), TabletError> {
        self.exec_request(
            ctx,
            Duration::ZERO,
            "MessageStream",
            "stream",
            None,
            target,
            None,
            false,
            |ctx, _record| async move { self.engines.messager.stream(&ctx, name, send).await },
        )
        .await
    }

    /// Ack messages; returns how many rows the generated DML touched.
    pub async fn message_ack(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        name: &str,
        ids: &[Value],
    ) -> Result<u64, TabletError> {
        let string_ids: Vec<String> = ids.iter().map(Value::as_raw_string).collect();
        let count = self
            .exec_dml(ctx, target, || {
                self.engines.messager.generate_ack_query(name, &string_ids)
            })
            .await?;
        self.stats
            .message_counters
            .add(&format!("{name}.Acked"), count);
        Ok(count)
    }

    pub async fn postpone_messages(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        name: &str,
        ids: &[String],
    ) -> Result<u64, TabletError> {
        self.exec_dml(ctx, target, || {
            self.engines.messager.generate_postpone_query(name, ids)
        })
        .await
    }

    /// Purge acked messages older than `time_cutoff` (unix nanoseconds).
    pub async fn purge_messages(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        name: &str,
        time_cutoff: i64,
    ) -> Result<u64, TabletError> {
        self.exec_dml(ctx, target, || {
            self.engines.messager.generate_purge_query(name, time_cutoff)
        })
        .await
    }

    /// Run a generated DML inside an implicit transaction and report the
    /// affected row count.
    async fn exec_dml<F>(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        generate: F,
    ) -> Result<u64, TabletError>
    where
        F: FnOnce() -> EngineResult<(String, BindVars)>,
    {
        let _guard = self.start_request(ctx, target, false)?;

        let (query, bind_vars) = generate()
            .map_err(|err| TabletError::new(ErrorCode::InvalidArgument, err.message().to_string()))?;

        let (tx_id, _alias) = self.begin(ctx, target, &ExecuteOptions::default()).await?;
        let executed = self
            .execute(ctx, target, &query, &bind_vars, tx_id, 0, &ExecuteOptions::default())
            .await;
        match executed {
            Ok(result) => {
                self.commit(ctx, target, tx_id).await?;
                Ok(result.rows_affected)
            }
            Err(err) => {
                let _ = self.rollback(ctx, target, tx_id).await;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // CDC streams. These bypass the request gate so they keep working in
    // non-serving states, but the target must still match.
    // ------------------------------------------------------------------

    pub async fn vstream(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        start_pos: &str,
        send: &mut (dyn FnMut(Vec<CdcEvent>) -> EngineResult<()> + Send),
    ) -> Result<(), TabletError> {
        self.verify_target(ctx, target)?;
        self.engines.cdc.stream(ctx, start_pos, send).await
    }

    pub async fn vstream_rows(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        query: &str,
        lastpk: Option<QueryResult>,
        send: &mut (dyn FnMut(CdcRowsFrame) -> EngineResult<()> + Send),
    ) -> Result<(), TabletError> {
        self.verify_target(ctx, target)?;
        let row = match lastpk {
            Some(result) => {
                if result.rows.len() != 1 {
                    return Err(TabletError::new(
                        ErrorCode::InvalidArgument,
                        format!("unexpected lastpk input: {} rows", result.rows.len()),
                    ));
                }
                result.rows.into_iter().next().unwrap_or_default()
            }
            None => Vec::new(),
        };
        self.engines.cdc.stream_rows(ctx, query, row, send).await
    }

    pub async fn vstream_results(
        &self,
        ctx: &Context,
        target: Option<&Target>,
        query: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> Result<(), TabletError> {
        self.verify_target(ctx, target)?;
        self.engines.cdc.stream_results(ctx, query, send).await
    }

    // ------------------------------------------------------------------
    // Health.
    // ------------------------------------------------------------------

    /// Stream health snapshots to `callback` until it asks to stop or the
    /// context ends. A fresh cached snapshot is replayed immediately.
    pub async fn stream_health(
        &self,
        ctx: &Context,
        callback: &mut (dyn FnMut(&StreamHealthResponse) -> ControlFlow<()> + Send),
    ) -> Result<(), TabletError> {
        if let Some(cached) = self.health.cached() {
            if callback(&cached).is_break() {
                return Ok(());
            }
        }
        let (id, mut receiver) = self.health.register();
        loop {
            tokio::select! {
                _ = ctx.done() => break,
                received = receiver.recv() => {
                    match received {
                        Some(response) => {
                            if callback(&response).is_break() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.health.unregister(id);
        Ok(())
    }

    /// Push the current health to every subscriber and cache it for
    /// `max_cache`.
    pub fn broadcast_health(
        &self,
        ter_timestamp: i64,
        realtime_stats: RealtimeStats,
        max_cache: Duration,
    ) {
        let target = self.sm.lock().unwrap().target.clone();
        let response = StreamHealthResponse {
            target,
            tablet_alias: self.alias.clone(),
            serving: self.is_serving(),
            tablet_externally_reparented_timestamp: ter_timestamp,
            realtime_stats,
        };
        self.health.broadcast(response, max_cache);
    }

    /// Replication lag from the heartbeat reader. A closed reader on a
    /// non-serving node reports zero so health checks may attempt a restart.
    pub fn heartbeat_lag(&self) -> Result<Duration, TabletError> {
        if !self.engines.heartbeat_reader.is_open() && !self.is_serving() {
            return Ok(Duration::ZERO);
        }
        self.engines.heartbeat_reader.latest()
    }

    /// End-to-end health probe: for serving tablet types, run a trivial
    /// query through the full execution path.
    pub async fn is_healthy(&self) -> Result<(), TabletError> {
        let tablet_type = self.sm.lock().unwrap().target.tablet_type;
        match tablet_type {
            TabletType::Master
            | TabletType::Replica
            | TabletType::Batch
            | TabletType::Experimental => self
                .execute(
                    &Context::local(),
                    None,
                    "/* health */ select 1 from dual",
                    &BindVars::new(),
                    0,
                    0,
                    &ExecuteOptions::default(),
                )
                .await
                .map(|_result| ()),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Storage reachability probe.
    // ------------------------------------------------------------------

    /// Check whether the backing storage is reachable and stop the service
    /// if it is not. At most one probe runs at a time, with a one second
    /// cooldown after each.
    pub fn check_mysql(self: Arc<Self>) {
        let Ok(permit) = self.check_mysql_gate.clone().try_acquire_owned() else {
            return;
        };
        let server = self;
        tokio::spawn(async move {
            if !server.is_mysql_reachable().await {
                tracing::info!("storage check failed, shutting down query service");
                server.stop_service().await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(permit);
        });
    }

    /// Probe reachability without racing serving transitions: a serving
    /// node holds a request registration, a not-serving node parks in
    /// `Transitioning` for the probe's duration. Other states skip the
    /// probe and report reachable.
    async fn is_mysql_reachable(&self) -> bool {
        enum Mode {
            Guarded(RequestGuard),
            Parked,
            Skip,
        }
        let mode = {
            let mut sm = self.sm.lock().unwrap();
            match sm.state {
                ServingState::Serving => Mode::Guarded(self.register_request()),
                ServingState::NotServing => {
                    self.set_state_locked(&mut sm, ServingState::Transitioning);
                    Mode::Parked
                }
                _ => Mode::Skip,
            }
        };
        match mode {
            Mode::Skip => true,
            Mode::Guarded(_guard) => self.engines.query.is_reachable().await,
            Mode::Parked => {
                let reachable = self.engines.query.is_reachable().await;
                self.transition(ServingState::NotServing);
                reachable
            }
        }
    }

    // ------------------------------------------------------------------
    // Thin delegations.
    // ------------------------------------------------------------------

    pub async fn reload_schema(&self, ctx: &Context) -> Result<(), TabletError> {
        self.engines.schema.reload(ctx).await
    }

    /// Safe to call in any state.
    pub fn clear_query_plan_cache(&self) {
        self.engines.query.clear_plan_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> Target {
        Target::new("ks", "-80", TabletType::Master)
    }

    #[test]
    fn state_names_match_health_reporting() {
        assert_eq!(state_name(ServingState::NotConnected), "NOT_SERVING");
        assert_eq!(state_name(ServingState::NotServing), "NOT_SERVING");
        assert_eq!(state_name(ServingState::Transitioning), "NOT_SERVING");
        assert_eq!(state_name(ServingState::Serving), "SERVING");
        assert_eq!(state_name(ServingState::ShuttingDown), "SHUTTING_DOWN");
        assert_eq!(state_info(ServingState::NotConnected), "NOT_SERVING (Not Connected)");
        assert_eq!(state_info(ServingState::Serving), "SERVING");
    }

    #[test]
    fn check_target_accepts_matching_tuple() {
        let ctx = Context::background();
        let target = current();
        assert!(check_target(&ctx, Some(&target), &current(), &[]).is_ok());
    }

    #[test]
    fn check_target_rejects_keyspace_and_shard_as_invalid_argument() {
        let ctx = Context::background();
        let mut bad_keyspace = current();
        bad_keyspace.keyspace = "other".to_string();
        let err = check_target(&ctx, Some(&bad_keyspace), &current(), &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let mut bad_shard = current();
        bad_shard.shard = "80-".to_string();
        let err = check_target(&ctx, Some(&bad_shard), &current(), &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn check_target_tablet_type_honors_also_allow() {
        let ctx = Context::background();
        let mut batch = current();
        batch.tablet_type = TabletType::Batch;

        let err = check_target(&ctx, Some(&batch), &current(), &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        assert!(check_target(&ctx, Some(&batch), &current(), &[TabletType::Batch]).is_ok());
    }

    #[test]
    fn check_target_requires_target_unless_local() {
        let err = check_target(&Context::background(), None, &current(), &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        assert!(check_target(&Context::local(), None, &current(), &[]).is_ok());
    }

    #[test]
    fn timeout_derivation_rules() {
        let ctx = Context::background();
        let timeout = Duration::from_secs(30);
        assert_eq!(derive_timeout(&ctx, timeout, None), Some(timeout));
        assert_eq!(derive_timeout(&ctx, Duration::ZERO, None), None);

        let dba = ExecuteOptions {
            workload: Workload::Dba,
            ..Default::default()
        };
        assert_eq!(derive_timeout(&ctx, timeout, Some(&dba)), None);

        assert_eq!(derive_timeout(&Context::local(), timeout, None), None);
    }
}
