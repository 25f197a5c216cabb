//! Interfaces to the external collaborators of the query service.
//!
//! The tablet server composes roughly a dozen long-lived subsystems (schema,
//! heartbeat, CDC, query execution, transactions, messaging). Each is owned
//! elsewhere; this module defines the surface the server consumes so they can
//! be injected as `Arc<dyn …>`. `Open` and `Close` are idempotent for every
//! subsystem, and `Close` is infallible by contract: a subsystem that cannot
//! shut down cleanly logs and releases anyway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DbConfig;
use crate::error::TabletError;
use crate::types::{
    BindVars, Context, ExecuteOptions, Field, QueryResult, Target, TransactionMetadata, Value,
};

pub type EngineResult<T> = Result<T, TabletError>;

/// Statement shape as reported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Select,
    Insert,
    Update,
    UpdateLimit,
    Delete,
    DeleteLimit,
    Ddl,
    Other,
}

impl PlanKind {
    /// Only row-targeted DMLs are candidates for hot-row serialization.
    pub fn is_serializable_dml(&self) -> bool {
        matches!(
            self,
            PlanKind::Update | PlanKind::UpdateLimit | PlanKind::Delete | PlanKind::DeleteLimit
        )
    }
}

/// A cached query plan. The where-clause template carries `:name`
/// placeholders to be rendered with a call's bind variables.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub kind: PlanKind,
    pub table_name: String,
    pub where_template: Option<String>,
}

/// Schema introspection and reload.
#[async_trait]
pub trait SchemaEngine: Send + Sync {
    async fn open(&self) -> EngineResult<()>;
    async fn close(&self);
    /// Drop master-only schema bookkeeping when the node serves a read role.
    fn make_non_master(&self);
    fn init_db_config(&self, db_config: &DbConfig);
    async fn reload(&self, ctx: &Context) -> EngineResult<()>;
}

/// Replication-heartbeat writer (master role only).
#[async_trait]
pub trait HeartbeatWriter: Send + Sync {
    async fn open(&self) -> EngineResult<()>;
    async fn close(&self);
    fn init_db_config(&self, target: &Target);
}

/// Replication-heartbeat reader (read roles only).
#[async_trait]
pub trait HeartbeatReader: Send + Sync {
    async fn open(&self);
    async fn close(&self);
    fn is_open(&self) -> bool;
    /// Latest observed replication lag.
    fn latest(&self) -> EngineResult<Duration>;
    fn init_db_config(&self, target: &Target);
}

/// One change-data-capture event.
#[derive(Debug, Clone)]
pub struct CdcEvent {
    pub kind: String,
    pub gtid: String,
    pub statement: String,
}

/// A frame of copied rows in a CDC rows stream.
#[derive(Debug, Clone, Default)]
pub struct CdcRowsFrame {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub lastpk: Vec<Value>,
}

/// Change-data-capture engine; streams run on the caller's context and are
/// legal in non-serving states.
#[async_trait]
pub trait CdcEngine: Send + Sync {
    async fn open(&self, keyspace: &str, cell: &str);
    async fn close(&self);
    async fn stream(
        &self,
        ctx: &Context,
        start_pos: &str,
        send: &mut (dyn FnMut(Vec<CdcEvent>) -> EngineResult<()> + Send),
    ) -> EngineResult<()>;
    async fn stream_rows(
        &self,
        ctx: &Context,
        query: &str,
        lastpk: Vec<Value>,
        send: &mut (dyn FnMut(CdcRowsFrame) -> EngineResult<()> + Send),
    ) -> EngineResult<()>;
    async fn stream_results(
        &self,
        ctx: &Context,
        query: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()>;
}

/// Schema-version tracker fed by the CDC stream (master role only).
#[async_trait]
pub trait SchemaTracker: Send + Sync {
    async fn open(&self);
    async fn close(&self);
}

/// Replication watcher (read roles only).
#[async_trait]
pub trait ReplicationWatcher: Send + Sync {
    async fn open(&self);
    async fn close(&self);
}

/// Query planning and execution.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn open(&self) -> EngineResult<()>;
    async fn close(&self);
    /// Stop admitting new work while leaving pools alive for the drain.
    fn stop_serving(&self);
    /// Probe connectivity to the backing storage instance.
    async fn is_reachable(&self) -> bool;
    async fn get_plan(
        &self,
        ctx: &Context,
        sql: &str,
        skip_cache: bool,
    ) -> EngineResult<Arc<QueryPlan>>;
    fn get_stream_plan(&self, sql: &str) -> EngineResult<Arc<QueryPlan>>;
    async fn execute(
        &self,
        ctx: &Context,
        plan: Arc<QueryPlan>,
        sql: &str,
        bind_vars: &BindVars,
        conn_id: i64,
        options: &ExecuteOptions,
    ) -> EngineResult<QueryResult>;
    /// The first frame carries field metadata only; subsequent frames carry
    /// rows only.
    async fn stream_execute(
        &self,
        ctx: &Context,
        plan: Arc<QueryPlan>,
        sql: &str,
        bind_vars: &BindVars,
        conn_id: i64,
        options: &ExecuteOptions,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()>;
    fn clear_plan_cache(&self);
}

/// Transaction-creation throttler.
#[async_trait]
pub trait TxThrottler: Send + Sync {
    async fn open(&self) -> EngineResult<()>;
    async fn close(&self);
    /// True when the next transaction should be rejected.
    fn throttle(&self) -> bool;
    fn init_db_config(&self, target: &Target);
}

/// Transaction engine: pool slots, transaction lifecycle and the two-phase
/// commit coordinator interface.
#[async_trait]
pub trait TxEngine: Send + Sync {
    /// One-time metadata initialization. Idempotent.
    async fn init(&self) -> EngineResult<()>;
    fn accept_read_write(&self);
    fn accept_read_only(&self);
    async fn close(&self);

    /// Returns the new transaction id and the BEGIN statement actually
    /// issued (empty when the pool slot was acquired without one).
    async fn begin(
        &self,
        ctx: &Context,
        pre_queries: &[String],
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> EngineResult<(i64, String)>;
    /// Returns the surviving reserved-connection id (zero when the
    /// connection was returned to the pool) and the COMMIT statement issued.
    async fn commit(&self, ctx: &Context, transaction_id: i64) -> EngineResult<(i64, String)>;
    async fn rollback(&self, ctx: &Context, transaction_id: i64) -> EngineResult<i64>;

    /// Pin a connection, optionally adopting a live transaction.
    async fn reserve(
        &self,
        ctx: &Context,
        options: &ExecuteOptions,
        transaction_id: i64,
        pre_queries: &[String],
    ) -> EngineResult<i64>;
    async fn reserve_begin(
        &self,
        ctx: &Context,
        options: &ExecuteOptions,
        pre_queries: &[String],
    ) -> EngineResult<i64>;
    /// Release a pinned connection, rolling back any live transaction on it.
    async fn release(&self, ctx: &Context, reserved_id: i64) -> EngineResult<()>;

    async fn prepare(&self, ctx: &Context, transaction_id: i64, dtid: &str) -> EngineResult<()>;
    async fn commit_prepared(&self, ctx: &Context, dtid: &str) -> EngineResult<()>;
    async fn rollback_prepared(
        &self,
        ctx: &Context,
        dtid: &str,
        original_id: i64,
    ) -> EngineResult<()>;
    async fn create_transaction(
        &self,
        ctx: &Context,
        dtid: &str,
        participants: &[Target],
    ) -> EngineResult<()>;
    async fn start_commit(&self, ctx: &Context, transaction_id: i64, dtid: &str)
        -> EngineResult<()>;
    async fn set_rollback(&self, ctx: &Context, dtid: &str, transaction_id: i64)
        -> EngineResult<()>;
    async fn conclude_transaction(&self, ctx: &Context, dtid: &str) -> EngineResult<()>;
    async fn read_transaction(&self, ctx: &Context, dtid: &str)
        -> EngineResult<TransactionMetadata>;
}

/// Message-queue table engine (master role only).
#[async_trait]
pub trait MessageEngine: Send + Sync {
    async fn open(&self);
    async fn close(&self);
    fn generate_ack_query(&self, name: &str, ids: &[String]) -> EngineResult<(String, BindVars)>;
    fn generate_postpone_query(
        &self,
        name: &str,
        ids: &[String],
    ) -> EngineResult<(String, BindVars)>;
    /// Purges at most 500 messages per call.
    fn generate_purge_query(&self, name: &str, time_cutoff: i64)
        -> EngineResult<(String, BindVars)>;
    async fn stream(
        &self,
        ctx: &Context,
        name: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()>;
}

/// The full collaborator set injected into a tablet server at build time.
#[derive(Clone)]
pub struct Engines {
    pub schema: Arc<dyn SchemaEngine>,
    pub heartbeat_writer: Arc<dyn HeartbeatWriter>,
    pub heartbeat_reader: Arc<dyn HeartbeatReader>,
    pub cdc: Arc<dyn CdcEngine>,
    pub tracker: Arc<dyn SchemaTracker>,
    pub watcher: Arc<dyn ReplicationWatcher>,
    pub query: Arc<dyn QueryEngine>,
    pub tx_throttler: Arc<dyn TxThrottler>,
    pub tx: Arc<dyn TxEngine>,
    pub messager: Arc<dyn MessageEngine>,
}
