//! In-memory fake engines for exercising a tablet server without a real
//! storage instance. Shared by the crate's unit tests and the integration
//! suites under `tests/`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DbConfig;
use crate::engine::{
    CdcEngine, CdcEvent, CdcRowsFrame, EngineResult, Engines, HeartbeatReader, HeartbeatWriter,
    MessageEngine, PlanKind, QueryEngine, QueryPlan, ReplicationWatcher, SchemaEngine,
    SchemaTracker, TxEngine, TxThrottler,
};
use crate::error::{ErrorCode, TabletError};
use crate::types::{
    BindVars, Context, ExecuteOptions, Field, QueryResult, Target, TransactionIsolation,
    TransactionMetadata, Value,
};

/// One live fake transaction.
#[derive(Debug, Clone, Default)]
pub struct FakeTransaction {
    pub queries: Vec<String>,
    /// Non-zero when the transaction runs on a reserved connection.
    pub reserved_id: i64,
    /// True when the slot was taken without issuing BEGIN.
    pub autocommit: bool,
}

/// Scripted backing state shared by all fake engines. Tests poke the
/// knobs, build [`Engines`] via [`FakeDb::engines`], and then assert on the
/// recorded lifecycle and queries.
pub struct FakeDb {
    lifecycle: Mutex<Vec<String>>,
    reachable: AtomicBool,
    throttle: AtomicBool,
    fail_open: Mutex<HashSet<String>>,
    wedge_execute: AtomicBool,
    panic_execute: AtomicBool,
    execute_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,

    next_conn_id: AtomicI64,
    pub transactions: Mutex<HashMap<i64, FakeTransaction>>,
    pub reserved: Mutex<HashSet<i64>>,
    pub executed: Mutex<Vec<(String, i64)>>,
    pub two_pc_log: Mutex<Vec<String>>,

    plans: Mutex<HashMap<String, Arc<QueryPlan>>>,
    results: Mutex<HashMap<String, QueryResult>>,
    errors: Mutex<HashMap<String, TabletError>>,

    read_only: AtomicBool,
    heartbeat_open: AtomicBool,
    heartbeat_lag: Mutex<Duration>,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            throttle: AtomicBool::new(false),
            fail_open: Mutex::new(HashSet::new()),
            wedge_execute: AtomicBool::new(false),
            panic_execute: AtomicBool::new(false),
            execute_delay: Mutex::new(Duration::ZERO),
            probe_delay: Mutex::new(Duration::ZERO),
            next_conn_id: AtomicI64::new(1),
            transactions: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
            two_pc_log: Mutex::new(Vec::new()),
            plans: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            read_only: AtomicBool::new(true),
            heartbeat_open: AtomicBool::new(false),
            heartbeat_lag: Mutex::new(Duration::ZERO),
        })
    }

    // ----- knobs -----

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_throttle(&self, throttle: bool) {
        self.throttle.store(throttle, Ordering::SeqCst);
    }

    /// Make the named subsystem's next open/init fail.
    pub fn fail_open(&self, name: &str) {
        self.fail_open.lock().unwrap().insert(name.to_string());
    }

    /// Make query execution block until the request context ends.
    pub fn set_wedged(&self, wedged: bool) {
        self.wedge_execute.store(wedged, Ordering::SeqCst);
    }

    /// Make query execution panic.
    pub fn set_panic(&self, panic: bool) {
        self.panic_execute.store(panic, Ordering::SeqCst);
    }

    /// Slow down every query execution by `delay`.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = delay;
    }

    /// Slow down every reachability probe by `delay`.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn put_plan(&self, sql: &str, plan: QueryPlan) {
        self.plans.lock().unwrap().insert(sql.to_string(), Arc::new(plan));
    }

    pub fn put_result(&self, sql: &str, result: QueryResult) {
        self.results.lock().unwrap().insert(sql.to_string(), result);
    }

    pub fn put_error(&self, sql: &str, err: TabletError) {
        self.errors.lock().unwrap().insert(sql.to_string(), err);
    }

    pub fn set_heartbeat_lag(&self, lag: Duration) {
        *self.heartbeat_lag.lock().unwrap() = lag;
    }

    // ----- observations -----

    pub fn lifecycle_log(&self) -> Vec<String> {
        self.lifecycle.lock().unwrap().clone()
    }

    pub fn clear_lifecycle_log(&self) {
        self.lifecycle.lock().unwrap().clear();
    }

    pub fn executed_queries(&self) -> Vec<String> {
        self.executed.lock().unwrap().iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn open_transaction_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    // ----- internals -----

    fn log(&self, event: &str) {
        self.lifecycle.lock().unwrap().push(event.to_string());
    }

    fn check_open(&self, name: &str) -> EngineResult<()> {
        if self.fail_open.lock().unwrap().remove(name) {
            return Err(TabletError::new(
                ErrorCode::Unknown,
                format!("{name}: forced open failure"),
            ));
        }
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    fn plan_for(&self, sql: &str) -> Arc<QueryPlan> {
        if let Some(plan) = self.plans.lock().unwrap().get(sql) {
            return plan.clone();
        }
        Arc::new(derive_plan(sql))
    }

    fn default_result() -> QueryResult {
        QueryResult {
            fields: vec![Field {
                name: "1".to_string(),
                column_type: "INT64".to_string(),
                table: String::new(),
            }],
            rows: vec![vec![Value::Int(1)]],
            rows_affected: 1,
            insert_id: 0,
        }
    }
}

/// The engine set backed by a shared fake.
pub fn fake_engines(db: &Arc<FakeDb>) -> Engines {
    Engines {
        schema: Arc::new(FakeSchemaEngine(db.clone())),
        heartbeat_writer: Arc::new(FakeHeartbeatWriter(db.clone())),
        heartbeat_reader: Arc::new(FakeHeartbeatReader(db.clone())),
        cdc: Arc::new(FakeCdcEngine(db.clone())),
        tracker: Arc::new(FakeSchemaTracker(db.clone())),
        watcher: Arc::new(FakeReplicationWatcher(db.clone())),
        query: Arc::new(FakeQueryEngine(db.clone())),
        tx_throttler: Arc::new(FakeTxThrottler(db.clone())),
        tx: Arc::new(FakeTxEngine(db.clone())),
        messager: Arc::new(FakeMessageEngine(db.clone())),
    }
}

/// Naive plan derivation so tests can submit plain SQL without scripting a
/// plan for every statement.
fn derive_plan(sql: &str) -> QueryPlan {
    let trimmed = sql.trim();
    let lower = trimmed.to_lowercase();
    let where_template = lower
        .find(" where ")
        .map(|pos| trimmed[pos..].to_string());

    if let Some(rest) = lower.strip_prefix("update ") {
        let table = rest.split_whitespace().next().unwrap_or("").to_string();
        return QueryPlan {
            kind: if lower.contains(" limit ") {
                PlanKind::UpdateLimit
            } else {
                PlanKind::Update
            },
            table_name: table,
            where_template,
        };
    }
    if lower.starts_with("delete ") || lower.starts_with("delete\t") {
        let table = lower
            .find(" from ")
            .map(|pos| {
                trimmed[pos + 6..]
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string()
            })
            .unwrap_or_default();
        return QueryPlan {
            kind: if lower.contains(" limit ") {
                PlanKind::DeleteLimit
            } else {
                PlanKind::Delete
            },
            table_name: table,
            where_template,
        };
    }
    if let Some(rest) = lower.strip_prefix("insert into ") {
        let table = rest.split_whitespace().next().unwrap_or("").to_string();
        return QueryPlan {
            kind: PlanKind::Insert,
            table_name: table,
            where_template: None,
        };
    }
    if lower.starts_with("select ") {
        let table = lower
            .find(" from ")
            .map(|pos| {
                trimmed[pos + 6..]
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string()
            })
            .unwrap_or_default();
        return QueryPlan {
            kind: PlanKind::Select,
            table_name: table,
            where_template,
        };
    }
    QueryPlan {
        kind: PlanKind::Other,
        table_name: String::new(),
        where_template: None,
    }
}

struct FakeSchemaEngine(Arc<FakeDb>);

#[async_trait]
impl SchemaEngine for FakeSchemaEngine {
    async fn open(&self) -> EngineResult<()> {
        self.0.check_open("schema")?;
        self.0.log("schema.open");
        Ok(())
    }

    async fn close(&self) {
        self.0.log("schema.close");
    }

    fn make_non_master(&self) {
        self.0.log("schema.make_non_master");
    }

    fn init_db_config(&self, _db_config: &DbConfig) {
        self.0.log("schema.init_db_config");
    }

    async fn reload(&self, _ctx: &Context) -> EngineResult<()> {
        self.0.log("schema.reload");
        Ok(())
    }
}

struct FakeHeartbeatWriter(Arc<FakeDb>);

#[async_trait]
impl HeartbeatWriter for FakeHeartbeatWriter {
    async fn open(&self) -> EngineResult<()> {
        self.0.check_open("heartbeat_writer")?;
        self.0.log("heartbeat_writer.open");
        Ok(())
    }

    async fn close(&self) {
        self.0.log("heartbeat_writer.close");
    }

    fn init_db_config(&self, _target: &Target) {
        self.0.log("heartbeat_writer.init_db_config");
    }
}

struct FakeHeartbeatReader(Arc<FakeDb>);

#[async_trait]
impl HeartbeatReader for FakeHeartbeatReader {
    async fn open(&self) {
        self.0.heartbeat_open.store(true, Ordering::SeqCst);
        self.0.log("heartbeat_reader.open");
    }

    async fn close(&self) {
        self.0.heartbeat_open.store(false, Ordering::SeqCst);
        self.0.log("heartbeat_reader.close");
    }

    fn is_open(&self) -> bool {
        self.0.heartbeat_open.load(Ordering::SeqCst)
    }

    fn latest(&self) -> EngineResult<Duration> {
        Ok(*self.0.heartbeat_lag.lock().unwrap())
    }

    fn init_db_config(&self, _target: &Target) {
        self.0.log("heartbeat_reader.init_db_config");
    }
}

struct FakeCdcEngine(Arc<FakeDb>);

#[async_trait]
impl CdcEngine for FakeCdcEngine {
    async fn open(&self, keyspace: &str, cell: &str) {
        self.0.log(&format!("cdc.open {keyspace} {cell}"));
    }

    async fn close(&self) {
        self.0.log("cdc.close");
    }

    async fn stream(
        &self,
        _ctx: &Context,
        start_pos: &str,
        send: &mut (dyn FnMut(Vec<CdcEvent>) -> EngineResult<()> + Send),
    ) -> EngineResult<()> {
        send(vec![CdcEvent {
            kind: "GTID".to_string(),
            gtid: start_pos.to_string(),
            statement: String::new(),
        }])
    }

    async fn stream_rows(
        &self,
        _ctx: &Context,
        _query: &str,
        lastpk: Vec<Value>,
        send: &mut (dyn FnMut(CdcRowsFrame) -> EngineResult<()> + Send),
    ) -> EngineResult<()> {
        send(CdcRowsFrame {
            lastpk,
            ..Default::default()
        })
    }

    async fn stream_results(
        &self,
        _ctx: &Context,
        _query: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()> {
        send(FakeDb::default_result())
    }
}

struct FakeSchemaTracker(Arc<FakeDb>);

#[async_trait]
impl SchemaTracker for FakeSchemaTracker {
    async fn open(&self) {
        self.0.log("tracker.open");
    }

    async fn close(&self) {
        self.0.log("tracker.close");
    }
}

struct FakeReplicationWatcher(Arc<FakeDb>);

#[async_trait]
impl ReplicationWatcher for FakeReplicationWatcher {
    async fn open(&self) {
        self.0.log("watcher.open");
    }

    async fn close(&self) {
        self.0.log("watcher.close");
    }
}

struct FakeQueryEngine(Arc<FakeDb>);

#[async_trait]
impl QueryEngine for FakeQueryEngine {
    async fn open(&self) -> EngineResult<()> {
        self.0.check_open("query")?;
        self.0.log("query.open");
        Ok(())
    }

    async fn close(&self) {
        self.0.log("query.close");
    }

    fn stop_serving(&self) {
        self.0.log("query.stop_serving");
    }

    async fn is_reachable(&self) -> bool {
        let delay = *self.0.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.0.reachable.load(Ordering::SeqCst)
    }

    async fn get_plan(
        &self,
        _ctx: &Context,
        sql: &str,
        _skip_cache: bool,
    ) -> EngineResult<Arc<QueryPlan>> {
        Ok(self.0.plan_for(sql))
    }

    fn get_stream_plan(&self, sql: &str) -> EngineResult<Arc<QueryPlan>> {
        Ok(self.0.plan_for(sql))
    }

    async fn execute(
        &self,
        ctx: &Context,
        _plan: Arc<QueryPlan>,
        sql: &str,
        _bind_vars: &BindVars,
        conn_id: i64,
        _options: &ExecuteOptions,
    ) -> EngineResult<QueryResult> {
        if self.0.panic_execute.load(Ordering::SeqCst) {
            panic!("injected execute panic");
        }
        if self.0.wedge_execute.load(Ordering::SeqCst) {
            // Simulates a storage engine that never answers; unblocks only
            // when the request context ends.
            let _ = ctx.done().await;
            return Err(TabletError::new(ErrorCode::Canceled, "execution canceled"));
        }
        let delay = *self.0.execute_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.0.executed.lock().unwrap().push((sql.to_string(), conn_id));
        if conn_id != 0 {
            if let Some(tx) = self.0.transactions.lock().unwrap().get_mut(&conn_id) {
                tx.queries.push(sql.to_string());
            }
        }
        if let Some(err) = self.0.errors.lock().unwrap().get(sql) {
            return Err(err.clone());
        }
        if let Some(result) = self.0.results.lock().unwrap().get(sql) {
            return Ok(result.clone());
        }
        Ok(FakeDb::default_result())
    }

    async fn stream_execute(
        &self,
        ctx: &Context,
        plan: Arc<QueryPlan>,
        sql: &str,
        bind_vars: &BindVars,
        conn_id: i64,
        options: &ExecuteOptions,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()> {
        let result = self.execute(ctx, plan, sql, bind_vars, conn_id, options).await?;
        send(QueryResult {
            fields: result.fields.clone(),
            ..Default::default()
        })?;
        send(QueryResult {
            rows: result.rows,
            ..Default::default()
        })
    }

    fn clear_plan_cache(&self) {
        self.0.plans.lock().unwrap().clear();
        self.0.log("query.clear_plan_cache");
    }
}

struct FakeTxThrottler(Arc<FakeDb>);

#[async_trait]
impl TxThrottler for FakeTxThrottler {
    async fn open(&self) -> EngineResult<()> {
        self.0.check_open("throttler")?;
        self.0.log("throttler.open");
        Ok(())
    }

    async fn close(&self) {
        self.0.log("throttler.close");
    }

    fn throttle(&self) -> bool {
        self.0.throttle.load(Ordering::SeqCst)
    }

    fn init_db_config(&self, _target: &Target) {
        self.0.log("throttler.init_db_config");
    }
}

struct FakeTxEngine(Arc<FakeDb>);

#[async_trait]
impl TxEngine for FakeTxEngine {
    async fn init(&self) -> EngineResult<()> {
        self.0.check_open("tx")?;
        self.0.log("tx.init");
        Ok(())
    }

    fn accept_read_write(&self) {
        self.0.read_only.store(false, Ordering::SeqCst);
        self.0.log("tx.accept_read_write");
    }

    fn accept_read_only(&self) {
        self.0.read_only.store(true, Ordering::SeqCst);
        self.0.log("tx.accept_read_only");
    }

    async fn close(&self) {
        // Like the real engine, give open transactions a window to resolve
        // before force-clearing them.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.0.transactions.lock().unwrap().is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.0.transactions.lock().unwrap().clear();
        self.0.reserved.lock().unwrap().clear();
        self.0.log("tx.close");
    }

    async fn begin(
        &self,
        _ctx: &Context,
        pre_queries: &[String],
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> EngineResult<(i64, String)> {
        let autocommit = options.transaction_isolation == TransactionIsolation::Autocommit;
        let transaction_id = if reserved_id != 0 {
            reserved_id
        } else {
            self.0.next_id()
        };
        self.0.transactions.lock().unwrap().insert(
            transaction_id,
            FakeTransaction {
                queries: pre_queries.to_vec(),
                reserved_id,
                autocommit,
            },
        );
        let begin_sql = if autocommit { String::new() } else { "begin".to_string() };
        Ok((transaction_id, begin_sql))
    }

    async fn commit(&self, _ctx: &Context, transaction_id: i64) -> EngineResult<(i64, String)> {
        let tx = self
            .0
            .transactions
            .lock()
            .unwrap()
            .remove(&transaction_id)
            .ok_or_else(|| {
                TabletError::new(
                    ErrorCode::NotFound,
                    format!("transaction {transaction_id}: not found"),
                )
            })?;
        let commit_sql = if tx.autocommit { String::new() } else { "commit".to_string() };
        Ok((tx.reserved_id, commit_sql))
    }

    async fn rollback(&self, _ctx: &Context, transaction_id: i64) -> EngineResult<i64> {
        let tx = self
            .0
            .transactions
            .lock()
            .unwrap()
            .remove(&transaction_id)
            .ok_or_else(|| {
                TabletError::new(
                    ErrorCode::NotFound,
                    format!("transaction {transaction_id}: not found"),
                )
            })?;
        Ok(tx.reserved_id)
    }

    async fn reserve(
        &self,
        _ctx: &Context,
        _options: &ExecuteOptions,
        transaction_id: i64,
        _pre_queries: &[String],
    ) -> EngineResult<i64> {
        let conn_id = if transaction_id != 0 {
            transaction_id
        } else {
            self.0.next_id()
        };
        self.0.reserved.lock().unwrap().insert(conn_id);
        Ok(conn_id)
    }

    async fn reserve_begin(
        &self,
        ctx: &Context,
        options: &ExecuteOptions,
        pre_queries: &[String],
    ) -> EngineResult<i64> {
        let conn_id = self.0.next_id();
        self.0.reserved.lock().unwrap().insert(conn_id);
        let (transaction_id, _sql) = self.begin(ctx, pre_queries, conn_id, options).await?;
        Ok(transaction_id)
    }

    async fn release(&self, _ctx: &Context, reserved_id: i64) -> EngineResult<()> {
        if !self.0.reserved.lock().unwrap().remove(&reserved_id) {
            return Err(TabletError::new(
                ErrorCode::NotFound,
                format!("connection {reserved_id}: not found"),
            ));
        }
        self.0.transactions.lock().unwrap().remove(&reserved_id);
        Ok(())
    }

    async fn prepare(&self, _ctx: &Context, transaction_id: i64, dtid: &str) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("prepare {transaction_id} {dtid}"));
        Ok(())
    }

    async fn commit_prepared(&self, _ctx: &Context, dtid: &str) -> EngineResult<()> {
        self.0.two_pc_log.lock().unwrap().push(format!("commit_prepared {dtid}"));
        Ok(())
    }

    async fn rollback_prepared(
        &self,
        _ctx: &Context,
        dtid: &str,
        original_id: i64,
    ) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("rollback_prepared {dtid} {original_id}"));
        Ok(())
    }

    async fn create_transaction(
        &self,
        _ctx: &Context,
        dtid: &str,
        participants: &[Target],
    ) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("create_transaction {dtid} {}", participants.len()));
        Ok(())
    }

    async fn start_commit(
        &self,
        _ctx: &Context,
        transaction_id: i64,
        dtid: &str,
    ) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("start_commit {transaction_id} {dtid}"));
        Ok(())
    }

    async fn set_rollback(
        &self,
        _ctx: &Context,
        dtid: &str,
        transaction_id: i64,
    ) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("set_rollback {dtid} {transaction_id}"));
        Ok(())
    }

    async fn conclude_transaction(&self, _ctx: &Context, dtid: &str) -> EngineResult<()> {
        self.0
            .two_pc_log
            .lock()
            .unwrap()
            .push(format!("conclude_transaction {dtid}"));
        Ok(())
    }

    async fn read_transaction(
        &self,
        _ctx: &Context,
        dtid: &str,
    ) -> EngineResult<TransactionMetadata> {
        self.0.two_pc_log.lock().unwrap().push(format!("read_transaction {dtid}"));
        Ok(TransactionMetadata {
            dtid: dtid.to_string(),
            state: crate::types::DtState::Prepare,
            time_created: 0,
            participants: Vec::new(),
        })
    }
}

struct FakeMessageEngine(Arc<FakeDb>);

#[async_trait]
impl MessageEngine for FakeMessageEngine {
    async fn open(&self) {
        self.0.log("messager.open");
    }

    async fn close(&self) {
        self.0.log("messager.close");
    }

    fn generate_ack_query(&self, name: &str, ids: &[String]) -> EngineResult<(String, BindVars)> {
        if ids.is_empty() {
            return Err(TabletError::new(ErrorCode::Unknown, "no message ids"));
        }
        let mut binds = BindVars::new();
        binds.insert("ids".to_string(), Value::VarChar(ids.join(",")));
        binds.insert("time_acked".to_string(), Value::Int(0));
        Ok((
            format!("update {name} set time_acked = :time_acked where id in (:ids)"),
            binds,
        ))
    }

    fn generate_postpone_query(
        &self,
        name: &str,
        ids: &[String],
    ) -> EngineResult<(String, BindVars)> {
        if ids.is_empty() {
            return Err(TabletError::new(ErrorCode::Unknown, "no message ids"));
        }
        let mut binds = BindVars::new();
        binds.insert("ids".to_string(), Value::VarChar(ids.join(",")));
        binds.insert("time_next".to_string(), Value::Int(0));
        Ok((
            format!("update {name} set time_next = :time_next where id in (:ids)"),
            binds,
        ))
    }

    fn generate_purge_query(
        &self,
        name: &str,
        time_cutoff: i64,
    ) -> EngineResult<(String, BindVars)> {
        let mut binds = BindVars::new();
        binds.insert("time_acked".to_string(), Value::Int(time_cutoff));
        Ok((
            format!("delete from {name} where time_acked < :time_acked limit 500"),
            binds,
        ))
    }

    async fn stream(
        &self,
        _ctx: &Context,
        _name: &str,
        send: &mut (dyn FnMut(QueryResult) -> EngineResult<()> + Send),
    ) -> EngineResult<()> {
        send(FakeDb::default_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_plans_classify_dmls() {
        let update = derive_plan("update t1 set a = 1 where id = :id");
        assert_eq!(update.kind, PlanKind::Update);
        assert_eq!(update.table_name, "t1");
        assert_eq!(update.where_template.as_deref(), Some(" where id = :id"));

        let delete = derive_plan("delete from t2 where id = :id limit 10");
        assert_eq!(delete.kind, PlanKind::DeleteLimit);
        assert_eq!(delete.table_name, "t2");

        let select = derive_plan("select * from t3");
        assert_eq!(select.kind, PlanKind::Select);
        assert!(select.where_template.is_none());
    }
}
