//! Wire-facing data types shared by the query service surface: targets,
//! bind values, results, execute options and the per-request context.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Role a tablet plays within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabletType {
    Unknown,
    Master,
    Replica,
    /// Batch/OLAP traffic (the wire name is `BATCH`).
    Batch,
    Experimental,
    Drained,
}

impl TabletType {
    pub fn name(&self) -> &'static str {
        match self {
            TabletType::Unknown => "UNKNOWN",
            TabletType::Master => "MASTER",
            TabletType::Replica => "REPLICA",
            TabletType::Batch => "BATCH",
            TabletType::Experimental => "EXPERIMENTAL",
            TabletType::Drained => "DRAINED",
        }
    }
}

impl Default for TabletType {
    fn default() -> Self {
        TabletType::Unknown
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What this node serves, and what a caller must present to be admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(keyspace: &str, shard: &str, tablet_type: TabletType) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            tablet_type,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.keyspace, self.shard, self.tablet_type)
    }
}

/// Identity of a tablet process, reported back in Begin and health responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cell, self.uid)
    }
}

/// A single SQL value, used both for bind variables and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    VarChar(String),
    VarBinary(Bytes),
}

impl Value {
    /// Raw string form without SQL quoting (message ids, logs).
    pub fn as_raw_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::VarChar(v) => v.clone(),
            Value::VarBinary(v) => String::from_utf8_lossy(v).into_owned(),
        }
    }

    /// SQL literal form, as it would appear substituted into a query.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::VarChar(v) => format!("'{}'", v.replace('\'', "\\'")),
            Value::VarBinary(v) => format!("'{}'", String::from_utf8_lossy(v).replace('\'', "\\'")),
        }
    }
}

/// Bind variables keyed by name. A `BTreeMap` keeps iteration (and therefore
/// log and error formatting) in sorted key order.
pub type BindVars = BTreeMap<String, Value>;

/// Result field descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Field {
    pub name: String,
    pub column_type: String,
    pub table: String,
}

/// One query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    /// Reduce field metadata to what the caller asked for.
    pub fn strip_metadata(mut self, included: IncludedFields) -> Self {
        match included {
            IncludedFields::All => {}
            IncludedFields::TypeAndName => {
                for field in &mut self.fields {
                    field.table.clear();
                }
            }
            IncludedFields::TypeOnly => {
                for field in &mut self.fields {
                    field.table.clear();
                    field.name.clear();
                }
            }
        }
        self
    }
}

/// How much field metadata to return with results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludedFields {
    TypeAndName,
    TypeOnly,
    All,
}

impl Default for IncludedFields {
    fn default() -> Self {
        IncludedFields::TypeAndName
    }
}

/// Declared workload class of a call. `Dba` calls never get a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Workload {
    Unspecified,
    Oltp,
    Olap,
    Dba,
}

impl Default for Workload {
    fn default() -> Self {
        Workload::Unspecified
    }
}

/// Isolation requested for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionIsolation {
    Default,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Serializable,
    /// Acquire a pool slot without issuing BEGIN.
    Autocommit,
}

impl Default for TransactionIsolation {
    fn default() -> Self {
        TransactionIsolation::Default
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    pub included_fields: IncludedFields,
    pub workload: Workload,
    pub transaction_isolation: TransactionIsolation,
    pub skip_query_plan_cache: bool,
}

/// A query plus its bind variables, as submitted in a batch.
#[derive(Debug, Clone, Default)]
pub struct BoundQuery {
    pub sql: String,
    pub bind_vars: BindVars,
}

/// State of a distributed transaction as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtState {
    Unknown,
    Prepare,
    Commit,
    Rollback,
}

/// Coordinator metadata for one distributed transaction.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    pub dtid: String,
    pub state: DtState,
    pub time_created: i64,
    pub participants: Vec<Target>,
}

/// Point-in-time load/replication stats carried in health broadcasts. The
/// values are produced by an external health source, not by this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub health_error: String,
    pub seconds_behind_master: u32,
    pub qps: f64,
}

/// One health broadcast frame.
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealthResponse {
    pub target: Target,
    pub tablet_alias: TabletAlias,
    pub serving: bool,
    pub tablet_externally_reparented_timestamp: i64,
    pub realtime_stats: RealtimeStats,
}

/// Leading and trailing comments split off a query before planning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarginComments {
    pub leading: String,
    pub trailing: String,
}

/// Split margin comments off `sql` so the query cache is keyed on the bare
/// statement. Comments are preserved for re-attachment by the executor.
pub fn split_margin_comments(sql: &str) -> (String, MarginComments) {
    let mut leading = String::new();
    let mut trailing = String::new();
    let mut rest = sql.trim();

    while rest.starts_with("/*") {
        match rest.find("*/") {
            Some(end) => {
                leading.push_str(&rest[..end + 2]);
                rest = rest[end + 2..].trim_start();
            }
            None => break,
        }
    }
    while rest.ends_with("*/") {
        match rest.rfind("/*") {
            Some(start) => {
                let mut comment = rest[start..].to_string();
                comment.push_str(&trailing);
                trailing = comment;
                rest = rest[..start].trim_end();
            }
            None => break,
        }
    }

    (rest.to_string(), MarginComments { leading, trailing })
}

/// Why a request context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Canceled,
    DeadlineExceeded,
}

/// Per-request context: cancellation, optional deadline, and whether the
/// request originated inside this process. Local requests bypass target
/// verification and never get a deadline.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    local: bool,
    caller_id: Option<String>,
}

impl Context {
    /// A root context for an externally originated request.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            local: false,
            caller_id: None,
        }
    }

    /// A context for internally originated work (health probes, debug pages).
    pub fn local() -> Self {
        Self {
            local: true,
            ..Self::background()
        }
    }

    pub fn with_caller_id(mut self, caller_id: &str) -> Self {
        self.caller_id = Some(caller_id.to_string());
        self
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.caller_id.as_deref()
    }

    /// Derive a child context, optionally narrowing the deadline. The child
    /// is canceled when the parent is.
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> Self {
        let new_deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let deadline = match (self.deadline, new_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
            local: self.local,
            caller_id: self.caller_id.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .deadline
                .is_some_and(|d| tokio::time::Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// Resolve when the context is canceled or its deadline passes.
    /// Pends forever for a deadline-free, never-canceled context.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Done::Canceled,
                    _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                Done::Canceled
            }
        }
    }
}
