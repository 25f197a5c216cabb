//! Query-service node for a shale cluster.
//!
//! A tablet server sits between the routing tier and one backing relational
//! storage instance. It terminates client calls, decides whether it is
//! currently allowed to serve them, manages client-visible transactions
//! (including the two-phase commit coordinator surface used for cross-shard
//! atomicity) and broadcasts health to subscribers. Query planning and
//! execution, connection pooling, schema and replication bookkeeping are
//! external collaborators injected through the traits in [`engine`].
//!
//! A node is built with [`TabletServerBuilder`], pointed at its target with
//! [`TabletServer::init_db_config`] and driven through serving states with
//! [`TabletServer::set_serving_type`].

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod serializer;
pub mod server;
pub mod stats;
pub mod testing;
pub mod types;

pub use config::{DbConfig, HotRowProtectionConfig, HotRowProtectionMode, TabletConfig};
pub use engine::Engines;
pub use error::{ErrorCode, SqlError, TabletError};
pub use server::{ServingState, TabletServer, TabletServerBuilder};
pub use types::{
    BindVars, BoundQuery, Context, ExecuteOptions, QueryResult, RealtimeStats,
    StreamHealthResponse, TabletAlias, TabletType, Target, Value,
};
