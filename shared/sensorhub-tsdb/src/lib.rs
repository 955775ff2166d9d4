//! SensorHub time-series store
//!
//! Storage collaborator for the rollup pipeline: the aggregate expression
//! language, the `TimeSeriesStore` contract with typed requests, a LumaDB
//! backend over the PostgreSQL wire protocol, and an in-process backend.

mod aggregate;
mod error;
mod memory;
mod pool;
mod postgres;
mod store;
mod timeout;

pub use aggregate::{AggregateExpr, AggregateFn, AggregationRule};
pub use error::{Result, StoreError};
pub use memory::{Fault, MemoryStore};
pub use pool::{PoolConfig, TsdbPool};
pub use postgres::PgStore;
pub use store::{AggregateQuery, PersistentRule, TimeSeriesStore};
pub use timeout::TimeoutStore;
