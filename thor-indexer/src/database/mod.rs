//! Database layer: schema registry, row inserters and the store adapters

pub mod inserter;
pub mod memory;
pub mod postgres;
pub mod row;
pub mod schema;

pub use inserter::{
    mark_insert_failure, new_inserter, reset_insert_strategy, select_strategy, BatchInserter,
    FlushStats, InsertStrategy, Inserter, TolerantInserter, LAST_INSERT_FAILED_KEY,
};
pub use memory::MemoryStore;
pub use postgres::PostgresManager;
pub use row::{Row, SqlType, SqlValue};
