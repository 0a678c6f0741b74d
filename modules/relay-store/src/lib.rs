//! Durable state for the dispatch pipeline: a bounded lease pool over
//! dedicated Postgres connections, the commands table that enforces
//! idempotency, and the schema bootstrap that runs at startup.

pub mod pool;
pub mod schema;
pub mod store;

pub use pool::{ConnectionLease, ConnectionPool};
pub use schema::init_schema;
pub use store::{classify_sqlx, CommandHandler, CommandStore};
