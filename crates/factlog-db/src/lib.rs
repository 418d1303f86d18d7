//! Database layer for factlog.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. The fact table, the namespace lock-code
//! table and the state-token table are all created here.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: readers never block the single writer, so
//!   long catch-up scans run alongside publishes. SQLite serialises
//!   writers, which makes serial order identical to commit order.
//! - **`r2d2` connection pool**: subscriptions borrow a connection for the
//!   duration of one scan and hand it back.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and cannot drift from the code that depends on them.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, ParseSyncModeError, PoolError, SyncMode};
