//! Embedded time-series storage: schema/migrations, retention policy, and
//! the batched-writer `TimeSeriesStore` itself.

pub mod retention;
pub mod schema;
pub mod store;

pub use retention::{RetentionAction, RetentionPolicy};
pub use store::{AggregateFn, HostRow, StoreConfig, TimeSeriesStore};
