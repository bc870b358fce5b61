//! Pluggable storage backends the selectors read from

pub mod stubs;
pub mod traits;

pub use stubs::InMemoryStorage;
pub use traits::{Queryable, SelectHints, SeriesStream, StorageSeries};
