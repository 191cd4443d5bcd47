// Market data: bar types, timeframe aggregation, and the on-disk warehouse.

pub mod aggregator;
pub mod bar_store;
pub mod bars;

pub use aggregator::{Aggregator, BarCompleteCallback};
pub use bar_store::{BarStore, SaveMode};
pub use bars::{AggregatedBar, SourceBar, Timeframe};
