//! Queue-to-sink delivery: batch processor, worker pool, unbatched
//! dispatcher and the facade that ties them to the caches and aggregator.

pub mod direct;
pub mod facade;
pub mod processor;
pub mod stats;
pub mod worker;

pub use direct::DirectDispatcher;
pub use facade::{CacheHitRates, HealthStatus, PipelineFacade};
pub use processor::{group_by_routing_key, BatchProcessor, ProcessorStats, ShutdownReport};
pub use stats::{PerformanceSnapshot, PerformanceStats};
pub use worker::{ShutdownSignal, WorkerPool};
