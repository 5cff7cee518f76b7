pub mod circuit_breaker;
pub mod memory_store;
pub mod metrics_exporter;
pub mod observability;
pub mod redis_store;
pub mod resource_monitor;
pub mod store_factory;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats};
pub use memory_store::InMemoryStore;
pub use metrics_exporter::{MetricsExporter, MetricsSnapshot};
pub use observability::{init_logging, init_metrics, MetricsCollector};
pub use redis_store::RedisStore;
pub use resource_monitor::{ResourceSample, ResourceSampler};
pub use store_factory::StoreFactory;
