pub mod api;
pub mod config;
pub mod core;
pub mod dialer;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use crate::api::{ApiServer, BuildInfo};
pub use crate::config::Config;
pub use crate::core::{Balancer, BoxConn, Ring, RoundRobin, Source, Strategy};
pub use crate::dialer::Dialer;
pub use crate::error::{LinkmuxError, LinkmuxResult};
pub use crate::metrics::{MetricsExporter, NoopExporter, PrometheusExporter};
pub use crate::proxy::ProxyServer;
pub use crate::source::{Confidence, Listener, LocalProvider, NetInterface, SourceProvider};
pub use crate::store::{
    AvoidPolicy, BlockPolicy, Policy, PolicySnapshot, ReservedPolicy, SourceStore, StickyPolicy,
};
