pub mod api;
pub mod config;
pub mod metrics;
pub mod notifier;
pub mod service;

pub use config::ServiceConfig;
pub use metrics::ServiceMetrics;
pub use notifier::{Frame, Notifier, Subscription};
