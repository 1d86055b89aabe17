pub mod cache;
pub mod chash;
pub mod config;
pub mod constants;
pub mod fetch;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod remap;
pub mod rfc;
pub mod server;
pub mod upstream;
