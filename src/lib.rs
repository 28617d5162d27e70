pub mod aggregate;
pub mod config;
pub mod error;
pub mod game_client;
pub mod http_client;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod rate_limiter;
pub mod roster;
pub mod store;
