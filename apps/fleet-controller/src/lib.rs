pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod pump;
pub mod registry;
pub mod routes;
pub mod state;
pub mod telemetry;
