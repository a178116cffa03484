pub mod api;
pub mod config;
pub mod ingest;
pub mod publisher;
pub mod router;
pub mod server;
pub mod time;
