pub mod config;
pub mod httpserver;

pub use config::BlobServerConfig;
pub use httpserver::BlobServer;
