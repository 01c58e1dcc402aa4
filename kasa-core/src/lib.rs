pub mod appid;
pub mod assistant;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod sse;
pub mod store;
