pub mod channel_layer;
pub mod config;
pub mod db;
pub mod digest;
pub mod directory;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod hub;
pub mod ingress;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod prefs;
pub mod retry;
pub mod store;
pub mod templates;
