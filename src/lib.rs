pub mod api;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod liveness;
pub mod presets;
pub mod protocol;
pub mod registry;
