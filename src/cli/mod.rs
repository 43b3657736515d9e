pub mod config;
pub mod diagnose;
pub mod server;
pub mod session;
