pub mod board;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod rng;
pub mod server_utils;
pub mod session;
pub mod store;
pub mod types;
