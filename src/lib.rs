pub mod collector;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod extraction;
pub mod logging;
pub mod retry;
pub mod sack;
pub mod schedule;
pub mod search;
pub mod server;
pub mod store;
pub mod tokens;
