pub mod broker;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod store;
pub mod supervisor;
pub mod topology;
pub mod utils;
pub mod worker;
