pub mod agent;
pub mod api;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestration;
pub mod store;
