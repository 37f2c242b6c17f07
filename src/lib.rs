pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod hosts;
pub mod orchestration;
