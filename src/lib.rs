pub mod auth;
pub mod automation;
pub mod config;
pub mod email;
pub mod error;
pub mod llm;
pub mod shared;
pub mod tickets;
