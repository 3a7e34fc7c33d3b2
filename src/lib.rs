// Public API for integration tests and the server binary

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;
