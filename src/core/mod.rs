pub mod bot;
pub mod builtin_providers;
pub mod config;
pub mod keyring;
pub mod message;
pub mod providers;
pub mod session;
pub mod store;
pub mod turn;
