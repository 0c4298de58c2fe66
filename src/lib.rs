pub mod api;
pub mod cli;
pub mod cluster;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod settings;
