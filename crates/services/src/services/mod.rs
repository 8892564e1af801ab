pub mod auth;
pub mod backend;
pub mod challenges;
pub mod config;
pub mod database_validator;
pub mod membership;
pub mod migration;
pub mod progress;
pub mod share_code;
pub mod stats;
