pub mod config;
pub mod rule_seed;
pub mod scheduler;
pub mod state;
