pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod hash;
pub mod history;
pub mod planner;
pub mod redact;
pub mod runner;
pub mod scripts;
pub mod session;
pub mod sort;
pub mod statements;
pub mod template;
