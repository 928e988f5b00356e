pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod git;
pub mod render;
pub mod session;
pub mod transcript;
pub mod util;
