pub mod calendar;
pub mod commands;
pub mod config;
