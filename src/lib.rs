//! Procwatch - supervised child processes with line-streamed output for test harnesses.

pub mod config;
pub mod supervisor;
