pub mod config;
pub mod configurator;
pub mod diagnostics;
pub mod event_reporter;
pub mod handler;
pub mod lifecycle;
pub mod memory;
pub mod monitor;
pub mod signals;
pub mod watchdog;

#[cfg(test)]
mod testing;
