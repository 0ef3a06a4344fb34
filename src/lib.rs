#[macro_use]
extern crate tracing;

#[macro_use]
mod display;

pub mod app;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod engine;
pub mod mux;
pub mod signal;
pub mod wire;
