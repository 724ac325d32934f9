//! Plantão Terminal Service
//!
//! Configuration, event rendering and the interactive loop of the `plantao`
//! binary. The binary in `bin/plantao.rs` only wires these together with the
//! core services.

pub mod config;
pub mod render;
pub mod repl;
