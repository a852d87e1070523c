//! Constellation CLI
//!
//! Thin command-line front end for the constellation control plane: loads a
//! TOML fleet description, connects the devices, and either stays resident
//! (`run`) or dispatches a single task (`send`).

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
