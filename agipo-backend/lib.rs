//! Workflow graph runner: plans node graphs into linear chains and runs each
//! chain as one shell pipeline inside a lazily booted sandbox.

pub mod config;
pub mod sandbox;
pub mod workflows;
