//! Contract bindings

pub mod simple_bridge;
