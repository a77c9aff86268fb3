pub mod adapter;
pub mod btle;
pub mod constants;
pub mod query;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod simulated;
pub mod types;
