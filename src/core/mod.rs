//! Core pipeline logic: stores, declarations, plans, pools, deploy and destroy.

pub mod destroy;
pub mod error;
pub mod executor;
pub mod parser;
pub mod plans;
pub mod pool;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod types;
