//! corral: declarative stacks of infrastructure instances.
//!
//! A stack declaration names instances and the plugins that initialize,
//! configure and provision them. Deploys run in stages, fan out per instance
//! and persist every completed step, so a failed or interrupted deploy can be
//! re-run and picks up where it stopped.

pub mod cli;
pub mod core;
pub mod journal;
pub mod plugins;
