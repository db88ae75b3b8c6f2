//! Action execution and dispatch

mod executor;
mod pool;

pub use executor::{resolve_parameters, ActionExecutor, ResolvedParameters};
pub use pool::{ActionDispatcher, ActionPool, PoolConfig, ShutdownOutcome};
