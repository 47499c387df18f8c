//! # Utilities Module
//!
//! Internal utility modules for the core-logic crate.
//! These modules are marked as `pub(crate)` to enforce API boundaries.

pub(crate) mod fee_manager;
pub(crate) mod logger;
pub(crate) mod persist;
pub(crate) mod retry;
pub(crate) mod rpc_manager;
pub(crate) mod runner;
pub(crate) mod wallet_manager;
