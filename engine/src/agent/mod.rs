//! Agent Loop Core
//!
//! This module implements the agent loop that drives a document task through
//! an iterative plan-act-observe cycle, and the service that runs those loops
//! on a bounded worker pool.

pub mod context;
pub mod core;
pub mod planner;
pub mod service;
pub mod working_memory;

pub use context::AgentContext;
pub use core::AgentCore;
pub use planner::{Decision, Planner};
pub use service::{TaskHandle, TaskOutcome, TaskService};
pub use working_memory::WorkingMemory;
