//! Quill Engine Library
//!
//! This library provides the agent task orchestrator behind the `quill`
//! binary. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Task/Step store
pub mod db;

/// Message bus for task lifecycle events
pub mod message_bus;

/// Model Gateway abstraction
pub mod llm;

/// Agent loop, planner and task lifecycle service
pub mod agent;

/// Tool registry and document tools
pub mod tools;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
