//! Automated response playbook execution engine.
//!
//! Playbooks are ordered lists of typed security response actions. The engine drives each
//! execution through its actions, evaluates decision branches against the execution context,
//! applies retry and on-error policies, suspends at human approval gates, and records every
//! outcome in a persisted execution record.
//!
//! The main entry points are [`playbooks::Orchestrator`] for driving executions,
//! [`playbooks::PlaybookService`] for playbook storage and trigger matching, and
//! [`playbooks::TestHarness`] for dry runs, validation, simulation and performance analysis.

pub mod config;
pub mod connectors;
pub mod error;
pub mod metrics;
pub mod models;
pub mod playbooks;
pub mod state;

pub use error::{AppError, Result};
