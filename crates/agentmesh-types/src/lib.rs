//! Core types for the agentmesh coordination layer.
//!
//! This crate defines the envelopes (messages and events), the service
//! registry records, subscription filters, and the configuration schema shared
//! by the kernel and its consumers. It contains no business logic.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod service;
