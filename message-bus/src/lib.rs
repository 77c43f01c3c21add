//! Message bus on top of Kafka.
//!
//! Provides topic administration, a synchronous and an asynchronous producer, and a consumer
//! runtime that maps named handlers onto consumer groups. Each consumer follows group
//! rebalances on its own and reports readiness per assignment; the registry aggregates
//! readiness and stops every consumer on shutdown.

pub mod admin;
pub mod client_config;
pub mod config;
pub mod consumer;
pub mod error;
pub mod mapper;
pub mod message;
pub mod metrics_consts;
pub mod producer;
pub mod test_utils;
