//! Serverdock - a control plane for containerized application servers
//!
//! This library turns declared server instances into running containers:
//! - Allocates host ports from a configurable pool and re-validates them
//!   before every start
//! - Creates, replaces and supervises containers through the Docker API
//! - Opens ports on the local firewall and, optionally, forwards them on the
//!   edge router
//! - Keeps a shared nginx stream proxy in line with the running,
//!   hostname-routed instances
//! - Serializes lifecycle operations per instance and reconciles drift
//!   between persisted state and the engine, and across processes through
//!   file leases

pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod family;
pub mod instance;
pub mod lease;
pub mod network;
pub mod orchestrator;
pub mod ports;
pub mod proxy;
