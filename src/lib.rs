//! homelab - k3s cluster bootstrap on Proxmox
//!
//! homelab turns a YAML stack file into a running k3s cluster:
//!
//! - VM provisioning from a cloud-init template through the Proxmox API
//! - Node labels derived from storage tier and topology zone
//! - A minimal dependency graph of per-node install steps, run concurrently
//!   over SSH with trigger-based idempotency
//! - Kubeconfig retrieval and the Longhorn storage add-on
//! - Stack outputs for downstream consumers

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod kube;
pub mod labels;
pub mod outputs;
pub mod provision;
pub mod remote;

pub use error::{HomelabError, Result};
