//! Cluster access and add-ons

pub mod kubeconfig;
pub mod longhorn;

pub use kubeconfig::{kubeconfig_step, rewrite_loopback, KubeClient, KubeClientBuilder};
pub use longhorn::LonghornInstaller;
