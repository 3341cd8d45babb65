//! VM provisioning on Proxmox VE
//!
//! Clones node VMs from a cloud-init template through the Proxmox API, and
//! builds that template on a Proxmox host.

pub mod proxmox;
pub mod template;
pub mod vm;

pub use proxmox::{ClusterVm, ProxmoxClient};
pub use template::{TemplateBuilder, TemplateOptions};
pub use vm::{provision_all, VmHandle, VmOrigin, VmProvisioner};
