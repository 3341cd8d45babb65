//! Cloud-init VM template creation
//!
//! Runs on a Proxmox host as root and turns an Ubuntu cloud image into the
//! template every node VM is cloned from.

use crate::config::secret::expand_home;
use crate::error::{HomelabError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img";
pub const DEFAULT_ISO_DIR: &str = "/var/lib/vz/template/iso";
pub const DEFAULT_TEMPLATE_NAME: &str = "ubuntu-cloudinit-template";

/// Commands that must be on PATH
const REQUIRED_COMMANDS: &[&str] = &["qm", "wget"];

/// Template creation options
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    pub vm_id: u32,
    pub name: String,
    /// Target storage for disks
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub image_url: String,
    /// Local image; skips the download
    pub image_path: Option<PathBuf>,
    pub iso_dir: PathBuf,
    /// e.g. `32G`, applied to scsi0
    pub disk_resize: Option<String>,
    pub ciuser: Option<String>,
    /// Public key file baked in through cloud-init
    pub sshkeys: Option<PathBuf>,
    /// `dhcp` or `ip=...,gw=...`
    pub ipconfig: Option<String>,
    pub vlan: Option<u16>,
    pub dry_run: bool,
}

impl TemplateOptions {
    pub fn new(vm_id: u32) -> Self {
        Self {
            vm_id,
            name: DEFAULT_TEMPLATE_NAME.to_string(),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            cores: 2,
            memory_mb: 2048,
            image_url: DEFAULT_IMAGE_URL.to_string(),
            image_path: None,
            iso_dir: PathBuf::from(DEFAULT_ISO_DIR),
            disk_resize: None,
            ciuser: Some("ubuntu".to_string()),
            sshkeys: None,
            ipconfig: Some("dhcp".to_string()),
            vlan: None,
            dry_run: false,
        }
    }

    /// Where the cloud image is read from
    pub fn resolved_image_path(&self) -> PathBuf {
        if let Some(ref path) = self.image_path {
            return expand_home(&path.to_string_lossy());
        }
        let file_name = self
            .image_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("cloudimg.img");
        self.iso_dir.join(file_name)
    }

    pub fn net0(&self) -> String {
        match self.vlan {
            Some(tag) if tag > 0 => format!("virtio,bridge={},tag={}", self.bridge, tag),
            _ => format!("virtio,bridge={}", self.bridge),
        }
    }

    /// `qm` invocations, in order, after the image is in place
    pub fn commands(&self) -> Vec<Vec<String>> {
        let id = self.vm_id.to_string();
        let qm_set = |args: &[&str]| {
            let mut cmd = vec!["qm".to_string(), "set".to_string(), id.clone()];
            cmd.extend(args.iter().map(|a| a.to_string()));
            cmd
        };

        let mut commands = vec![
            vec![
                "qm".to_string(),
                "create".to_string(),
                id.clone(),
                "--name".to_string(),
                self.name.clone(),
                "--memory".to_string(),
                self.memory_mb.to_string(),
                "--cores".to_string(),
                self.cores.to_string(),
                "--net0".to_string(),
                self.net0(),
                "--ostype".to_string(),
                "l26".to_string(),
            ],
            vec![
                "qm".to_string(),
                "importdisk".to_string(),
                id.clone(),
                self.resolved_image_path().to_string_lossy().into_owned(),
                self.storage.clone(),
            ],
            qm_set(&[
                "--scsihw",
                "virtio-scsi-pci",
                "--scsi0",
                format!("{}:vm-{}-disk-0", self.storage, self.vm_id).as_str(),
            ]),
            qm_set(&["--boot", "order=scsi0"]),
            qm_set(&["--ide2", format!("{}:cloudinit", self.storage).as_str()]),
            qm_set(&["--serial0", "socket", "--vga", "serial0"]),
            qm_set(&["--agent", "enabled=1"]),
        ];

        if let Some(ref user) = self.ciuser {
            commands.push(qm_set(&["--ciuser", user.as_str()]));
        }
        if let Some(ref keys) = self.sshkeys {
            let path = expand_home(&keys.to_string_lossy());
            commands.push(qm_set(&["--sshkeys", path.to_string_lossy().as_ref()]));
        }
        if let Some(ref ipconfig) = self.ipconfig {
            let value = if ipconfig.trim().eq_ignore_ascii_case("dhcp") {
                "ip=dhcp"
            } else {
                ipconfig.as_str()
            };
            commands.push(qm_set(&["--ipconfig0", value]));
        }
        if let Some(ref size) = self.disk_resize {
            commands.push(vec![
                "qm".to_string(),
                "resize".to_string(),
                id.clone(),
                "scsi0".to_string(),
                size.clone(),
            ]);
        }

        commands.push(vec!["qm".to_string(), "template".to_string(), id]);
        commands
    }
}

/// Check whether the process runs as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Look a command up on PATH
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Creates a VM template with `qm`
pub struct TemplateBuilder {
    options: TemplateOptions,
}

impl TemplateBuilder {
    pub fn new(options: TemplateOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    /// Check root, required commands and a free VMID
    pub async fn preflight(&self) -> Result<()> {
        if !is_root() {
            return Err(HomelabError::Template(
                "must be run as root on a Proxmox host (try: sudo -i)".to_string(),
            ));
        }

        for cmd in REQUIRED_COMMANDS {
            if find_on_path(cmd).is_none() {
                return Err(HomelabError::Template(format!(
                    "missing required command {:?}",
                    cmd
                )));
            }
        }

        // In a dry run the VMID is assumed free so the whole plan prints
        if !self.options.dry_run && self.vm_exists().await? {
            return Err(HomelabError::Template(format!(
                "VMID {} already exists; choose another or delete the existing VM",
                self.options.vm_id
            )));
        }

        if let Some(ref path) = self.options.image_path {
            let path = expand_home(&path.to_string_lossy());
            if !path.exists() {
                return Err(HomelabError::Template(format!(
                    "image path does not exist: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    async fn vm_exists(&self) -> Result<bool> {
        let status = Command::new("qm")
            .arg("status")
            .arg(self.options.vm_id.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn download_image(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !self.options.dry_run {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let present = tokio::fs::metadata(dest)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if present {
            tracing::info!("Image already exists: {} (skipping download)", dest.display());
            return Ok(());
        }

        self.run_command(&[
            "wget".to_string(),
            "-O".to_string(),
            dest.to_string_lossy().into_owned(),
            self.options.image_url.clone(),
        ])
        .await
    }

    async fn run_command(&self, cmd: &[String]) -> Result<()> {
        tracing::info!("+ {}", cmd.join(" "));
        if self.options.dry_run {
            return Ok(());
        }

        let Some((program, args)) = cmd.split_first() else {
            return Ok(());
        };
        let status = Command::new(program).args(args).status().await?;
        if !status.success() {
            return Err(HomelabError::Template(format!(
                "{} failed with exit code {}",
                cmd.join(" "),
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    /// Build the template
    pub async fn run(&self) -> Result<()> {
        self.preflight().await?;

        if self.options.image_path.is_none() {
            self.download_image(&self.options.resolved_image_path()).await?;
        }

        for cmd in self.options.commands() {
            self.run_command(&cmd).await?;
        }

        tracing::info!(
            "Template {} ({}) created on storage {}",
            self.options.vm_id,
            self.options.name,
            self.options.storage
        );
        Ok(())
    }
}
