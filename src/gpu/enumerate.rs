//! Render-node enumeration and vendor driver construction.
//!
//! Walks the drm class directory for `renderD*` nodes, classifies each by
//! its kernel driver, resolves the PCI identity, and starts one supervised
//! [`GpuDevice`] per supported node. Unsupported drivers and NVIDIA nodes
//! without a loadable NVML are skipped with a log line, never a failure.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, error, warn};

use crate::gpu::amdgpu::AmdGpu;
use crate::gpu::intel::i915::IntelI915;
use crate::gpu::intel::xe::IntelXe;
use crate::gpu::msm::{MsmDpu, MsmKgsl};
use crate::gpu::nvidia::NvidiaGpu;
use crate::gpu::panfrost::Panfrost;
use crate::gpu::{DeviceInfo, GpuDevice, VendorGpu};

const DRM_ROOT: &str = "/sys/class/drm";

const SUPPORTED_DRIVERS: &[&str] = &[
    "amdgpu", "nvidia", "i915", "xe", "panfrost", "msm_dpu", "msm_drm",
];

/// Enumerates and starts all supported GPUs on the system.
pub fn enumerate_gpus() -> Vec<GpuDevice> {
    enumerate_gpus_in(Path::new(DRM_ROOT))
}

/// Enumeration against an explicit drm class root.
pub fn enumerate_gpus_in(drm_root: &Path) -> Vec<GpuDevice> {
    let mut devices = Vec::new();

    for drm_node in render_nodes(drm_root) {
        let node_path = drm_root.join(&drm_node);

        let driver = match driver_name(&node_path) {
            Some(driver) => driver,
            None => continue,
        };

        if !SUPPORTED_DRIVERS.contains(&driver.as_str()) {
            warn!(
                "node {:?} is using driver {:?} which is unsupported. Skipping...",
                drm_node, driver
            );
            continue;
        }

        let pci_dev = pci_device_address(&node_path).unwrap_or_default();
        let vendor_id = read_hex_id(&node_path.join("device/vendor"));
        let device_id = read_hex_id(&node_path.join("device/device"));

        let info = DeviceInfo {
            drm_node: drm_node.clone(),
            node_path,
            pci_dev,
            vendor_id,
            device_id,
            driver: driver.clone(),
        };

        let vendor: Box<dyn VendorGpu> = match driver.as_str() {
            "i915" => Box::new(IntelI915::new(&info)),
            "xe" => Box::new(IntelXe::new(&info)),
            "amdgpu" => Box::new(AmdGpu::new(&info)),
            "nvidia" => match NvidiaGpu::new(&info) {
                Some(gpu) => Box::new(gpu),
                None => {
                    warn!(
                        "NVML is not loaded. NVIDIA metrics are not available! Skipping node {}.",
                        drm_node
                    );
                    continue;
                }
            },
            "panfrost" => Box::new(Panfrost::new(&info)),
            "msm_dpu" => Box::new(MsmDpu::new(&info)),
            "msm_drm" => Box::new(MsmKgsl::new(&info)),
            _ => continue,
        };

        debug!(
            "GPU found: drm_node: {}, driver: {}, vendor_id: {:x} device_id: {:x} pci_dev: {}",
            info.drm_node, info.driver, info.vendor_id, info.device_id, info.pci_dev
        );

        devices.push(GpuDevice::spawn(info, vendor));
    }

    warn_on_multiple_active(&devices);
    devices
}

/// Which device is "active" is external policy; this core only flags the
/// misconfiguration of several devices being marked at once.
pub fn warn_on_multiple_active(devices: &[GpuDevice]) {
    let active: Vec<&GpuDevice> = devices.iter().filter(|d| d.is_active()).collect();

    if active.len() < 2 {
        return;
    }

    if let Some(gpu) = active.first() {
        warn!(
            "You have more than 1 active GPU. If you use metric logging, only this one is \
             reported: node = {}, vendor = {:x}, pci_dev = {}",
            gpu.info.drm_node, gpu.info.vendor_id, gpu.info.pci_dev
        );
    }
}

/// `renderD<digits>` entries below the drm root, in sorted order.
fn render_nodes(drm_root: &Path) -> BTreeSet<String> {
    let mut nodes = BTreeSet::new();

    let entries = match fs::read_dir(drm_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read {:?}: {}", drm_root, e);
            return nodes;
        }
    };

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        match name.strip_prefix("renderD") {
            Some(suffix) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
                nodes.insert(name);
            }
            _ => {}
        }
    }

    nodes
}

/// Kernel driver a node is bound to, from its `device/driver` symlink.
fn driver_name(node_path: &Path) -> Option<String> {
    let driver_link = node_path.join("device/driver");

    if !driver_link.exists() {
        error!("{:?} doesn't exist", driver_link);
        return None;
    }

    let target = match fs::read_link(&driver_link) {
        Ok(target) => target,
        Err(e) => {
            error!("{:?} is not a symlink (it should be): {}", driver_link, e);
            return None;
        }
    };

    target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

/// PCI bus address of a node, e.g. `0000:03:00.0`.
///
/// The `device/subsystem` link must land on the pci bus; the address is the
/// final component of the `device` link target.
fn pci_device_address(node_path: &Path) -> Option<String> {
    let subsystem = fs::canonicalize(node_path.join("device/subsystem")).ok()?;

    if subsystem.file_name()?.to_string_lossy() != "pci" {
        return None;
    }

    let device = fs::read_link(node_path.join("device")).ok()?;
    device
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

/// Numeric id file like `0x1002`; parse failures yield 0, not an error.
fn read_hex_id(path: &Path) -> u32 {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return 0,
    };

    let trimmed = content.trim().trim_start_matches("0x");
    match u32::from_str_radix(trimmed, 16) {
        Ok(id) => id,
        Err(e) => {
            error!("failed to parse id from {:?}: {}", path, e);
            0
        }
    }
}
