//! NVIDIA GPU driver.
//!
//! The proprietary driver exposes nothing useful through sysfs; every value
//! comes from NVML (see [`nvml`]). Construction fails when the library is
//! missing or the device handle cannot be resolved, and the enumerator
//! skips the node instead of crashing.

pub mod nvml;

use std::ffi::CString;
use tracing::error;

use crate::gpu::{DeviceInfo, VendorGpu};
use nvml::{
    NvmlDevice, NvmlLib, NvmlMemory, NvmlProcessInfoV1, NvmlUtilization, NVML_CLOCK_GRAPHICS,
    NVML_CLOCK_MEM, NVML_ERROR_INSUFFICIENT_SIZE, NVML_SUCCESS, NVML_TEMPERATURE_GPU,
};

// Throttle-reason masks from the NVML clocksThrottleReasons bitfield.
const THROTTLE_MASK_POWER: u64 = 0x8C;
const THROTTLE_MASK_TEMP: u64 = 0x60;
const THROTTLE_MASK_OTHER: u64 = 0x112;

pub struct NvidiaGpu {
    lib: &'static NvmlLib,
    device: NvmlDevice,
}

// SAFETY: the device handle is an opaque NVML token; NVML is documented
// thread-safe and the handle is only used from the device's worker thread.
unsafe impl Send for NvidiaGpu {}

impl NvidiaGpu {
    /// Initializes NVML and resolves the device by PCI address. `None`
    /// disqualifies the whole device.
    pub fn new(info: &DeviceInfo) -> Option<Self> {
        let lib = nvml::nvml()?;

        // SAFETY: nvmlInit_v2 takes no arguments; repeated calls are
        // reference counted by the library
        let result = unsafe { (lib.nvmlInit_v2)() };
        if result != NVML_SUCCESS {
            error!("NVML initialization failed: {}", lib.error_string(result));
            return None;
        }

        let pci = CString::new(info.pci_dev.as_str()).ok()?;
        let mut device: NvmlDevice = std::ptr::null_mut();

        // SAFETY: pci is a valid C string, device is a valid out-pointer
        let result = unsafe { (lib.nvmlDeviceGetHandleByPciBusId_v2)(pci.as_ptr(), &mut device) };
        if result != NVML_SUCCESS {
            error!(
                "getting device handle by PCI bus id failed: {}",
                lib.error_string(result)
            );
            return None;
        }

        Some(Self { lib, device })
    }

    /// Graphics process list via the usual two-call size negotiation.
    fn processes(&self) -> Vec<NvmlProcessInfoV1> {
        let mut count: u32 = 0;

        // SAFETY: a zero-count call reports the required buffer size
        let ret = unsafe {
            (self.lib.nvmlDeviceGetGraphicsRunningProcesses)(
                self.device,
                &mut count,
                std::ptr::null_mut(),
            )
        };

        if ret != NVML_ERROR_INSUFFICIENT_SIZE {
            return Vec::new();
        }

        let mut processes = vec![NvmlProcessInfoV1::default(); count as usize];

        // SAFETY: the buffer holds exactly `count` entries
        let ret = unsafe {
            (self.lib.nvmlDeviceGetGraphicsRunningProcesses)(
                self.device,
                &mut count,
                processes.as_mut_ptr(),
            )
        };

        if ret != NVML_SUCCESS {
            return Vec::new();
        }

        processes.truncate(count as usize);
        processes
    }

    fn clock(&self, clock_type: u32) -> i32 {
        let mut clock: u32 = 0;
        // SAFETY: clock is a valid out-pointer
        let ret = unsafe { (self.lib.nvmlDeviceGetClockInfo)(self.device, clock_type, &mut clock) };
        if ret != NVML_SUCCESS {
            return 0;
        }
        clock as i32
    }

    fn throttle_reasons(&self) -> u64 {
        let mut reasons: u64 = 0;
        // SAFETY: reasons is a valid out-pointer
        let ret = unsafe {
            (self.lib.nvmlDeviceGetCurrentClocksThrottleReasons)(self.device, &mut reasons)
        };
        if ret != NVML_SUCCESS {
            return 0;
        }
        reasons
    }

    fn memory_info(&self) -> NvmlMemory {
        let mut memory = NvmlMemory::default();
        // SAFETY: memory is a valid out-pointer
        let ret = unsafe { (self.lib.nvmlDeviceGetMemoryInfo)(self.device, &mut memory) };
        if ret != NVML_SUCCESS {
            return NvmlMemory::default();
        }
        memory
    }
}

impl VendorGpu for NvidiaGpu {
    fn name(&self) -> &'static str {
        "nvidia"
    }

    fn load(&mut self) -> i32 {
        let mut utilization = NvmlUtilization::default();
        // SAFETY: utilization is a valid out-pointer
        let ret =
            unsafe { (self.lib.nvmlDeviceGetUtilizationRates)(self.device, &mut utilization) };
        if ret != NVML_SUCCESS {
            return 0;
        }
        utilization.gpu as i32
    }

    fn vram_used(&mut self) -> f32 {
        self.memory_info().used as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn memory_total(&mut self) -> f32 {
        self.memory_info().total as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn memory_clock(&mut self) -> i32 {
        self.clock(NVML_CLOCK_MEM)
    }

    fn temperature(&mut self) -> i32 {
        let mut temperature: u32 = 0;
        // SAFETY: temperature is a valid out-pointer
        let ret = unsafe {
            (self.lib.nvmlDeviceGetTemperature)(self.device, NVML_TEMPERATURE_GPU, &mut temperature)
        };
        if ret != NVML_SUCCESS {
            return 0;
        }
        temperature as i32
    }

    fn core_clock(&mut self) -> i32 {
        self.clock(NVML_CLOCK_GRAPHICS)
    }

    fn power_usage(&mut self) -> f32 {
        let mut milliwatts: u32 = 0;
        // SAFETY: milliwatts is a valid out-pointer
        let ret = unsafe { (self.lib.nvmlDeviceGetPowerUsage)(self.device, &mut milliwatts) };
        if ret != NVML_SUCCESS {
            return 0.0;
        }
        milliwatts as f32 / 1000.0
    }

    fn power_limit(&mut self) -> f32 {
        let mut milliwatts: u32 = 0;
        // SAFETY: milliwatts is a valid out-pointer
        let ret =
            unsafe { (self.lib.nvmlDeviceGetPowerManagementLimit)(self.device, &mut milliwatts) };
        if ret != NVML_SUCCESS {
            return 0.0;
        }
        milliwatts as f32 / 1000.0
    }

    fn is_power_throttled(&mut self) -> bool {
        self.throttle_reasons() & THROTTLE_MASK_POWER != 0
    }

    fn is_temp_throttled(&mut self) -> bool {
        self.throttle_reasons() & THROTTLE_MASK_TEMP != 0
    }

    fn is_other_throttled(&mut self) -> bool {
        self.throttle_reasons() & THROTTLE_MASK_OTHER != 0
    }

    fn fan_speed(&mut self) -> i32 {
        let mut percent: u32 = 0;
        // SAFETY: percent is a valid out-pointer
        let ret = unsafe { (self.lib.nvmlDeviceGetFanSpeed)(self.device, &mut percent) };
        if ret != NVML_SUCCESS {
            return 0;
        }
        percent as i32
    }

    /// NVML reports fan duty as a percentage, not RPM.
    fn fan_rpm(&mut self) -> bool {
        false
    }

    fn process_vram_used(&mut self, pid: u32) -> f32 {
        self.processes()
            .iter()
            .find(|process| process.pid == pid)
            .map(|process| process.used_gpu_memory as f32 / 1024.0 / 1024.0 / 1024.0)
            .unwrap_or(0.0)
    }
}
