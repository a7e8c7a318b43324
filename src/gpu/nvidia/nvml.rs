//! Runtime loader for the NVIDIA management library.
//!
//! `libnvidia-ml.so.1` ships with the proprietary driver and is not a
//! build-time dependency: the library is opened with `dlopen` and every
//! entry point resolved by name. Resolution is all-or-nothing — if the
//! library or any required symbol is missing, NVML is reported unavailable
//! and NVIDIA devices are skipped during enumeration.

use once_cell::sync::Lazy;
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use thiserror::Error;
use tracing::debug;

const LIBRARY_NAME: &CStr = c"libnvidia-ml.so.1";

pub const NVML_SUCCESS: NvmlReturn = 0;
pub const NVML_ERROR_INSUFFICIENT_SIZE: NvmlReturn = 7;

pub const NVML_CLOCK_GRAPHICS: u32 = 0;
pub const NVML_CLOCK_MEM: u32 = 2;
pub const NVML_TEMPERATURE_GPU: u32 = 0;

pub type NvmlReturn = i32;
pub type NvmlDevice = *mut c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlUtilization {
    pub gpu: u32,
    pub memory: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlMemory {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlProcessInfoV1 {
    pub pid: u32,
    pub used_gpu_memory: u64,
}

#[derive(Debug, Error)]
pub enum NvmlLoadError {
    #[error("failed to open {0:?}")]
    LibraryNotFound(&'static CStr),
    #[error("missing symbol {0}")]
    MissingSymbol(&'static str),
}

/// Resolved NVML entry points.
///
/// Field names follow the library's exported symbols.
#[allow(non_snake_case)]
pub struct NvmlLib {
    _handle: LibraryHandle,

    pub nvmlInit_v2: unsafe extern "C" fn() -> NvmlReturn,
    pub nvmlShutdown: unsafe extern "C" fn() -> NvmlReturn,
    pub nvmlErrorString: unsafe extern "C" fn(NvmlReturn) -> *const c_char,
    pub nvmlDeviceGetHandleByPciBusId_v2:
        unsafe extern "C" fn(*const c_char, *mut NvmlDevice) -> NvmlReturn,
    pub nvmlDeviceGetUtilizationRates:
        unsafe extern "C" fn(NvmlDevice, *mut NvmlUtilization) -> NvmlReturn,
    pub nvmlDeviceGetMemoryInfo: unsafe extern "C" fn(NvmlDevice, *mut NvmlMemory) -> NvmlReturn,
    pub nvmlDeviceGetClockInfo: unsafe extern "C" fn(NvmlDevice, u32, *mut u32) -> NvmlReturn,
    pub nvmlDeviceGetTemperature: unsafe extern "C" fn(NvmlDevice, u32, *mut u32) -> NvmlReturn,
    pub nvmlDeviceGetPowerUsage: unsafe extern "C" fn(NvmlDevice, *mut u32) -> NvmlReturn,
    pub nvmlDeviceGetPowerManagementLimit:
        unsafe extern "C" fn(NvmlDevice, *mut u32) -> NvmlReturn,
    pub nvmlDeviceGetCurrentClocksThrottleReasons:
        unsafe extern "C" fn(NvmlDevice, *mut u64) -> NvmlReturn,
    pub nvmlDeviceGetFanSpeed: unsafe extern "C" fn(NvmlDevice, *mut u32) -> NvmlReturn,
    pub nvmlDeviceGetGraphicsRunningProcesses:
        unsafe extern "C" fn(NvmlDevice, *mut u32, *mut NvmlProcessInfoV1) -> NvmlReturn,
}

struct LibraryHandle(*mut c_void);

// SAFETY: the handle is only used as an opaque token after loading; NVML
// itself is documented thread-safe.
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

macro_rules! resolve {
    ($handle:expr, $name:ident) => {{
        let symbol = concat!(stringify!($name), "\0");
        // SAFETY: symbol is a valid NUL-terminated C string and the handle
        // came from dlopen
        let ptr = unsafe { libc::dlsym($handle, symbol.as_ptr().cast()) };
        if ptr.is_null() {
            // SAFETY: handle is still open
            unsafe { libc::dlclose($handle) };
            return Err(NvmlLoadError::MissingSymbol(stringify!($name)));
        }
        // SAFETY: an extern "C" fn pointer has the same representation as
        // the non-null void pointer dlsym returned
        unsafe { mem::transmute(ptr) }
    }};
}

impl NvmlLib {
    fn load() -> Result<Self, NvmlLoadError> {
        // SAFETY: dlopen with a static library name; NODELETE because the
        // handle lives for the whole process
        let handle =
            unsafe { libc::dlopen(LIBRARY_NAME.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NODELETE) };

        if handle.is_null() {
            return Err(NvmlLoadError::LibraryNotFound(LIBRARY_NAME));
        }

        Ok(Self {
            _handle: LibraryHandle(handle),
            nvmlInit_v2: resolve!(handle, nvmlInit_v2),
            nvmlShutdown: resolve!(handle, nvmlShutdown),
            nvmlErrorString: resolve!(handle, nvmlErrorString),
            nvmlDeviceGetHandleByPciBusId_v2: resolve!(handle, nvmlDeviceGetHandleByPciBusId_v2),
            nvmlDeviceGetUtilizationRates: resolve!(handle, nvmlDeviceGetUtilizationRates),
            nvmlDeviceGetMemoryInfo: resolve!(handle, nvmlDeviceGetMemoryInfo),
            nvmlDeviceGetClockInfo: resolve!(handle, nvmlDeviceGetClockInfo),
            nvmlDeviceGetTemperature: resolve!(handle, nvmlDeviceGetTemperature),
            nvmlDeviceGetPowerUsage: resolve!(handle, nvmlDeviceGetPowerUsage),
            nvmlDeviceGetPowerManagementLimit: resolve!(handle, nvmlDeviceGetPowerManagementLimit),
            nvmlDeviceGetCurrentClocksThrottleReasons: resolve!(
                handle,
                nvmlDeviceGetCurrentClocksThrottleReasons
            ),
            nvmlDeviceGetFanSpeed: resolve!(handle, nvmlDeviceGetFanSpeed),
            nvmlDeviceGetGraphicsRunningProcesses: resolve!(
                handle,
                nvmlDeviceGetGraphicsRunningProcesses
            ),
        })
    }

    /// Human-readable message for an NVML return code.
    pub fn error_string(&self, code: NvmlReturn) -> String {
        // SAFETY: nvmlErrorString returns a static string for any code
        let message = unsafe { (self.nvmlErrorString)(code) };
        if message.is_null() {
            return format!("nvml error {}", code);
        }
        // SAFETY: non-null, NUL-terminated, static lifetime
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Process-wide NVML handle, loaded on first use.
pub fn nvml() -> Option<&'static NvmlLib> {
    static NVML: Lazy<Option<NvmlLib>> = Lazy::new(|| match NvmlLib::load() {
        Ok(lib) => Some(lib),
        Err(e) => {
            debug!("nvml unavailable: {}", e);
            None
        }
    });

    NVML.as_ref()
}
