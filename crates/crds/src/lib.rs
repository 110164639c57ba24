//! Intel Device Plugin CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the device plugin operator.
//!
//! - `GpuDevicePlugin`: declares how the GPU device plugin DaemonSet runs
//! - `DevicePlugin`: naming and schema-generation seam shared by plugin kinds
//! - Status condition and workload reference types

pub mod conditions;
pub mod device_plugin;
pub mod gpu_device_plugin;

pub use conditions::*;
pub use device_plugin::*;
pub use gpu_device_plugin::*;
