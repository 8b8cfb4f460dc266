use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of faults an agent can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    XidError,
    Temperature,
    NvmlFailure,
    BootFailure,
    DeviceError,
    MemoryError,
    NvlinkError,
    Network,
}

impl FailureType {
    pub const ALL: [Self; 8] = [
        Self::XidError,
        Self::Temperature,
        Self::NvmlFailure,
        Self::BootFailure,
        Self::DeviceError,
        Self::MemoryError,
        Self::NvlinkError,
        Self::Network,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::XidError => "xid_error",
            Self::Temperature => "temperature",
            Self::NvmlFailure => "nvml_failure",
            Self::BootFailure => "boot_failure",
            Self::DeviceError => "device_error",
            Self::MemoryError => "memory_error",
            Self::NvlinkError => "nvlink_error",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
