//! Failure payload generation. Every draw goes through the engine's seeded
//! RNG and every weighted table is iterated in sorted key order, so a reroll
//! with the same seed reproduces the exact failure stream.

use fleetsim_configs::{ChaosConfig, FailureType, xid};
use fleetsim_core::protocol::InjectedFailure;
use rand::Rng;
use rand_chacha::ChaCha20Rng;

const GPU_SLOTS: i32 = 8;

const TEMPERATURE_MESSAGES: [&str; 3] = [
    "GPU temperature 92C exceeds slowdown threshold",
    "GPU temperature 97C exceeds shutdown threshold",
    "GPU memory temperature 88C above operating range",
];

const NVML_MESSAGES: [&str; 3] = [
    "NVML initialization failed",
    "NVML device handle lost",
    "NVML query timed out",
];

const BOOT_MESSAGES: [&str; 3] = [
    "GPU driver failed to load during boot",
    "CUDA runtime initialization failed",
    "device enumeration failed at boot",
];

const NETWORK_MESSAGES: [&str; 3] = [
    "network link flapping detected",
    "packet loss above threshold on data plane",
    "NIC reset under load",
];

const DEVICE_MESSAGES: [&str; 2] = [
    "PCIe link width degraded to x8",
    "device dropped to recovery firmware",
];

const MEMORY_MESSAGES: [&str; 2] = [
    "uncorrectable DRAM fault detected",
    "row remapping pending GPU reset",
];

const NVLINK_MESSAGES: [&str; 2] = [
    "NVLink lane degraded",
    "NVLink CRC error burst observed",
];

/// Weighted choice over the configured failure kinds; xid_error when none
/// are configured.
pub(crate) fn pick_failure_type(rng: &mut ChaCha20Rng, config: &ChaosConfig) -> FailureType {
    if config.failure_types.is_empty() {
        return FailureType::XidError;
    }
    let weights: Vec<u32> = config
        .failure_types
        .iter()
        .map(|entry| entry.weight)
        .collect();
    config.failure_types[weighted_index(rng, &weights)].failure_type
}

pub(crate) fn generate_failure(
    rng: &mut ChaCha20Rng,
    config: &ChaosConfig,
    failure_type: FailureType,
    now_ms: u64,
) -> InjectedFailure {
    match failure_type {
        FailureType::XidError => generate_xid_failure(rng, config, now_ms),
        FailureType::Temperature => InjectedFailure {
            failure_type,
            xid_code: 0,
            gpu_index: rng.gen_range(0..GPU_SLOTS),
            message: pick(rng, &TEMPERATURE_MESSAGES),
            injected_at_ms: now_ms,
        },
        FailureType::NvmlFailure => whole_node(failure_type, pick(rng, &NVML_MESSAGES), now_ms),
        FailureType::BootFailure => whole_node(failure_type, pick(rng, &BOOT_MESSAGES), now_ms),
        FailureType::Network => whole_node(failure_type, pick(rng, &NETWORK_MESSAGES), now_ms),
        FailureType::DeviceError => InjectedFailure {
            failure_type,
            xid_code: 0,
            gpu_index: rng.gen_range(0..GPU_SLOTS),
            message: pick(rng, &DEVICE_MESSAGES),
            injected_at_ms: now_ms,
        },
        FailureType::MemoryError => InjectedFailure {
            failure_type,
            xid_code: 0,
            gpu_index: rng.gen_range(0..GPU_SLOTS),
            message: pick(rng, &MEMORY_MESSAGES),
            injected_at_ms: now_ms,
        },
        FailureType::NvlinkError => InjectedFailure {
            failure_type,
            xid_code: 0,
            gpu_index: rng.gen_range(0..GPU_SLOTS),
            message: pick(rng, &NVLINK_MESSAGES),
            injected_at_ms: now_ms,
        },
    }
}

/// XID draw from the configured distribution, or uniform over the default
/// set; the message comes from the catalog.
pub(crate) fn generate_xid_failure(
    rng: &mut ChaCha20Rng,
    config: &ChaosConfig,
    now_ms: u64,
) -> InjectedFailure {
    let code = if config.xid_distribution.is_empty() {
        xid::DEFAULT_XID_CODES[rng.gen_range(0..xid::DEFAULT_XID_CODES.len())]
    } else {
        let codes: Vec<u32> = config.xid_distribution.keys().copied().collect();
        let weights: Vec<u32> = config.xid_distribution.values().copied().collect();
        codes[weighted_index(rng, &weights)]
    };
    xid_failure_with_code(rng, code, now_ms)
}

/// XID failure with a fixed code (outages use 79, the bus drop).
pub(crate) fn xid_failure_with_code(
    rng: &mut ChaCha20Rng,
    code: u32,
    now_ms: u64,
) -> InjectedFailure {
    InjectedFailure {
        failure_type: FailureType::XidError,
        xid_code: code,
        gpu_index: rng.gen_range(0..GPU_SLOTS),
        message: xid::xid_info(code)
            .map_or_else(|| format!("XID {code}"), |info| info.name.to_owned()),
        injected_at_ms: now_ms,
    }
}

fn whole_node(failure_type: FailureType, message: String, now_ms: u64) -> InjectedFailure {
    InjectedFailure {
        failure_type,
        xid_code: 0,
        gpu_index: -1,
        message,
        injected_at_ms: now_ms,
    }
}

fn pick(rng: &mut ChaCha20Rng, messages: &[&str]) -> String {
    messages[rng.gen_range(0..messages.len())].to_owned()
}

fn weighted_index(rng: &mut ChaCha20Rng, weights: &[u32]) -> usize {
    let total: u64 = weights.iter().copied().map(u64::from).sum();
    if total == 0 {
        return 0;
    }
    let mut roll = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}
