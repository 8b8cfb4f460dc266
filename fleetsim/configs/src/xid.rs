use std::{collections::BTreeMap, sync::LazyLock};

/// One entry of the XID catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XidInfo {
    pub code: u32,
    pub name: &'static str,
    pub fatal: bool,
    pub description: &'static str,
}

/// XID codes drawn from when a scenario configures no distribution.
pub const DEFAULT_XID_CODES: [u32; 13] = [13, 31, 32, 43, 45, 48, 63, 64, 74, 79, 92, 94, 95];

static CATALOG: LazyLock<BTreeMap<u32, XidInfo>> = LazyLock::new(|| {
    let entries = [
        XidInfo {
            code: 13,
            name: "Graphics Engine Exception",
            fatal: false,
            description: "GPU graphics engine raised an exception; workload may retry",
        },
        XidInfo {
            code: 31,
            name: "GPU memory page fault",
            fatal: false,
            description: "Illegal address access by a GPU client, typically an application bug",
        },
        XidInfo {
            code: 32,
            name: "Invalid or corrupted push buffer stream",
            fatal: false,
            description: "DMA controller rejected a corrupted command stream",
        },
        XidInfo {
            code: 43,
            name: "GPU stopped processing",
            fatal: true,
            description: "GPU ceased responding to work submission",
        },
        XidInfo {
            code: 45,
            name: "Preemptive cleanup",
            fatal: false,
            description: "Driver tore down channels owned by a terminated client",
        },
        XidInfo {
            code: 48,
            name: "Double Bit ECC Error",
            fatal: true,
            description: "Uncorrectable double-bit ECC error in device memory",
        },
        XidInfo {
            code: 63,
            name: "ECC page retirement/row remapping failure",
            fatal: true,
            description: "Row remapper could not retire a failing memory page",
        },
        XidInfo {
            code: 64,
            name: "ECC page retirement/row remapping recording event",
            fatal: false,
            description: "Row remapping recorded; pending reset to take effect",
        },
        XidInfo {
            code: 68,
            name: "NVDEC0 Exception",
            fatal: false,
            description: "Video decoder engine raised an exception",
        },
        XidInfo {
            code: 74,
            name: "NVLink Error",
            fatal: true,
            description: "NVLink training or CRC failure on an inter-GPU link",
        },
        XidInfo {
            code: 79,
            name: "GPU has fallen off the bus",
            fatal: true,
            description: "GPU no longer enumerates on PCIe; host lost contact",
        },
        XidInfo {
            code: 92,
            name: "High single-bit ECC error rate",
            fatal: false,
            description: "Corrected ECC error rate exceeded the reporting threshold",
        },
        XidInfo {
            code: 94,
            name: "Contained ECC error",
            fatal: false,
            description: "Uncorrectable error contained to the faulting application",
        },
        XidInfo {
            code: 95,
            name: "Uncontained ECC error",
            fatal: true,
            description: "Uncorrectable error could not be contained; GPU reset required",
        },
    ];

    entries.into_iter().map(|info| (info.code, info)).collect()
});

/// Looks up a code in the process-wide catalog.
#[must_use]
pub fn xid_info(code: u32) -> Option<&'static XidInfo> {
    CATALOG.get(&code)
}

/// True iff the code is catalogued and classified fatal.
#[must_use]
pub fn is_fatal_xid(code: u32) -> bool {
    xid_info(code).is_some_and(|info| info.fatal)
}

/// All catalogued codes in ascending order.
#[must_use]
pub fn known_xid_codes() -> Vec<u32> {
    CATALOG.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_matches_fixed_table() {
        assert_eq!(known_xid_codes().len(), 14);

        let bus_drop = xid_info(79).expect("xid 79 present");
        assert_eq!(bus_drop.name, "GPU has fallen off the bus");
        assert!(bus_drop.fatal);

        assert!(is_fatal_xid(43));
        assert!(is_fatal_xid(48));
        assert!(is_fatal_xid(63));
        assert!(is_fatal_xid(74));
        assert!(is_fatal_xid(95));

        assert!(!is_fatal_xid(13));
        assert!(!is_fatal_xid(68));
        assert!(!is_fatal_xid(94));
    }

    #[test]
    fn unknown_codes_are_absent_and_not_fatal() {
        assert!(xid_info(9999).is_none());
        assert!(!is_fatal_xid(9999));
    }

    #[test]
    fn default_draw_set_is_catalogued() {
        for code in DEFAULT_XID_CODES {
            assert!(xid_info(code).is_some(), "code {code} missing from catalog");
        }
    }
}
