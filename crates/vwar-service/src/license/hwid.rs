//! Hardware identity boundary.
//!
//! The license server binds a key to `{processor_id, motherboard_id}`.
//! Derivation is deliberately shallow here: env overrides first (useful for
//! fleet provisioning and tests), then best-effort platform probes.

use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareIdentity {
    pub processor_id: String,
    pub motherboard_id: String,
}

pub fn detect() -> HardwareIdentity {
    let processor_id = std::env::var("VWAR_PROCESSOR_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(probe_processor);
    let motherboard_id = std::env::var("VWAR_MOTHERBOARD_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(probe_motherboard);
    HardwareIdentity {
        processor_id,
        motherboard_id,
    }
}

fn probe_processor() -> String {
    let mut sys = System::new();
    sys.refresh_cpu();
    let brand = sys.global_cpu_info().brand().trim().to_string();
    if brand.is_empty() {
        "UNKNOWN_CPU".to_string()
    } else {
        brand
    }
}

fn probe_motherboard() -> String {
    #[cfg(target_os = "linux")]
    {
        for probe in [
            "/sys/class/dmi/id/board_serial",
            "/sys/class/dmi/id/board_name",
            "/etc/machine-id",
        ] {
            if let Ok(raw) = std::fs::read_to_string(probe) {
                let value = raw.trim().to_string();
                if !value.is_empty() {
                    return value;
                }
            }
        }
    }
    "UNKNOWN_BOARD".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        std::env::set_var("VWAR_PROCESSOR_ID", "cpu-test");
        std::env::set_var("VWAR_MOTHERBOARD_ID", "mobo-test");
        let hw = detect();
        assert_eq!(hw.processor_id, "cpu-test");
        assert_eq!(hw.motherboard_id, "mobo-test");
        std::env::remove_var("VWAR_PROCESSOR_ID");
        std::env::remove_var("VWAR_MOTHERBOARD_ID");
    }
}
