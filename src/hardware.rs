//! Accelerator detection
//!
//! Runs `tt-smi -s` once and extracts the board type (N150, N300, P150, ...)
//! and firmware bundle version. Any failure degrades to [`Hardware::Unknown`];
//! the caller then considers every spec with a warning.

use crate::process::{CommandRunner, Invocation};
use std::time::Duration;

/// Architecture families and the device classes that share silicon
pub const ARCH_FAMILIES: &[(&str, &[&str])] = &[
    ("wormhole_b0", &["N150", "N300", "T3K", "N150X4"]),
    ("blackhole", &["P100", "P150", "P150X4", "P150X8"]),
];

/// Result of hardware detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hardware {
    Detected {
        device_type: String,
        firmware_version: Option<String>,
    },
    Unknown,
}

impl Hardware {
    pub fn device_type(&self) -> Option<&str> {
        match self {
            Self::Detected { device_type, .. } => Some(device_type),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detected { device_type, .. } => write!(f, "{}", device_type),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Architecture family of a device class, e.g. N300 -> wormhole_b0
pub fn arch_family(device_type: &str) -> Option<&'static str> {
    let device = device_type.to_uppercase();
    ARCH_FAMILIES
        .iter()
        .find(|(_, devices)| devices.contains(&device.as_str()))
        .map(|(family, _)| *family)
}

/// Detect the attached accelerator. One attempt, no retries.
pub async fn detect(runner: &dyn CommandRunner, smi_binary: &str, timeout: Duration) -> Hardware {
    let invocation = Invocation::new(smi_binary).arg("-s");

    let output = match runner.run(&invocation, timeout).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(
                error = %e,
                binary = %smi_binary,
                "Hardware detection failed, treating hardware as unknown"
            );
            return Hardware::Unknown;
        }
    };

    if !output.success() {
        tracing::warn!(
            exit_code = ?output.exit_code,
            stderr = %output.diagnostic_tail(200),
            "Hardware detection exited with an error, treating hardware as unknown"
        );
        return Hardware::Unknown;
    }

    let hardware = parse_smi_output(&output.combined());
    match &hardware {
        Hardware::Detected {
            device_type,
            firmware_version,
        } => tracing::info!(
            device = %device_type,
            firmware = ?firmware_version,
            "Detected Tenstorrent hardware"
        ),
        Hardware::Unknown => {
            tracing::warn!("Could not determine device type from tt-smi output")
        }
    }
    hardware
}

/// Parse `tt-smi -s` output: embedded JSON first, text lines as fallback
pub fn parse_smi_output(output: &str) -> Hardware {
    let from_json = extract_json(output);

    let device_type = from_json
        .as_ref()
        .and_then(|json| {
            json.pointer("/device_info/0/board_info/board_type")
                .and_then(|v| v.as_str())
        })
        .and_then(device_token)
        .or_else(|| {
            output
                .lines()
                .filter(|line| line.contains("Board Type:") || line.contains("board_type"))
                .find_map(device_token)
        });

    let Some(device_type) = device_type else {
        return Hardware::Unknown;
    };

    let firmware_version = from_json
        .as_ref()
        .and_then(|json| {
            json.pointer("/device_info/0/firmwares/fw_bundle_version")
                .and_then(|v| v.as_str())
        })
        .and_then(version_token)
        .or_else(|| {
            output
                .lines()
                .filter(|line| {
                    line.contains("fw_bundle_version")
                        || line.contains("FW Version:")
                        || line.contains("Firmware Version:")
                })
                .find_map(version_token)
        });

    Hardware::Detected {
        device_type,
        firmware_version,
    }
}

/// The outermost `{...}` span of the output, if it parses as JSON
fn extract_json(output: &str) -> Option<serde_json::Value> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

/// First `N<digits>` or `P<digits>` token, upper-cased
fn device_token(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if !matches!(c.to_ascii_uppercase(), 'N' | 'P') {
            continue;
        }
        // Must start a token, so "Unknown" or "pcie" do not match mid-word
        if i > 0 && chars[i - 1].is_ascii_alphanumeric() {
            continue;
        }
        let digits: String = chars[i + 1..]
            .iter()
            .take_while(|d| d.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return Some(format!("{}{}", c.to_ascii_uppercase(), digits));
        }
    }
    None
}

/// First `x.y.z` token
fn version_token(text: &str) -> Option<String> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|candidate| {
            let parts: Vec<&str> = candidate.split('.').collect();
            if parts.len() >= 3 && parts[..3].iter().all(|p| !p.is_empty()) {
                Some(parts[..3].join("."))
            } else {
                None
            }
        })
}
