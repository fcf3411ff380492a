//! Device Locator
//!
//! Picks the physical mouse to monitor from the devices a `DeviceProvider`
//! enumerates. Matching tiers, first hit wins:
//!
//! 1. configured event node path, if that node is present
//! 2. exact vendor/product id
//! 3. name substring (case-insensitive) plus every required capability code
//!
//! Devices that report no key/button codes at all are never considered.

use crate::error::EngineError;
use crate::input_backend::DeviceProvider;
use crate::keys;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A resolved input device. Re-resolved from scratch on every engine start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    /// Key/button codes the device can report.
    pub keys: BTreeSet<u16>,
}

impl PhysicalDevice {
    pub fn supports(&self, code: u16) -> bool {
        self.keys.contains(&code)
    }

    pub fn has_buttons(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn mouse_buttons(&self) -> impl Iterator<Item = u16> + '_ {
        self.keys.iter().copied().filter(|c| keys::is_button(*c))
    }
}

impl fmt::Display for PhysicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' [{:04x}:{:04x}]",
            self.path.display(),
            self.name,
            self.vendor,
            self.product
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// What to do when more than one device matches in the winning tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityPolicy {
    /// Take the first in enumeration order and log the others.
    #[default]
    First,
    /// Refuse to start.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceCriteria {
    pub path: Option<PathBuf>,
    pub ids: Vec<UsbId>,
    pub name_contains: Vec<String>,
    pub required_codes: Vec<u16>,
    pub on_ambiguous: AmbiguityPolicy,
}

impl DeviceCriteria {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.ids.is_empty() && self.name_contains.is_empty()
    }

    fn id_matches(&self, dev: &PhysicalDevice) -> bool {
        self.ids
            .iter()
            .any(|id| id.vendor == dev.vendor && id.product == dev.product)
    }

    fn name_matches(&self, dev: &PhysicalDevice) -> bool {
        let name = dev.name.to_lowercase();
        self.name_contains
            .iter()
            .any(|needle| name.contains(&needle.to_lowercase()))
    }

    fn missing_codes(&self, dev: &PhysicalDevice) -> Vec<u16> {
        self.required_codes
            .iter()
            .copied()
            .filter(|c| !dev.supports(*c))
            .collect()
    }
}

impl fmt::Display for DeviceCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(path) = &self.path {
            parts.push(format!("path {}", path.display()));
        }
        if !self.ids.is_empty() {
            let ids: Vec<String> = self
                .ids
                .iter()
                .map(|id| format!("{:04x}:{:04x}", id.vendor, id.product))
                .collect();
            parts.push(format!("id {}", ids.join("|")));
        }
        if !self.name_contains.is_empty() {
            let codes: Vec<String> = self.required_codes.iter().map(|c| keys::display(*c)).collect();
            parts.push(format!(
                "name ~ {:?} with [{}]",
                self.name_contains,
                codes.join(", ")
            ));
        }
        if parts.is_empty() {
            f.write_str("(no criteria)")
        } else {
            f.write_str(&parts.join(" or "))
        }
    }
}

/// Which tier selected the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Path,
    Id,
    NameAndCapabilities,
}

/// Enumerate through `provider` and select a device.
pub fn resolve<P: DeviceProvider>(
    provider: &P,
    criteria: &DeviceCriteria,
) -> Result<PhysicalDevice, EngineError> {
    let candidates = provider.enumerate();
    debug!("Evaluating {} input device(s) against {}", candidates.len(), criteria);
    select(criteria, candidates).map(|(dev, reason)| {
        info!("Selected {} (matched by {:?})", dev, reason);
        dev
    })
}

/// Pure selection over an already-enumerated candidate list.
pub fn select(
    criteria: &DeviceCriteria,
    candidates: Vec<PhysicalDevice>,
) -> Result<(PhysicalDevice, MatchReason), EngineError> {
    let candidates: Vec<PhysicalDevice> = candidates
        .into_iter()
        .filter(|dev| {
            if !dev.has_buttons() {
                debug!("  skip {}: reports no key/button codes", dev);
            }
            dev.has_buttons()
        })
        .collect();

    if let Some(path) = &criteria.path {
        if let Some(dev) = candidates.iter().find(|d| &d.path == path) {
            return Ok((dev.clone(), MatchReason::Path));
        }
        warn!(
            "Configured device path {} not present; falling back to id/name matching",
            path.display()
        );
    }

    let by_id: Vec<&PhysicalDevice> = candidates.iter().filter(|d| criteria.id_matches(d)).collect();
    if !by_id.is_empty() {
        return pick(criteria, by_id).map(|d| (d, MatchReason::Id));
    }

    let mut by_name = Vec::new();
    for dev in candidates.iter().filter(|d| criteria.name_matches(d)) {
        let missing = criteria.missing_codes(dev);
        if missing.is_empty() {
            by_name.push(dev);
        } else {
            let missing: Vec<String> = missing.iter().map(|c| keys::display(*c)).collect();
            debug!("  reject {}: name matches but lacks {}", dev, missing.join(", "));
        }
    }
    if !by_name.is_empty() {
        return pick(criteria, by_name).map(|d| (d, MatchReason::NameAndCapabilities));
    }

    Err(EngineError::DeviceNotFound {
        criteria: criteria.to_string(),
    })
}

fn pick(
    criteria: &DeviceCriteria,
    matches: Vec<&PhysicalDevice>,
) -> Result<PhysicalDevice, EngineError> {
    if matches.len() > 1 {
        let listed: Vec<String> = matches.iter().map(|d| d.to_string()).collect();
        match criteria.on_ambiguous {
            AmbiguityPolicy::First => {
                warn!(
                    "{} devices match, using the first: {}",
                    matches.len(),
                    listed.join("; ")
                );
            }
            AmbiguityPolicy::Fail => {
                return Err(EngineError::AmbiguousDevice {
                    count: matches.len(),
                    candidates: listed.join("; "),
                });
            }
        }
    }
    Ok(matches[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::*;

    fn device(path: &str, name: &str, vendor: u16, product: u16, keys: &[u16]) -> PhysicalDevice {
        PhysicalDevice {
            path: PathBuf::from(path),
            name: name.to_string(),
            vendor,
            product,
            keys: keys.iter().copied().collect(),
        }
    }

    fn name_criteria(needle: &str) -> DeviceCriteria {
        DeviceCriteria {
            name_contains: vec![needle.to_string()],
            required_codes: vec![BTN_SIDE, BTN_EXTRA],
            ..Default::default()
        }
    }

    #[test]
    fn test_name_match_requires_capabilities() {
        let keyboard = device("/dev/input/event3", "TestMouse Keyboard", 1, 1, &[30, 31, KEY_LEFTMETA]);
        let pointer = device(
            "/dev/input/event4",
            "TestMouse Pointer",
            1,
            2,
            &[BTN_LEFT, BTN_RIGHT, BTN_SIDE, BTN_EXTRA],
        );

        let (dev, reason) = select(&name_criteria("TestMouse"), vec![keyboard, pointer.clone()]).unwrap();
        assert_eq!(dev, pointer);
        assert_eq!(reason, MatchReason::NameAndCapabilities);
    }

    #[test]
    fn test_name_match_is_case_insensitive() {
        let pointer = device("/dev/input/event4", "Logitech M720 Triathlon", 0x046d, 0xb015, &[BTN_SIDE, BTN_EXTRA]);
        assert!(select(&name_criteria("m720"), vec![pointer]).is_ok());
    }

    #[test]
    fn test_id_match_wins_over_name() {
        let by_name = device("/dev/input/event2", "TestMouse", 1, 1, &[BTN_SIDE, BTN_EXTRA]);
        let by_id = device("/dev/input/event7", "Receiver", 0x046d, 0x405e, &[BTN_LEFT]);
        let mut criteria = name_criteria("TestMouse");
        criteria.ids = vec![UsbId {
            vendor: 0x046d,
            product: 0x405e,
        }];

        let (dev, reason) = select(&criteria, vec![by_name, by_id.clone()]).unwrap();
        assert_eq!(dev, by_id);
        assert_eq!(reason, MatchReason::Id);
    }

    #[test]
    fn test_devices_without_buttons_are_skipped() {
        let axis_only = device("/dev/input/event1", "TestMouse Consumer", 0x046d, 0x405e, &[]);
        let mut criteria = name_criteria("TestMouse");
        criteria.ids = vec![UsbId {
            vendor: 0x046d,
            product: 0x405e,
        }];
        assert!(matches!(
            select(&criteria, vec![axis_only]),
            Err(EngineError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_configured_path_selected_when_present() {
        let a = device("/dev/input/event4", "TestMouse", 1, 1, &[BTN_SIDE, BTN_EXTRA]);
        let b = device("/dev/input/event9", "Other", 2, 2, &[BTN_LEFT]);
        let mut criteria = name_criteria("TestMouse");
        criteria.path = Some(PathBuf::from("/dev/input/event9"));

        let (dev, reason) = select(&criteria, vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(dev, b);
        assert_eq!(reason, MatchReason::Path);

        criteria.path = Some(PathBuf::from("/dev/input/event42"));
        let (dev, _) = select(&criteria, vec![a.clone(), b]).unwrap();
        assert_eq!(dev, a);
    }

    #[test]
    fn test_ambiguous_first_takes_enumeration_order() {
        let a = device("/dev/input/event4", "TestMouse A", 1, 1, &[BTN_SIDE, BTN_EXTRA]);
        let b = device("/dev/input/event5", "TestMouse B", 1, 2, &[BTN_SIDE, BTN_EXTRA]);
        let (dev, _) = select(&name_criteria("TestMouse"), vec![a.clone(), b]).unwrap();
        assert_eq!(dev, a);
    }

    #[test]
    fn test_ambiguous_fail_policy() {
        let a = device("/dev/input/event4", "TestMouse A", 1, 1, &[BTN_SIDE, BTN_EXTRA]);
        let b = device("/dev/input/event5", "TestMouse B", 1, 2, &[BTN_SIDE, BTN_EXTRA]);
        let mut criteria = name_criteria("TestMouse");
        criteria.on_ambiguous = AmbiguityPolicy::Fail;

        match select(&criteria, vec![a, b]) {
            Err(EngineError::AmbiguousDevice { count, .. }) => assert_eq!(count, 2),
            other => panic!("expected AmbiguousDevice, got {other:?}"),
        }
    }

    #[test]
    fn test_no_match_reports_criteria() {
        let err = select(&name_criteria("Nothing"), vec![]).unwrap_err();
        match err {
            EngineError::DeviceNotFound { criteria } => assert!(criteria.contains("Nothing")),
            other => panic!("expected DeviceNotFound, got {other:?}"),
        }
    }
}
