//! Policy gate.
//!
//! User toggles live in an immutable [`PolicySnapshot`]. Setters swap in a new
//! snapshot; every decision reads one snapshot up front, so a setter racing a
//! decision can only affect the next decision point.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::PolicyDenial;
use crate::types::{Classification, UpdateMode};

/// Default minimum battery level for installing while discharging.
pub const DEFAULT_MIN_BATTERY_PERCENTAGE: f64 = 60.0;

/// Point-in-time view of the update policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySnapshot {
    pub auto_check: bool,
    pub auto_download: bool,
    pub auto_install: bool,
    pub auto_clean_cache: bool,
    /// Notify the user when updates become available
    pub update_notify: bool,
    pub update_mode: UpdateMode,
    /// Back up the system before upgrading
    pub atomic_upgrade: bool,
    pub on_battery: bool,
    pub battery_percentage: f64,
    pub min_battery_percentage: f64,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            auto_check: true,
            auto_download: false,
            auto_install: false,
            auto_clean_cache: true,
            update_notify: true,
            update_mode: UpdateMode::default(),
            atomic_upgrade: false,
            on_battery: false,
            battery_percentage: 100.0,
            min_battery_percentage: DEFAULT_MIN_BATTERY_PERCENTAGE,
        }
    }
}

impl PolicySnapshot {
    /// Discharging below the configured minimum.
    pub fn is_low_battery(&self) -> bool {
        self.on_battery && self.battery_percentage < self.min_battery_percentage
    }
}

/// Shared, atomically replaced policy snapshot.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(initial: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The snapshot to use for one decision.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` to a copy of the current snapshot and publish it.
    ///
    /// Returns the previous and the new snapshot.
    pub fn update<F>(&self, change: F) -> (Arc<PolicySnapshot>, Arc<PolicySnapshot>)
    where
        F: FnOnce(&mut PolicySnapshot),
    {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = guard.clone();
        let mut next = (*previous).clone();
        change(&mut next);
        let next = Arc::new(next);
        *guard = next.clone();
        (previous, next)
    }
}

// =============================================================================
// GATE PREDICATES
// =============================================================================

/// Battery must be charging or above the minimum level.
pub fn check_battery(policy: &PolicySnapshot) -> Result<(), PolicyDenial> {
    if policy.is_low_battery() {
        return Err(PolicyDenial::LowBattery {
            percentage: policy.battery_percentage,
            minimum: policy.min_battery_percentage,
        });
    }
    Ok(())
}

/// The update mode must include the classification.
pub fn check_classification_enabled(
    policy: &PolicySnapshot,
    classification: Classification,
) -> Result<(), PolicyDenial> {
    if !policy.update_mode.contains(classification) {
        return Err(PolicyDenial::ClassificationDisabled(classification));
    }
    Ok(())
}

/// Gate for an explicit upgrade request.
pub fn permits_upgrade(
    policy: &PolicySnapshot,
    classification: Classification,
) -> Result<(), PolicyDenial> {
    check_classification_enabled(policy, classification)?;
    check_battery(policy)
}

/// Start a download without being asked once a check finds updates.
pub fn should_auto_download(policy: &PolicySnapshot, classification: Classification) -> bool {
    policy.auto_download && policy.update_mode.contains(classification)
}

/// Chain the install onto a download that was not explicitly requested.
pub fn should_auto_install(policy: &PolicySnapshot, classification: Classification) -> bool {
    policy.auto_install
        && policy.update_mode.contains(classification)
        && !policy.is_low_battery()
}

/// Tell the user that updates are available.
pub fn should_notify(policy: &PolicySnapshot, available: bool) -> bool {
    available && policy.update_notify
}

/// Run the atomic-upgrade backup before upgrading.
pub fn needs_backup(policy: &PolicySnapshot) -> bool {
    policy.atomic_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_gate() {
        let mut policy = PolicySnapshot::default();
        assert!(check_battery(&policy).is_ok());

        policy.on_battery = true;
        policy.battery_percentage = 30.0;
        assert_eq!(
            check_battery(&policy),
            Err(PolicyDenial::LowBattery { percentage: 30.0, minimum: 60.0 })
        );

        policy.battery_percentage = 75.0;
        assert!(check_battery(&policy).is_ok());
    }

    #[test]
    fn test_update_mode_gate() {
        let policy = PolicySnapshot {
            update_mode: UpdateMode(Classification::Safe.mode_bit()),
            ..Default::default()
        };
        assert!(permits_upgrade(&policy, Classification::Safe).is_ok());
        assert_eq!(
            permits_upgrade(&policy, Classification::System),
            Err(PolicyDenial::ClassificationDisabled(Classification::System))
        );
    }

    #[test]
    fn test_auto_toggles() {
        let mut policy = PolicySnapshot::default();
        assert!(!should_auto_download(&policy, Classification::System));
        assert!(!should_auto_install(&policy, Classification::System));

        policy.auto_download = true;
        policy.auto_install = true;
        assert!(should_auto_download(&policy, Classification::System));
        assert!(should_auto_install(&policy, Classification::System));

        policy.on_battery = true;
        policy.battery_percentage = 10.0;
        assert!(!should_auto_install(&policy, Classification::System));
        assert!(should_notify(&policy, true));
        assert!(!should_notify(&policy, false));
    }

    #[test]
    fn test_store_swaps_snapshots() {
        let store = PolicyStore::new(PolicySnapshot::default());
        let before = store.snapshot();
        let (previous, next) = store.update(|p| p.auto_install = true);

        assert!(!previous.auto_install);
        assert!(next.auto_install);
        // Readers holding the old snapshot keep seeing it.
        assert!(!before.auto_install);
        assert!(store.snapshot().auto_install);
    }
}
