//! Tenant/area → IANA zone resolution.

use std::collections::HashMap;

use chrono_tz::Tz;
use uuid::Uuid;

/// Supplies the effective IANA zone for `(org, area)`.
///
/// Implementations must be defensive: returning `None` is always safe —
/// the engine falls back to UTC and meters the fallback so a
/// misconfigured tenant is visible instead of silently wrong.
pub trait TenantZoneProvider: Send + Sync {
    fn zone_for(&self, org_id: Uuid, area_id: Uuid) -> Option<Tz>;
}

/// Configuration-backed provider: per-`(org, area)` overrides with a
/// deployment-wide default.
#[derive(Debug, Clone)]
pub struct ConfigZoneProvider {
    default_tz: Tz,
    overrides: HashMap<(Uuid, Uuid), Tz>,
}

impl ConfigZoneProvider {
    pub fn new(default_tz: Tz, overrides: HashMap<(Uuid, Uuid), Tz>) -> Self {
        Self {
            default_tz,
            overrides,
        }
    }
}

impl TenantZoneProvider for ConfigZoneProvider {
    fn zone_for(&self, org_id: Uuid, area_id: Uuid) -> Option<Tz> {
        Some(
            self.overrides
                .get(&(org_id, area_id))
                .copied()
                .unwrap_or(self.default_tz),
        )
    }
}
