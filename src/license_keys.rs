//! Per-key status tracking for a loaded license.
//!
//! [`LicenseKeys::evaluate`] is a pure projection of the license window onto
//! every tracked key. [`LicenseKeys::commit`] stores a projection and
//! reports what changed, which is what listeners get to see.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::crypto::SecurityLevel;
use crate::key::{
    EntitledKey, HdcpCapability, KeyId, KeyKind, KeySecurityLevel, LicenseKey,
    VideoResolutionConstraint,
};

/// Usability of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeyStatus {
    /// The license window has not opened yet.
    UsableInFuture,
    Usable,
    /// Usable by time, but output protection or security level is lacking.
    OutputNotAllowed,
    Expired,
}

/// Key id to status, ordered by key id.
pub type KeyStatusMap = BTreeMap<KeyId, KeyStatus>;

/// What a key may be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyAllowedUsage {
    pub decrypt_to_clear_buffer: bool,
    pub decrypt_to_secure_buffer: bool,
    pub generic_encrypt: bool,
    pub generic_decrypt: bool,
    pub generic_sign: bool,
    pub generic_verify: bool,
    /// `None` when the license set no level for the key.
    pub key_security_level: Option<KeySecurityLevel>,
}

/// Result of committing a new status projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStatusChange {
    /// Only the keys whose status differs from the previous projection.
    pub changed: KeyStatusMap,
    /// True if any changed key became `Usable`.
    pub has_new_usable_key: bool,
}

impl KeyStatusChange {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct LicenseKeyStatus {
    kind: KeyKind,
    status: Option<KeyStatus>,
    meets_constraints: bool,
    meets_security_level: bool,
    allowed_usage: KeyAllowedUsage,
    default_hdcp: HdcpCapability,
    constraints: Vec<VideoResolutionConstraint>,
}

impl LicenseKeyStatus {
    fn new(key: &LicenseKey, device_level: SecurityLevel) -> Self {
        let mut status = Self {
            kind: key.kind,
            status: None,
            meets_constraints: true,
            meets_security_level: true,
            allowed_usage: KeyAllowedUsage::default(),
            default_hdcp: HdcpCapability::None,
            constraints: Vec::new(),
        };

        if key.kind.is_content() {
            let secure_only = key
                .security_level
                .is_some_and(KeySecurityLevel::requires_secure_buffer);
            status.allowed_usage.decrypt_to_clear_buffer = !secure_only;
            status.allowed_usage.decrypt_to_secure_buffer = true;
            status.allowed_usage.key_security_level = key.security_level;
            status.meets_security_level = key
                .security_level
                .map_or(true, |level| level.allowed_on(device_level));
            status.constraints = key.video_resolution_constraints.clone();
            status.default_hdcp = key.required_protection.unwrap_or_default();
        } else if key.kind == KeyKind::OperatorSession {
            let permissions = key.operator_session_permissions.unwrap_or_default();
            status.allowed_usage.generic_encrypt = permissions.allow_encrypt;
            status.allowed_usage.generic_decrypt = permissions.allow_decrypt;
            status.allowed_usage.generic_sign = permissions.allow_sign;
            status.allowed_usage.generic_verify = permissions.allow_signature_verify;
        }
        status
    }

    // A key with resolution bands needs a band covering the current
    // resolution; the band's HDCP requirement overrides the key default.
    fn constraints_met(&self, resolution: Option<u32>, hdcp: HdcpCapability) -> bool {
        let mut required = self.default_hdcp;
        if let (false, Some(pixels)) = (self.constraints.is_empty(), resolution) {
            match self.constraints.iter().find(|c| c.contains(pixels)) {
                Some(constraint) => {
                    if let Some(protection) = constraint.required_protection {
                        required = protection;
                    }
                }
                None => return false,
            }
        }
        hdcp.satisfies(required)
    }

    fn project(&self, window: KeyStatus) -> KeyStatus {
        if window == KeyStatus::Usable && !(self.meets_constraints && self.meets_security_level) {
            KeyStatus::OutputNotAllowed
        } else {
            window
        }
    }
}

/// Keys of the current license plus entitled content-key bindings.
#[derive(Debug, Clone)]
pub struct LicenseKeys {
    security_level: SecurityLevel,
    keys: BTreeMap<KeyId, LicenseKeyStatus>,
    // content key id -> entitlement key id
    entitled: BTreeMap<KeyId, KeyId>,
    entitled_status: KeyStatusMap,
}

impl LicenseKeys {
    pub fn new(security_level: SecurityLevel) -> Self {
        Self {
            security_level,
            keys: BTreeMap::new(),
            entitled: BTreeMap::new(),
            entitled_status: KeyStatusMap::new(),
        }
    }

    /// Device level keys are judged against.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Replace all keys with those of a new license.
    ///
    /// Signing keys are ignored. Entitled bindings are dropped.
    pub fn set_from_license(&mut self, keys: &[LicenseKey]) {
        self.clear();
        for key in keys.iter().filter(|k| k.kind.is_tracked()) {
            self.keys.insert(
                key.id.clone(),
                LicenseKeyStatus::new(key, self.security_level),
            );
        }
    }

    /// Bind content keys to loaded entitlement keys.
    ///
    /// Bindings whose entitlement key is not loaded are skipped. Returns the
    /// number of bindings made.
    pub fn set_entitled_keys(&mut self, keys: &[EntitledKey]) -> usize {
        let mut bound = 0;
        for key in keys {
            let is_entitlement = self
                .keys
                .get(&key.entitlement_key_id)
                .is_some_and(|k| k.kind == KeyKind::Entitlement);
            if !is_entitlement {
                debug!(
                    "skipping entitled key {}: unknown entitlement key {}",
                    &key.key_id,
                    &key.entitlement_key_id
                );
                continue;
            }
            self.entitled
                .insert(key.key_id.clone(), key.entitlement_key_id.clone());
            bound += 1;
        }
        bound
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.entitled.clear();
        self.entitled_status.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the id names a license key or a bound entitled key.
    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys.contains_key(key_id) || self.entitled.contains_key(key_id)
    }

    // Entitled keys answer through their entitlement key.
    fn resolve(&self, key_id: &KeyId) -> Option<&LicenseKeyStatus> {
        match self.entitled.get(key_id) {
            Some(entitlement) => self.keys.get(entitlement),
            None => self.keys.get(key_id),
        }
    }

    /// Whether a content key (direct or entitled) is currently usable.
    ///
    /// Entitlement keys themselves never decrypt content.
    pub fn can_decrypt(&self, key_id: &KeyId) -> bool {
        if let Some(entitlement) = self.entitled.get(key_id) {
            return self
                .keys
                .get(entitlement)
                .is_some_and(|k| k.status == Some(KeyStatus::Usable));
        }
        self.keys
            .get(key_id)
            .is_some_and(|k| k.kind == KeyKind::Content && k.status == Some(KeyStatus::Usable))
    }

    /// Last committed status of a key.
    pub fn status(&self, key_id: &KeyId) -> Option<KeyStatus> {
        if self.entitled.contains_key(key_id) {
            return self.entitled_status.get(key_id).copied();
        }
        self.keys.get(key_id).and_then(|k| k.status)
    }

    pub fn allowed_usage(&self, key_id: &KeyId) -> Option<KeyAllowedUsage> {
        self.resolve(key_id).map(|k| k.allowed_usage)
    }

    /// Unknown keys carry no constraints and pass.
    pub fn meets_security_level(&self, key_id: &KeyId) -> bool {
        self.resolve(key_id).map_or(true, |k| k.meets_security_level)
    }

    /// Check a key's output constraints against explicit device state,
    /// without touching the stored flags.
    pub fn constraints_met_with(
        &self,
        key_id: &KeyId,
        resolution: Option<u32>,
        hdcp: HdcpCapability,
    ) -> bool {
        self.resolve(key_id)
            .map_or(true, |k| k.constraints_met(resolution, hdcp))
    }

    /// Record new device output state on every content key.
    pub fn apply_constraints(&mut self, resolution: Option<u32>, hdcp: HdcpCapability) {
        for key in self.keys.values_mut().filter(|k| k.kind.is_content()) {
            key.meets_constraints = key.constraints_met(resolution, hdcp);
        }
    }

    /// Project a license window status onto every tracked content key.
    pub fn evaluate(&self, window: KeyStatus) -> KeyStatusMap {
        let mut map: KeyStatusMap = self
            .keys
            .iter()
            .filter(|(_, k)| k.kind.is_content())
            .map(|(id, k)| (id.clone(), k.project(window)))
            .collect();
        for (content, entitlement) in &self.entitled {
            if let Some(status) = map.get(entitlement).copied() {
                map.insert(content.clone(), status);
            }
        }
        map
    }

    /// Project `status` onto every key regardless of constraints.
    pub fn evaluate_uniform(&self, status: KeyStatus) -> KeyStatusMap {
        self.keys
            .iter()
            .filter(|(_, k)| k.kind.is_content())
            .map(|(id, _)| id)
            .chain(self.entitled.keys())
            .map(|id| (id.clone(), status))
            .collect()
    }

    /// Store a projection and report the keys whose status changed.
    pub fn commit(&mut self, evaluated: KeyStatusMap) -> KeyStatusChange {
        let mut change = KeyStatusChange::default();
        for (id, status) in evaluated {
            let previous = if self.entitled.contains_key(&id) {
                self.entitled_status.insert(id.clone(), status)
            } else {
                match self.keys.get_mut(&id) {
                    Some(key) => key.status.replace(status),
                    None => continue,
                }
            };
            if previous != Some(status) {
                if status == KeyStatus::Usable {
                    change.has_new_usable_key = true;
                }
                change.changed.insert(id, status);
            }
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyStatus, LicenseKeys};
    use crate::crypto::SecurityLevel;
    use crate::key::{
        EntitledKey, HdcpCapability, KeyId, KeyKind, KeySecurityLevel, LicenseKey,
        OperatorSessionPermissions, VideoResolutionConstraint,
    };

    fn keys(level: SecurityLevel, license: &[LicenseKey]) -> LicenseKeys {
        let mut keys = LicenseKeys::new(level);
        keys.set_from_license(license);
        keys
    }

    #[test]
    fn commit_reports_only_changes() {
        let mut keys = keys(
            SecurityLevel::L1,
            &[LicenseKey::content("a"), LicenseKey::content("b")],
        );
        let first = keys.commit(keys.evaluate(KeyStatus::Usable));
        assert_eq!(first.changed.len(), 2);
        assert!(first.has_new_usable_key);

        let second = keys.commit(keys.evaluate(KeyStatus::Usable));
        assert!(second.is_empty());
        assert!(keys.can_decrypt(&KeyId::from("a")));
    }

    #[test]
    fn signing_keys_are_not_tracked() {
        let keys = keys(
            SecurityLevel::L1,
            &[LicenseKey::new("s", KeyKind::Signing), LicenseKey::content("c")],
        );
        assert!(!keys.contains(&KeyId::from("s")));
        assert_eq!(keys.evaluate(KeyStatus::Usable).len(), 1);
    }

    #[test]
    fn security_level_downgrades_to_output_not_allowed() {
        let mut keys = keys(
            SecurityLevel::L3,
            &[
                LicenseKey::content("hw").with_security_level(KeySecurityLevel::HwSecureAll),
                LicenseKey::content("sw").with_security_level(KeySecurityLevel::SwSecureDecode),
            ],
        );
        keys.commit(keys.evaluate(KeyStatus::Usable));
        assert_eq!(keys.status(&KeyId::from("hw")), Some(KeyStatus::OutputNotAllowed));
        assert_eq!(keys.status(&KeyId::from("sw")), Some(KeyStatus::Usable));
        assert!(!keys.can_decrypt(&KeyId::from("hw")));
        let usage = keys.allowed_usage(&KeyId::from("hw")).expect("usage");
        assert!(!usage.decrypt_to_clear_buffer);
        assert!(usage.decrypt_to_secure_buffer);
    }

    #[test]
    fn resolution_bands_pick_hdcp_requirement() {
        let mut keys = keys(
            SecurityLevel::L1,
            &[LicenseKey::content("k")
                .with_required_protection(HdcpCapability::V1)
                .with_constraint(VideoResolutionConstraint {
                    min_resolution_pixels: 0,
                    max_resolution_pixels: 640 * 480,
                    required_protection: None,
                })
                .with_constraint(VideoResolutionConstraint {
                    min_resolution_pixels: 640 * 480 + 1,
                    max_resolution_pixels: 1920 * 1080,
                    required_protection: Some(HdcpCapability::V2_2),
                })],
        );
        let kid = KeyId::from("k");
        assert!(keys.constraints_met_with(&kid, Some(640 * 480), HdcpCapability::V1));
        assert!(!keys.constraints_met_with(&kid, Some(1280 * 720), HdcpCapability::V1));
        assert!(!keys.constraints_met_with(&kid, Some(3840 * 2160), HdcpCapability::V2_3));
        assert!(keys.constraints_met_with(&kid, None, HdcpCapability::V1));

        keys.apply_constraints(Some(1280 * 720), HdcpCapability::V2);
        keys.commit(keys.evaluate(KeyStatus::Usable));
        assert_eq!(keys.status(&kid), Some(KeyStatus::OutputNotAllowed));
        keys.apply_constraints(Some(1280 * 720), HdcpCapability::V2_2);
        let change = keys.commit(keys.evaluate(KeyStatus::Usable));
        assert!(change.has_new_usable_key);
    }

    #[test]
    fn entitled_keys_follow_their_entitlement() {
        let mut keys = keys(SecurityLevel::L1, &[LicenseKey::entitlement("ent")]);
        let bound = keys.set_entitled_keys(&[
            EntitledKey::new("ent", "content"),
            EntitledKey::new("missing", "orphan"),
        ]);
        assert_eq!(bound, 1);
        keys.commit(keys.evaluate(KeyStatus::Usable));

        assert!(keys.can_decrypt(&KeyId::from("content")));
        assert!(!keys.can_decrypt(&KeyId::from("ent")));
        assert!(!keys.can_decrypt(&KeyId::from("orphan")));
        assert_eq!(keys.status(&KeyId::from("content")), Some(KeyStatus::Usable));

        keys.commit(keys.evaluate(KeyStatus::Expired));
        assert!(!keys.can_decrypt(&KeyId::from("content")));
    }

    #[test]
    fn operator_session_permissions() {
        let keys = keys(
            SecurityLevel::L1,
            &[LicenseKey::new("op", KeyKind::OperatorSession).with_permissions(
                OperatorSessionPermissions {
                    allow_encrypt: true,
                    allow_sign: true,
                    ..Default::default()
                },
            )],
        );
        let usage = keys.allowed_usage(&KeyId::from("op")).expect("usage");
        assert!(usage.generic_encrypt && usage.generic_sign);
        assert!(!usage.generic_decrypt && !usage.generic_verify);
        assert!(!usage.decrypt_to_clear_buffer);
        assert!(keys.evaluate(KeyStatus::Usable).is_empty());
    }
}
