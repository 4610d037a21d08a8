//! Verified license contents as consumed by the policy engine.
//!
//! Parsing and verifying the license message happens upstream; this module
//! only carries what the engine needs. Policy fields are optional the same
//! way they are on the wire, so a renewal can carry just the fields it
//! changes.

use serde::{Deserialize, Serialize};

use crate::key::LicenseKey;

/// How the license may be retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseType {
    #[default]
    Streaming,
    Offline,
    Automatic,
}

impl LicenseType {
    /// Value reported under the `LicenseType` query key.
    pub fn query_value(self) -> &'static str {
        match self {
            LicenseType::Streaming | LicenseType::Automatic => "Streaming",
            LicenseType::Offline => "Offline",
        }
    }
}

/// Identification block of a license.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseIdentification {
    pub request_id: Vec<u8>,
    pub session_id: Vec<u8>,
    pub purchase_id: Vec<u8>,
    #[serde(rename = "type")]
    pub license_type: LicenseType,
    pub version: i32,
    pub provider_session_token: Vec<u8>,
}

/// Usage rules of a license.
///
/// Durations are in seconds; zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicensePolicy {
    pub can_play: Option<bool>,
    pub can_persist: Option<bool>,
    pub can_renew: Option<bool>,
    pub rental_duration_seconds: Option<i64>,
    pub playback_duration_seconds: Option<i64>,
    pub license_duration_seconds: Option<i64>,
    pub renewal_recovery_duration_seconds: Option<i64>,
    pub renewal_server_url: Option<String>,
    pub renewal_delay_seconds: Option<i64>,
    pub renewal_retry_interval_seconds: Option<i64>,
    pub renew_with_usage: Option<bool>,
    pub play_start_grace_period_seconds: Option<i64>,
    pub soft_enforce_playback_duration: Option<bool>,
}

macro_rules! policy_getters {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&self) -> $ty {
                self.$name.unwrap_or_default()
            }
        )*
    };
}

impl LicensePolicy {
    policy_getters! {
        can_play: bool,
        can_persist: bool,
        can_renew: bool,
        rental_duration_seconds: i64,
        playback_duration_seconds: i64,
        license_duration_seconds: i64,
        renewal_recovery_duration_seconds: i64,
        renewal_delay_seconds: i64,
        renewal_retry_interval_seconds: i64,
        renew_with_usage: bool,
        play_start_grace_period_seconds: i64,
        soft_enforce_playback_duration: bool,
    }

    pub fn renewal_server_url(&self) -> &str {
        self.renewal_server_url.as_deref().unwrap_or("")
    }

    /// Overlay the fields `other` sets onto this policy.
    pub fn merge_from(&mut self, other: &LicensePolicy) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            can_play,
            can_persist,
            can_renew,
            rental_duration_seconds,
            playback_duration_seconds,
            license_duration_seconds,
            renewal_recovery_duration_seconds,
            renewal_server_url,
            renewal_delay_seconds,
            renewal_retry_interval_seconds,
            renew_with_usage,
            play_start_grace_period_seconds,
            soft_enforce_playback_duration
        );
    }
}

/// A verified license.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct License {
    pub id: LicenseIdentification,
    pub policy: Option<LicensePolicy>,
    pub license_start_time: Option<i64>,
    pub keys: Vec<LicenseKey>,
}

impl License {
    /// Parse a license description from YAML.
    pub fn from_yaml_str(text: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{License, LicensePolicy, LicenseType};
    use crate::key::KeyKind;

    #[test]
    fn unset_policy_fields_read_as_defaults() {
        let policy = LicensePolicy::default();
        assert!(!policy.can_play());
        assert_eq!(policy.rental_duration_seconds(), 0);
        assert_eq!(policy.renewal_server_url(), "");
    }

    #[test]
    fn merge_only_overrides_set_fields() {
        let mut policy = LicensePolicy {
            can_play: Some(true),
            can_renew: Some(true),
            renewal_delay_seconds: Some(60),
            renewal_server_url: Some("https://a".to_string()),
            ..Default::default()
        };
        let renewal = LicensePolicy {
            renewal_delay_seconds: Some(120),
            can_renew: Some(false),
            ..Default::default()
        };
        policy.merge_from(&renewal);
        assert!(policy.can_play());
        assert!(!policy.can_renew());
        assert_eq!(policy.renewal_delay_seconds(), 120);
        assert_eq!(policy.renewal_server_url(), "https://a");
    }

    #[test]
    fn license_from_yaml() {
        let yaml = r#"
id:
  type: OFFLINE
  version: 2
license_start_time: 1413517500
policy:
  can_play: true
  rental_duration_seconds: 604800
keys:
  - id: kid1
    type: CONTENT
  - id: ent1
    type: ENTITLEMENT
"#;
        let license = License::from_yaml_str(yaml).expect("parse license");
        assert_eq!(license.id.license_type, LicenseType::Offline);
        assert_eq!(license.id.version, 2);
        assert_eq!(license.license_start_time, Some(1_413_517_500));
        let policy = license.policy.expect("policy");
        assert_eq!(policy.rental_duration_seconds(), 604_800);
        assert_eq!(license.keys[1].kind, KeyKind::Entitlement);
    }
}
