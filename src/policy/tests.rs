use std::sync::Arc;

use super::{
    LicenseState, PolicyEngine, QUERY_KEY_LICENSE_DURATION_REMAINING, QUERY_KEY_LICENSE_TYPE,
    QUERY_KEY_PERSIST_ALLOWED, QUERY_KEY_PLAYBACK_DURATION_REMAINING, QUERY_KEY_PLAY_ALLOWED,
    QUERY_KEY_RENEWAL_SERVER_URL, QUERY_KEY_RENEW_ALLOWED, QUERY_VALUE_FALSE, QUERY_VALUE_TRUE,
};
use crate::clock::ManualClock;
use crate::crypto::reference::ReferenceEngine;
use crate::crypto::SecurityLevel;
use crate::error::Error;
use crate::events::{EventListener, PolicyEvent, RecordingListener};
use crate::key::{
    EntitledKey, HdcpCapability, KeyId, KeySecurityLevel, LicenseKey, VideoResolutionConstraint,
};
use crate::license::{License, LicenseIdentification, LicensePolicy};
use crate::license_keys::KeyStatus;
use crate::session::SessionId;

const START: i64 = 1_413_517_500;
const RENTAL: i64 = 604_800;
const PLAYBACK: i64 = 172_800;
const KEY: &str = "content-key";

struct Harness {
    clock: ManualClock,
    crypto: ReferenceEngine,
    listener: Arc<RecordingListener>,
    engine: PolicyEngine,
}

impl Harness {
    fn new() -> Self {
        Self::at_level(SecurityLevel::L1)
    }

    fn at_level(level: SecurityLevel) -> Self {
        let clock = ManualClock::new(START);
        let crypto = ReferenceEngine::new([1; 16], level, Arc::new(clock.clone()));
        let listener = Arc::new(RecordingListener::new());
        let engine = PolicyEngine::new(
            SessionId::from("session-1"),
            Some(listener.clone() as Arc<dyn EventListener>),
            Arc::new(crypto.open_session()),
        )
        .with_clock(Arc::new(clock.clone()));
        Self {
            clock,
            crypto,
            listener,
            engine,
        }
    }

    fn tick_at(&mut self, now: i64) {
        self.clock.set(now);
        self.engine.on_timer_event();
    }

    fn can_decrypt(&self) -> bool {
        self.engine.can_decrypt_content(&KeyId::from(KEY))
    }

    fn status(&self) -> Option<KeyStatus> {
        self.engine.key_status(&KeyId::from(KEY))
    }

    fn expiration_updates(&self) -> usize {
        self.listener
            .events()
            .iter()
            .filter(|e| matches!(e, PolicyEvent::ExpirationUpdate(_)))
            .count()
    }
}

fn streaming_policy() -> LicensePolicy {
    LicensePolicy {
        can_play: Some(true),
        rental_duration_seconds: Some(RENTAL),
        playback_duration_seconds: Some(PLAYBACK),
        ..Default::default()
    }
}

fn license_with(policy: LicensePolicy, keys: Vec<LicenseKey>) -> License {
    License {
        id: LicenseIdentification {
            version: 1,
            ..Default::default()
        },
        policy: Some(policy),
        license_start_time: Some(START),
        keys,
    }
}

fn license(policy: LicensePolicy) -> License {
    license_with(policy, vec![LicenseKey::content(KEY)])
}

fn renewal(version: i32, start: i64, policy: LicensePolicy) -> License {
    License {
        id: LicenseIdentification {
            version,
            ..Default::default()
        },
        policy: Some(policy),
        license_start_time: Some(start),
        keys: Vec::new(),
    }
}

#[test]
fn playback_window_closes_after_playback_duration() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    h.engine.on_timer_event();
    assert!(h.can_decrypt());

    h.tick_at(START + 5);
    h.clock.set(START + 6);
    assert!(h.engine.begin_decryption());
    assert_eq!(h.engine.playback_start_time(), START + 6);

    h.tick_at(START + 172_805);
    assert!(h.can_decrypt());
    assert_eq!(h.engine.state(), LicenseState::CanPlay);

    h.tick_at(START + 172_807);
    assert!(!h.can_decrypt());
    assert_eq!(h.engine.state(), LicenseState::Expired);
    assert_eq!(h.status(), Some(KeyStatus::Expired));
    assert!(h.engine.has_license_or_playback_duration_expired());
    assert_eq!(h.engine.license_or_playback_duration_remaining(), 0);
}

#[test]
fn unlimited_durations_stay_usable() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        can_play: Some(true),
        ..Default::default()
    }));
    assert!(h.engine.begin_decryption());
    assert_eq!(h.listener.last_expiry(), Some(None));

    h.tick_at(START + 10 * 365 * 24 * 3600);
    assert!(h.can_decrypt());
    assert_eq!(h.engine.license_or_playback_duration_remaining(), i64::MAX);
}

#[test]
fn expired_is_sticky_until_a_newer_license() {
    let mut h = Harness::new();
    let policy = LicensePolicy {
        license_duration_seconds: Some(100),
        ..streaming_policy()
    };
    h.engine.set_license(&license(policy));
    h.tick_at(START + 100);
    assert_eq!(h.engine.state(), LicenseState::Expired);

    let longer = LicensePolicy {
        license_duration_seconds: Some(1000),
        ..Default::default()
    };
    h.engine.update_license(&renewal(1, START + 100, longer.clone()));
    h.tick_at(START + 101);
    assert_eq!(h.engine.state(), LicenseState::Expired);
    assert!(!h.can_decrypt());
    assert_eq!(h.engine.policy().license_duration_seconds(), 100);

    h.engine.update_license(&renewal(2, START + 100, longer));
    assert_eq!(h.engine.state(), LicenseState::CanPlay);
    assert_eq!(h.engine.license_id().version, 2);
    assert!(h.can_decrypt());
}

#[test]
fn query_is_empty_until_first_tick() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    assert!(h.engine.query().is_empty());

    h.tick_at(START + 10);
    let query = h.engine.query();
    assert_eq!(query[QUERY_KEY_LICENSE_TYPE], "Streaming");
    assert_eq!(query[QUERY_KEY_PLAY_ALLOWED], QUERY_VALUE_TRUE);
    assert_eq!(query[QUERY_KEY_PERSIST_ALLOWED], QUERY_VALUE_FALSE);
    assert_eq!(query[QUERY_KEY_RENEW_ALLOWED], QUERY_VALUE_FALSE);
    assert_eq!(
        query[QUERY_KEY_LICENSE_DURATION_REMAINING],
        (RENTAL - 10).to_string()
    );
    assert_eq!(
        query[QUERY_KEY_PLAYBACK_DURATION_REMAINING],
        PLAYBACK.to_string()
    );
    assert_eq!(query[QUERY_KEY_RENEWAL_SERVER_URL], "");

    assert!(h.engine.begin_decryption());
    h.clock.set(START + 110);
    assert_eq!(
        h.engine.query()[QUERY_KEY_PLAYBACK_DURATION_REMAINING],
        (PLAYBACK - 100).to_string()
    );
}

#[test]
fn license_without_start_time_only_merges_policy() {
    let mut h = Harness::new();
    let mut no_start = license(streaming_policy());
    no_start.license_start_time = None;
    h.engine.set_license(&no_start);
    h.engine.on_timer_event();
    assert_eq!(h.engine.state(), LicenseState::Initial);
    assert!(h.engine.policy().can_play());
    assert!(h.engine.query().is_empty());
    assert!(!h.can_decrypt());
}

#[test]
fn restored_grace_period_end_is_playback_start() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        play_start_grace_period_seconds: Some(30),
        ..streaming_policy()
    }));
    h.clock.set(START + 50_000);
    h.engine
        .restore_playback_times(START + 100, START + 150, START + 130);
    assert_eq!(h.engine.playback_start_time(), START + 130);
    assert_eq!(h.engine.last_playback_time(), START + 150);

    h.tick_at(START + 130 + PLAYBACK - 1);
    assert!(h.can_decrypt());
    h.tick_at(START + 130 + PLAYBACK);
    assert!(!h.can_decrypt());
}

#[test]
fn restored_unelapsed_grace_period_restarts_playback() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        play_start_grace_period_seconds: Some(30),
        ..streaming_policy()
    }));
    h.clock.set(START + 120);
    h.engine.restore_playback_times(START + 100, START + 110, 0);
    assert_eq!(h.engine.playback_start_time(), 0);
    assert_eq!(h.engine.last_playback_time(), START + 110);
    assert_eq!(h.engine.seconds_since_started(), None);

    // Only the rental window applies until playback begins again.
    h.tick_at(START + 100 + PLAYBACK + 1);
    assert!(h.can_decrypt());
    assert_eq!(h.engine.grace_period_end_time(), 0);

    let restart = START + 100 + PLAYBACK + 2;
    h.clock.set(restart);
    assert!(h.engine.begin_decryption());
    assert_eq!(h.engine.playback_start_time(), restart);
    h.tick_at(restart + 30);
    assert_eq!(h.engine.grace_period_end_time(), restart);
    assert_eq!(h.listener.last_expiry(), Some(Some(restart + PLAYBACK)));
}

#[test]
fn huge_durations_saturate_instead_of_overflowing() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        can_play: Some(true),
        can_renew: Some(true),
        license_duration_seconds: Some(i64::MAX),
        rental_duration_seconds: Some(i64::MAX),
        playback_duration_seconds: Some(i64::MAX),
        renewal_delay_seconds: Some(i64::MAX),
        renewal_retry_interval_seconds: Some(i64::MAX),
        ..Default::default()
    }));
    h.tick_at(START + 10);
    assert!(h.can_decrypt());
    assert!(h.engine.begin_decryption());

    h.tick_at(START + 20);
    assert!(h.can_decrypt());
    assert_eq!(h.engine.state(), LicenseState::CanPlay);
    assert_eq!(h.listener.last_expiry(), Some(Some(i64::MAX)));
    assert_eq!(h.engine.license_or_playback_duration_remaining(), i64::MAX - (START + 20));
    assert!(!h.engine.has_license_or_playback_duration_expired());
}

#[test]
fn entitled_keys_decrypt_through_their_entitlement() {
    let mut h = Harness::new();
    h.engine.set_license(&license_with(
        streaming_policy(),
        vec![LicenseKey::entitlement("entitlement-key")],
    ));
    h.engine.on_timer_event();
    assert!(!h.engine.can_decrypt_content(&KeyId::from("entitlement-key")));
    assert!(!h.can_decrypt());
    assert_eq!(h.status(), None);

    h.listener.take();
    let bound = h.engine.set_entitled_license_keys(&[
        EntitledKey::new("entitlement-key", KEY),
        EntitledKey::new("unknown-entitlement", "orphan"),
    ]);
    assert_eq!(bound, 1);
    assert!(h.can_decrypt());
    assert_eq!(h.status(), Some(KeyStatus::Usable));
    assert!(!h.engine.can_decrypt_content(&KeyId::from("orphan")));

    let events = h.listener.take();
    assert!(events.iter().any(|e| matches!(
        e,
        PolicyEvent::KeysChange { keys, has_new_usable_key: true }
            if keys.len() == 1 && keys.contains_key(&KeyId::from(KEY))
    )));
}

#[test]
fn renewal_follows_delay_then_retry_interval() {
    let mut h = Harness::new();
    let policy = LicensePolicy {
        can_renew: Some(true),
        renewal_delay_seconds: Some(100),
        renewal_retry_interval_seconds: Some(20),
        renewal_server_url: Some("https://renew.example".to_string()),
        ..streaming_policy()
    };
    h.engine.set_license(&license(policy));
    assert!(h.engine.can_renew());

    h.tick_at(START + 50);
    assert_eq!(h.listener.renewal_count(), 0);
    h.tick_at(START + 100);
    assert_eq!(h.listener.renewal_count(), 1);
    assert_eq!(h.engine.state(), LicenseState::WaitingLicenseUpdate);
    assert!(h.can_decrypt());

    h.tick_at(START + 110);
    assert_eq!(h.listener.renewal_count(), 1);
    h.tick_at(START + 120);
    assert_eq!(h.listener.renewal_count(), 2);

    h.engine
        .update_license(&renewal(2, START + 120, LicensePolicy::default()));
    assert_eq!(h.engine.state(), LicenseState::CanPlay);
    assert_eq!(h.engine.policy().renewal_server_url(), "https://renew.example");
    h.tick_at(START + 130);
    assert_eq!(h.listener.renewal_count(), 2);
    h.tick_at(START + 220);
    assert_eq!(h.listener.renewal_count(), 3);
}

#[test]
fn renew_with_usage_requests_renewal_on_first_decrypt() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        can_renew: Some(true),
        renew_with_usage: Some(true),
        ..streaming_policy()
    }));
    h.tick_at(START + 1);
    assert_eq!(h.listener.renewal_count(), 0);

    assert!(h.engine.begin_decryption());
    assert_eq!(h.engine.state(), LicenseState::NeedRenewal);
    h.tick_at(START + 2);
    assert_eq!(h.listener.renewal_count(), 1);
    h.tick_at(START + 500);
    assert_eq!(h.listener.renewal_count(), 1);
}

#[test]
fn hdcp_is_rechecked_on_the_device_interval() {
    let mut h = Harness::new();
    h.crypto
        .set_hdcp(HdcpCapability::V1, HdcpCapability::V2_2)
        .expect("set hdcp");
    h.engine.set_license(&license_with(
        streaming_policy(),
        vec![LicenseKey::content(KEY).with_required_protection(HdcpCapability::V2_2)],
    ));
    assert_eq!(h.status(), Some(KeyStatus::OutputNotAllowed));
    assert!(!h.can_decrypt());

    h.crypto
        .set_hdcp(HdcpCapability::V2_2, HdcpCapability::V2_2)
        .expect("set hdcp");
    h.tick_at(START + 1);
    assert_eq!(h.status(), Some(KeyStatus::Usable));
    assert!(h.can_decrypt());

    h.crypto
        .set_hdcp(HdcpCapability::V1, HdcpCapability::V2_2)
        .expect("set hdcp");
    assert!(!h.can_decrypt());
    h.tick_at(START + 5);
    assert_eq!(h.status(), Some(KeyStatus::Usable));
    h.tick_at(START + 11);
    assert_eq!(h.status(), Some(KeyStatus::OutputNotAllowed));
}

#[test]
fn resolution_selects_hdcp_band() {
    let mut h = Harness::new();
    h.crypto
        .set_hdcp(HdcpCapability::V1, HdcpCapability::V1)
        .expect("set hdcp");
    let key = LicenseKey::content(KEY)
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
        });
    h.engine
        .set_license(&license_with(streaming_policy(), vec![key]));
    assert_eq!(h.status(), Some(KeyStatus::Usable));

    h.engine.notify_resolution(640, 480);
    assert!(h.can_decrypt());
    h.engine.notify_resolution(1280, 720);
    assert_eq!(h.status(), Some(KeyStatus::OutputNotAllowed));
    h.engine.notify_resolution(3840, 2160);
    assert!(!h.can_decrypt());
    h.engine.notify_resolution(320, 240);
    assert_eq!(h.status(), Some(KeyStatus::Usable));
}

#[test]
fn security_level_gates_keys() {
    let mut h = Harness::at_level(SecurityLevel::L3);
    h.engine.set_license(&license_with(
        streaming_policy(),
        vec![
            LicenseKey::content("hw-key").with_security_level(KeySecurityLevel::HwSecureAll),
            LicenseKey::content(KEY).with_security_level(KeySecurityLevel::SwSecureCrypto),
        ],
    ));
    let hw = KeyId::from("hw-key");
    assert!(!h.engine.can_use_key_for_security_level(&hw));
    assert_eq!(h.engine.key_status(&hw), Some(KeyStatus::OutputNotAllowed));
    assert!(!h.engine.can_decrypt_content(&hw));
    assert!(h.engine.can_use_key_for_security_level(&KeyId::from(KEY)));
    assert!(h.can_decrypt());
}

#[test]
fn clock_rollback_beyond_skew_is_ignored() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    h.tick_at(START + 10);

    h.clock.set(START + 2);
    assert!(h.engine.begin_decryption());
    assert_eq!(h.engine.playback_start_time(), START + 10);
    assert_eq!(h.engine.seconds_since_started(), Some(0));
}

#[test]
fn clock_rollback_within_skew_is_accepted() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    h.tick_at(START + 10);

    h.clock.set(START + 7);
    assert!(h.engine.begin_decryption());
    assert_eq!(h.engine.playback_start_time(), START + 7);
}

#[test]
fn license_for_release_never_plays() {
    let mut h = Harness::new();
    let license = license(streaming_policy());
    h.engine.set_license(&license);
    h.engine.on_timer_event();
    assert!(h.can_decrypt());

    h.listener.take();
    h.engine.set_license_for_release(&license);
    let events = h.listener.take();
    assert!(events.iter().any(|e| matches!(
        e,
        PolicyEvent::KeysChange { keys, has_new_usable_key: false }
            if keys.get(&KeyId::from(KEY)) == Some(&KeyStatus::Expired)
    )));
    assert!(!h.engine.begin_decryption());
    assert!(!h.can_decrypt());
    assert_eq!(h.status(), None);
}

#[test]
fn expiration_update_is_sent_only_on_change() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    assert_eq!(h.listener.last_expiry(), Some(Some(START + RENTAL)));
    h.tick_at(START + 1);
    h.tick_at(START + 2);
    assert_eq!(h.expiration_updates(), 1);

    h.clock.set(START + 10);
    assert!(h.engine.begin_decryption());
    h.tick_at(START + 11);
    assert_eq!(h.expiration_updates(), 2);
    assert_eq!(h.listener.last_expiry(), Some(Some(START + 10 + PLAYBACK)));
}

#[test]
fn license_starting_in_the_future_is_pending() {
    let mut h = Harness::new();
    let mut future = license(streaming_policy());
    future.license_start_time = Some(START + 100);
    h.engine.set_license(&future);
    assert!(h.engine.is_license_for_future());
    assert_eq!(h.status(), Some(KeyStatus::UsableInFuture));
    assert!(!h.can_decrypt());
    assert!(!h.engine.begin_decryption());

    h.tick_at(START + 100);
    assert!(!h.engine.is_license_for_future());
    assert_eq!(h.engine.state(), LicenseState::CanPlay);
    assert!(h.can_decrypt());
}

#[test]
fn license_that_cannot_play_is_expired() {
    let mut h = Harness::new();
    h.engine.set_license(&license(LicensePolicy {
        can_play: Some(false),
        ..streaming_policy()
    }));
    assert_eq!(h.engine.state(), LicenseState::Expired);
    assert_eq!(h.status(), Some(KeyStatus::Expired));
    assert!(!h.engine.begin_decryption());
}

#[test]
fn session_expiration_expires_keys() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    assert!(h.can_decrypt());
    h.engine.notify_session_expiration();
    assert_eq!(h.engine.state(), LicenseState::Expired);
    assert_eq!(h.status(), Some(KeyStatus::Expired));
    assert!(!h.can_decrypt());
}

#[test]
fn allowed_usage_of_unknown_key_is_an_error() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    let usage = h
        .engine
        .query_key_allowed_usage(&KeyId::from(KEY))
        .expect("usage");
    assert!(usage.decrypt_to_clear_buffer);
    assert!(matches!(
        h.engine.query_key_allowed_usage(&KeyId::from("missing")),
        Err(Error::KeyNotFound(_))
    ));
}

#[test]
fn decryption_events_track_last_playback() {
    let mut h = Harness::new();
    h.engine.set_license(&license(streaming_policy()));
    assert_eq!(h.engine.seconds_since_last_played(), None);
    assert!(h.engine.begin_decryption());
    h.clock.set(START + 40);
    h.engine.decryption_event();
    h.clock.set(START + 45);
    assert_eq!(h.engine.last_playback_time(), START + 40);
    assert_eq!(h.engine.seconds_since_last_played(), Some(5));
    assert_eq!(h.engine.seconds_since_started(), Some(45));
}
