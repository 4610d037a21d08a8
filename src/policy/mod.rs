//! License policy engine.
//!
//! A [`PolicyEngine`] tracks one license for one session. It is driven by
//! license installation, decrypt notifications and a periodic timer, and
//! answers whether a key may decrypt right now. Status changes are reported
//! through an [`EventListener`].
//!
//! The window arithmetic lives in [`timeline`]; this module holds the
//! license state machine, renewal scheduling and event emission.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::PolicyConfig;
use crate::crypto::CryptoSession;
use crate::error::{Error, Result};
use crate::events::EventListener;
use crate::key::{EntitledKey, HdcpCapability, KeyId};
use crate::license::{License, LicenseIdentification, LicensePolicy};
use crate::license_keys::{KeyAllowedUsage, KeyStatus, KeyStatusMap, LicenseKeys};
use crate::session::SessionId;

pub mod timeline;

use timeline::Timeline;

pub const QUERY_KEY_LICENSE_TYPE: &str = "LicenseType";
pub const QUERY_KEY_PLAY_ALLOWED: &str = "PlayAllowed";
pub const QUERY_KEY_PERSIST_ALLOWED: &str = "PersistAllowed";
pub const QUERY_KEY_RENEW_ALLOWED: &str = "RenewAllowed";
pub const QUERY_KEY_LICENSE_DURATION_REMAINING: &str = "LicenseDurationRemaining";
pub const QUERY_KEY_PLAYBACK_DURATION_REMAINING: &str = "PlaybackDurationRemaining";
pub const QUERY_KEY_RENEWAL_SERVER_URL: &str = "RenewalServerUrl";

pub const QUERY_VALUE_TRUE: &str = "True";
pub const QUERY_VALUE_FALSE: &str = "False";

/// Snapshot returned by [`PolicyEngine::query`].
pub type QueryMap = BTreeMap<String, String>;

/// License-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// No usable license installed.
    Initial,
    /// Waiting for the license start time.
    Pending,
    CanPlay,
    /// A renewal request should go out on the next tick.
    NeedRenewal,
    /// A renewal request went out; waiting for `update_license`.
    WaitingLicenseUpdate,
    Expired,
}

impl LicenseState {
    fn is_playable(self) -> bool {
        matches!(
            self,
            LicenseState::CanPlay | LicenseState::NeedRenewal | LicenseState::WaitingLicenseUpdate
        )
    }
}

fn bool_value(value: bool) -> String {
    let value = if value { QUERY_VALUE_TRUE } else { QUERY_VALUE_FALSE };
    value.to_string()
}

/// Per-session license policy state machine.
pub struct PolicyEngine {
    session_id: SessionId,
    listener: Option<Arc<dyn EventListener>>,
    crypto_session: Arc<dyn CryptoSession>,
    clock: Arc<dyn Clock>,
    config: PolicyConfig,

    state: LicenseState,
    license_id: LicenseIdentification,
    policy: LicensePolicy,
    license_keys: LicenseKeys,

    license_start_time: i64,
    playback_start_time: i64,
    last_playback_time: i64,
    grace_period_end_time: i64,
    was_expired_on_load: bool,
    next_renewal_time: i64,
    // `None` until the first expiration update went out.
    last_expiry_time: Option<Option<i64>>,
    last_recorded_current_time: i64,

    evaluated: bool,
    for_release: bool,
    current_resolution: Option<u32>,
    next_device_check: i64,
}

impl PolicyEngine {
    /// Create an engine for `session_id` on the system clock.
    pub fn new(
        session_id: SessionId,
        listener: Option<Arc<dyn EventListener>>,
        crypto_session: Arc<dyn CryptoSession>,
    ) -> Self {
        let license_keys = LicenseKeys::new(crypto_session.security_level());
        Self {
            session_id,
            listener,
            crypto_session,
            clock: Arc::new(SystemClock),
            config: PolicyConfig::default(),
            state: LicenseState::Initial,
            license_id: LicenseIdentification::default(),
            policy: LicensePolicy::default(),
            license_keys,
            license_start_time: 0,
            playback_start_time: 0,
            last_playback_time: 0,
            grace_period_end_time: 0,
            was_expired_on_load: false,
            next_renewal_time: 0,
            last_expiry_time: None,
            last_recorded_current_time: 0,
            evaluated: false,
            for_release: false,
            current_resolution: None,
            next_device_check: 0,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: PolicyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> LicenseState {
        self.state
    }

    pub fn license_id(&self) -> &LicenseIdentification {
        &self.license_id
    }

    pub fn policy(&self) -> &LicensePolicy {
        &self.policy
    }

    /// Install a new license, replacing keys and playback state.
    pub fn set_license(&mut self, license: &License) {
        self.license_id = license.id.clone();
        self.policy = LicensePolicy::default();
        self.state = LicenseState::Initial;
        self.license_keys.set_from_license(&license.keys);
        self.reset_playback();
        self.for_release = false;
        self.apply_license(license);
    }

    /// Install the policy of a license that is being released.
    ///
    /// Existing keys are expired and the new license's keys are never
    /// loaded, so nothing becomes usable.
    pub fn set_license_for_release(&mut self, license: &License) {
        self.license_id = license.id.clone();
        self.policy = LicensePolicy::default();
        self.state = LicenseState::Initial;
        self.notify_keys_uniform(KeyStatus::Expired);
        self.license_keys.clear();
        self.for_release = true;
        self.apply_license(license);
    }

    /// Apply a renewal. Ignored unless its version is newer.
    pub fn update_license(&mut self, license: &License) {
        self.apply_license(license);
    }

    fn reset_playback(&mut self) {
        self.license_start_time = 0;
        self.playback_start_time = 0;
        self.last_playback_time = 0;
        self.grace_period_end_time = 0;
        self.was_expired_on_load = false;
        self.next_renewal_time = 0;
        self.last_expiry_time = None;
        self.evaluated = false;
    }

    fn apply_license(&mut self, license: &License) {
        let Some(policy) = license.policy.as_ref() else {
            debug!("[{}] license carries no policy", &self.session_id);
            return;
        };
        if self.state == LicenseState::Expired {
            debug!("[{}] updating an expired license", &self.session_id);
        }

        let Some(start_time) = license.license_start_time else {
            self.policy.merge_from(policy);
            warn!("[{}] license has no start time", &self.session_id);
            return;
        };

        if self.state != LicenseState::Initial {
            if license.id.version <= self.license_id.version {
                debug!(
                    "[{}] ignoring renewal with version {} (current {})",
                    &self.session_id,
                    license.id.version,
                    self.license_id.version
                );
                return;
            }
            self.license_id = license.id.clone();
        }
        self.policy.merge_from(policy);

        self.license_start_time = start_time;
        self.next_renewal_time = start_time.saturating_add(self.policy.renewal_delay_seconds());

        let now = self.current_time();
        if !self.policy.can_play() || self.timeline().has_expired(now) {
            self.state = LicenseState::Expired;
            self.notify_keys(KeyStatus::Expired);
            return;
        }

        self.check_device_hdcp_status();
        if now >= self.license_start_time {
            self.state = LicenseState::CanPlay;
            self.notify_keys(KeyStatus::Usable);
        } else {
            self.state = LicenseState::Pending;
            self.notify_keys(KeyStatus::UsableInFuture);
        }
        self.notify_expiration_update(now);
    }

    /// Bind entitled content keys to loaded entitlement keys.
    ///
    /// Returns the number of bindings accepted.
    pub fn set_entitled_license_keys(&mut self, keys: &[EntitledKey]) -> usize {
        let bound = self.license_keys.set_entitled_keys(keys);
        self.refresh_key_statuses();
        bound
    }

    /// Record the first decrypt. Returns whether playback is allowed.
    pub fn begin_decryption(&mut self) -> bool {
        if self.for_release {
            return false;
        }
        if self.playback_start_time != 0 {
            return true;
        }
        if !self.state.is_playable() {
            return false;
        }

        let now = self.current_time();
        self.playback_start_time = now;
        self.last_playback_time = now;
        if self.policy.play_start_grace_period_seconds() == 0 {
            self.grace_period_end_time = now;
        }
        if self.policy.renew_with_usage() {
            self.state = LicenseState::NeedRenewal;
        }
        self.notify_expiration_update(now);
        true
    }

    /// Record a decrypt after playback began.
    pub fn decryption_event(&mut self) {
        self.last_playback_time = self.current_time();
    }

    /// Periodic re-evaluation.
    pub fn on_timer_event(&mut self) {
        self.evaluated = true;
        if self.state == LicenseState::Initial {
            return;
        }
        let now = self.current_time();

        if self.grace_period_end_time == 0 && self.timeline().has_playback_started(now) {
            self.grace_period_end_time = self.playback_start_time;
            self.notify_expiration_update(now);
        }

        if self.state != LicenseState::Expired && self.timeline().has_expired(now) {
            self.state = LicenseState::Expired;
            self.notify_keys(KeyStatus::Expired);
            return;
        }

        if now >= self.next_device_check {
            self.check_device_hdcp_status();
            self.next_device_check =
                now.saturating_add(self.config.hdcp_device_check_interval_seconds);
        }

        let renewal_needed = match self.state {
            LicenseState::CanPlay => self.has_renewal_delay_expired(now),
            LicenseState::NeedRenewal => true,
            LicenseState::WaitingLicenseUpdate => self.has_renewal_retry_interval_expired(now),
            LicenseState::Pending => {
                if now >= self.license_start_time {
                    self.state = LicenseState::CanPlay;
                }
                false
            }
            LicenseState::Initial | LicenseState::Expired => false,
        };

        if self.state.is_playable() {
            self.notify_keys(KeyStatus::Usable);
        }

        if renewal_needed {
            self.state = LicenseState::WaitingLicenseUpdate;
            self.next_renewal_time =
                now.saturating_add(self.policy.renewal_retry_interval_seconds());
            debug!("[{}] renewal needed", &self.session_id);
            if let Some(listener) = &self.listener {
                listener.on_session_renewal_needed(&self.session_id);
            }
        }
    }

    /// Record the output resolution and re-check output constraints.
    pub fn notify_resolution(&mut self, width: u32, height: u32) {
        self.current_resolution = Some(width.saturating_mul(height));
        self.check_device_hdcp_status();
        self.refresh_key_statuses();
    }

    /// Expire the session immediately.
    pub fn notify_session_expiration(&mut self) {
        self.state = LicenseState::Expired;
        self.notify_keys(KeyStatus::Expired);
    }

    /// Whether `key_id` may decrypt content right now.
    ///
    /// Reads the clock and the device HDCP level afresh but changes no
    /// state and emits no events.
    pub fn can_decrypt_content(&self, key_id: &KeyId) -> bool {
        if !self.license_keys.contains(key_id) {
            warn!("[{}] key {} not in license", &self.session_id, key_id);
            return false;
        }
        if !self.license_keys.can_decrypt(key_id) {
            return false;
        }
        if self.timeline().has_expired(self.peek_time()) {
            return false;
        }
        let hdcp = self.current_hdcp();
        self.license_keys
            .constraints_met_with(key_id, self.current_resolution, hdcp)
    }

    /// Last evaluated status of a key, `None` if unknown or not yet bound.
    pub fn key_status(&self, key_id: &KeyId) -> Option<KeyStatus> {
        self.license_keys.status(key_id)
    }

    pub fn can_use_key_for_security_level(&self, key_id: &KeyId) -> bool {
        self.license_keys.meets_security_level(key_id)
    }

    pub fn query_key_allowed_usage(&self, key_id: &KeyId) -> Result<KeyAllowedUsage> {
        self.license_keys
            .allowed_usage(key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.clone()))
    }

    /// Snapshot of the license for display.
    ///
    /// Empty until a license with a start time is installed and the timer
    /// has evaluated it at least once.
    pub fn query(&self) -> QueryMap {
        let mut map = QueryMap::new();
        if self.state == LicenseState::Initial || !self.evaluated || self.license_start_time == 0 {
            return map;
        }
        let now = self.peek_time();
        let timeline = self.timeline();

        map.insert(
            QUERY_KEY_LICENSE_TYPE.to_string(),
            self.license_id.license_type.query_value().to_string(),
        );
        map.insert(
            QUERY_KEY_PLAY_ALLOWED.to_string(),
            bool_value(self.policy.can_play()),
        );
        map.insert(
            QUERY_KEY_PERSIST_ALLOWED.to_string(),
            bool_value(self.policy.can_persist()),
        );
        map.insert(
            QUERY_KEY_RENEW_ALLOWED.to_string(),
            bool_value(self.policy.can_renew()),
        );
        map.insert(
            QUERY_KEY_LICENSE_DURATION_REMAINING.to_string(),
            timeline.license_or_rental_remaining(now).to_string(),
        );
        map.insert(
            QUERY_KEY_PLAYBACK_DURATION_REMAINING.to_string(),
            timeline.playback_remaining(now).to_string(),
        );
        map.insert(
            QUERY_KEY_RENEWAL_SERVER_URL.to_string(),
            self.policy.renewal_server_url().to_string(),
        );
        map
    }

    /// 0 until playback has started, then the playback start time.
    pub fn grace_period_end_time(&self) -> i64 {
        self.grace_period_end_time
    }

    pub fn playback_start_time(&self) -> i64 {
        self.playback_start_time
    }

    pub fn last_playback_time(&self) -> i64 {
        self.last_playback_time
    }

    /// Restore playback times saved with an offline license.
    ///
    /// With a grace period, `grace_period_end_time` replaces the recorded
    /// playback start. A zero value means the grace period never elapsed, so
    /// playback counts as not begun and the next decrypt starts it afresh.
    pub fn restore_playback_times(
        &mut self,
        playback_start_time: i64,
        last_playback_time: i64,
        grace_period_end_time: i64,
    ) {
        self.playback_start_time = playback_start_time.max(0);
        self.last_playback_time = last_playback_time.max(0);
        self.grace_period_end_time = grace_period_end_time.max(0);
        if self.policy.play_start_grace_period_seconds() != 0 {
            self.playback_start_time = self.grace_period_end_time;
        }

        let now = self.current_time();
        self.was_expired_on_load = self
            .timeline()
            .expiry_time(now, true)
            .is_some_and(|expiry| expiry < now);
        self.notify_expiration_update(now);
    }

    pub fn seconds_since_started(&self) -> Option<i64> {
        if self.playback_start_time == 0 {
            return None;
        }
        let seconds = self.peek_time().saturating_sub(self.playback_start_time);
        (seconds >= 0).then_some(seconds)
    }

    pub fn seconds_since_last_played(&self) -> Option<i64> {
        if self.last_playback_time == 0 {
            return None;
        }
        let seconds = self.peek_time().saturating_sub(self.last_playback_time);
        (seconds >= 0).then_some(seconds)
    }

    /// Seconds until the applicable window closes; `i64::MAX` if never.
    pub fn license_or_playback_duration_remaining(&self) -> i64 {
        self.timeline().remaining(self.peek_time())
    }

    pub fn has_license_or_playback_duration_expired(&self) -> bool {
        self.timeline().has_expired(self.peek_time())
    }

    pub fn is_license_for_future(&self) -> bool {
        self.state == LicenseState::Pending
    }

    pub fn can_renew(&self) -> bool {
        self.policy.can_renew()
    }

    fn timeline(&self) -> Timeline<'_> {
        Timeline {
            policy: &self.policy,
            license_start_time: self.license_start_time,
            playback_start_time: self.playback_start_time,
            was_expired_on_load: self.was_expired_on_load,
        }
    }

    fn has_renewal_delay_expired(&self, now: i64) -> bool {
        self.policy.can_renew()
            && self.policy.renewal_delay_seconds() > 0
            && self.license_start_time.saturating_add(self.policy.renewal_delay_seconds()) <= now
    }

    fn has_renewal_retry_interval_expired(&self, now: i64) -> bool {
        self.policy.can_renew()
            && self.policy.renewal_retry_interval_seconds() > 0
            && self.next_renewal_time <= now
    }

    // Readings that jump backwards by more than the skew delta are replaced
    // by the last recorded time.
    fn current_time(&mut self) -> i64 {
        let now = self.clock.now();
        let skewed = now.saturating_add(self.config.clock_skew_delta_seconds);
        if skewed < self.last_recorded_current_time {
            warn!(
                "[{}] clock moved back from {} to {}",
                &self.session_id,
                self.last_recorded_current_time,
                now
            );
            return self.last_recorded_current_time;
        }
        self.last_recorded_current_time = now;
        now
    }

    fn peek_time(&self) -> i64 {
        let now = self.clock.now();
        let skewed = now.saturating_add(self.config.clock_skew_delta_seconds);
        if skewed < self.last_recorded_current_time {
            self.last_recorded_current_time
        } else {
            now
        }
    }

    fn current_hdcp(&self) -> HdcpCapability {
        match self.crypto_session.hdcp_capabilities() {
            Ok((current, _)) => current,
            Err(e) => {
                warn!("[{}] HDCP query failed: {}", &self.session_id, &e);
                HdcpCapability::None
            }
        }
    }

    fn check_device_hdcp_status(&mut self) {
        if self.license_keys.is_empty() {
            return;
        }
        let hdcp = self.current_hdcp();
        self.license_keys
            .apply_constraints(self.current_resolution, hdcp);
    }

    // Re-project the current license window, e.g. after new bindings or a
    // resolution change.
    fn refresh_key_statuses(&mut self) {
        let window = match self.state {
            LicenseState::Initial => return,
            LicenseState::Pending => KeyStatus::UsableInFuture,
            LicenseState::Expired => KeyStatus::Expired,
            _ => KeyStatus::Usable,
        };
        if self.for_release {
            return;
        }
        self.notify_keys(window);
    }

    fn notify_keys(&mut self, window: KeyStatus) {
        let evaluated = self.license_keys.evaluate(window);
        self.emit_key_changes(evaluated);
    }

    fn notify_keys_uniform(&mut self, status: KeyStatus) {
        let evaluated = self.license_keys.evaluate_uniform(status);
        self.emit_key_changes(evaluated);
    }

    fn emit_key_changes(&mut self, evaluated: KeyStatusMap) {
        let change = self.license_keys.commit(evaluated);
        if change.is_empty() {
            return;
        }
        debug!(
            "[{}] {} key(s) changed status",
            &self.session_id,
            change.changed.len()
        );
        if let Some(listener) = &self.listener {
            listener.on_session_keys_change(
                &self.session_id,
                &change.changed,
                change.has_new_usable_key,
            );
        }
    }

    fn notify_expiration_update(&mut self, now: i64) {
        let expiry = self.timeline().expiry_time(now, false);
        if self.last_expiry_time == Some(expiry) {
            return;
        }
        self.last_expiry_time = Some(expiry);
        if let Some(listener) = &self.listener {
            listener.on_expiration_update(&self.session_id, expiry);
        }
    }
}

#[cfg(test)]
mod tests;
