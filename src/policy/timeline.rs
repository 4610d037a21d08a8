//! License window arithmetic.
//!
//! Everything here is a pure function of the policy, the recorded times and
//! `now`. Expiry times are `None` when no bound applies.

use crate::license::LicensePolicy;
use crate::license_keys::KeyStatus;

/// Snapshot of the times the window depends on.
#[derive(Debug, Clone, Copy)]
pub struct Timeline<'a> {
    pub policy: &'a LicensePolicy,
    pub license_start_time: i64,
    /// First decrypt, or 0 if decryption never began.
    pub playback_start_time: i64,
    pub was_expired_on_load: bool,
}

fn earliest(a: Option<i64>, b: i64) -> i64 {
    a.map_or(b, |a| a.min(b))
}

impl Timeline<'_> {
    /// Playback counts as started once the grace period after the first
    /// decrypt has elapsed.
    pub fn has_playback_started(&self, now: i64) -> bool {
        if self.playback_start_time == 0 {
            return false;
        }
        let elapsed = now.saturating_sub(self.playback_start_time);
        elapsed >= self.policy.play_start_grace_period_seconds()
    }

    pub fn hard_license_expiry(&self) -> Option<i64> {
        let duration = self.policy.license_duration_seconds();
        (duration > 0).then(|| self.license_start_time.saturating_add(duration))
    }

    /// Rental bound, capped by the hard license bound.
    pub fn rental_expiry(&self) -> Option<i64> {
        let hard_limit = self.hard_license_expiry();
        let rental = self.policy.rental_duration_seconds();
        if rental == 0 {
            return hard_limit;
        }
        Some(earliest(hard_limit, self.license_start_time.saturating_add(rental)))
    }

    /// Next expiry given the playback state at `now`.
    ///
    /// Before playback starts the rental window applies; afterwards the
    /// playback window does, unless soft enforcement defers to the hard
    /// limit.
    pub fn expiry_time(&self, now: i64, ignore_soft_enforce: bool) -> Option<i64> {
        if !self.has_playback_started(now) {
            return self.rental_expiry();
        }
        let hard_limit = self.hard_license_expiry();
        let playback = self.policy.playback_duration_seconds();
        if playback == 0 {
            return hard_limit;
        }
        if !ignore_soft_enforce
            && !self.was_expired_on_load
            && self.policy.soft_enforce_playback_duration()
        {
            return hard_limit;
        }
        Some(earliest(hard_limit, self.playback_start_time.saturating_add(playback)))
    }

    pub fn has_expired(&self, now: i64) -> bool {
        self.expiry_time(now, false)
            .is_some_and(|expiry| expiry <= now)
    }

    /// License window status at `now`.
    pub fn window(&self, now: i64) -> KeyStatus {
        if !self.policy.can_play() || self.has_expired(now) {
            KeyStatus::Expired
        } else if now < self.license_start_time {
            KeyStatus::UsableInFuture
        } else {
            KeyStatus::Usable
        }
    }

    /// Seconds left on the rental/license window; `i64::MAX` if unbounded.
    pub fn license_or_rental_remaining(&self, now: i64) -> i64 {
        if self.has_expired(now) {
            return 0;
        }
        let Some(expiry) = self.rental_expiry() else {
            return i64::MAX;
        };
        if expiry < now {
            return 0;
        }
        let license_duration = self.policy.license_duration_seconds();
        if license_duration == 0 {
            return expiry.saturating_sub(now);
        }
        expiry.saturating_sub(now).min(license_duration)
    }

    /// Seconds left on the playback window; the full duration before
    /// playback begins and `i64::MAX` if unbounded.
    pub fn playback_remaining(&self, now: i64) -> i64 {
        let duration = self.policy.playback_duration_seconds();
        if duration == 0 {
            return i64::MAX;
        }
        if self.playback_start_time == 0 {
            return duration;
        }
        let expiry = self.playback_start_time.saturating_add(duration);
        if expiry < now {
            return 0;
        }
        expiry.saturating_sub(now).min(duration)
    }

    /// Seconds until whichever window currently applies closes.
    pub fn remaining(&self, now: i64) -> i64 {
        match self.expiry_time(now, false) {
            None => i64::MAX,
            Some(expiry) if expiry < now => 0,
            Some(expiry) => expiry.saturating_sub(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timeline;
    use crate::license::LicensePolicy;
    use crate::license_keys::KeyStatus;

    const START: i64 = 1_413_517_500;
    const RENTAL: i64 = 604_800;
    const PLAYBACK: i64 = 172_800;

    fn policy() -> LicensePolicy {
        LicensePolicy {
            can_play: Some(true),
            rental_duration_seconds: Some(RENTAL),
            playback_duration_seconds: Some(PLAYBACK),
            ..Default::default()
        }
    }

    fn timeline(policy: &LicensePolicy, playback_start: i64) -> Timeline<'_> {
        Timeline {
            policy,
            license_start_time: START,
            playback_start_time: playback_start,
            was_expired_on_load: false,
        }
    }

    #[test]
    fn rental_then_playback_window() {
        let policy = policy();
        let idle = timeline(&policy, 0);
        assert_eq!(idle.expiry_time(START + 10, false), Some(START + RENTAL));
        assert_eq!(idle.window(START - 1), KeyStatus::UsableInFuture);
        assert_eq!(idle.window(START), KeyStatus::Usable);
        assert_eq!(idle.window(START + RENTAL), KeyStatus::Expired);

        let playing = timeline(&policy, START + 6);
        assert_eq!(playing.expiry_time(START + 7, false), Some(START + 6 + PLAYBACK));
        assert_eq!(playing.window(START + 6 + PLAYBACK - 1), KeyStatus::Usable);
        assert_eq!(playing.window(START + 6 + PLAYBACK), KeyStatus::Expired);
    }

    #[test]
    fn unlimited_durations_never_expire() {
        let policy = LicensePolicy {
            can_play: Some(true),
            ..Default::default()
        };
        let playing = timeline(&policy, START + 1);
        assert_eq!(playing.expiry_time(START + 100, false), None);
        assert_eq!(playing.window(i64::MAX / 2), KeyStatus::Usable);
        assert_eq!(playing.remaining(START + 100), i64::MAX);
        assert_eq!(playing.license_or_rental_remaining(START + 100), i64::MAX);
        assert_eq!(playing.playback_remaining(START + 100), i64::MAX);
    }

    #[test]
    fn hard_limit_caps_rental_and_playback() {
        let policy = LicensePolicy {
            license_duration_seconds: Some(1000),
            ..policy()
        };
        let idle = timeline(&policy, 0);
        assert_eq!(idle.rental_expiry(), Some(START + 1000));
        assert_eq!(idle.license_or_rental_remaining(START + 400), 600);
        let playing = timeline(&policy, START + 10);
        assert_eq!(playing.expiry_time(START + 20, false), Some(START + 1000));
    }

    #[test]
    fn grace_period_delays_playback_start() {
        let policy = LicensePolicy {
            play_start_grace_period_seconds: Some(30),
            ..policy()
        };
        let t = timeline(&policy, START + 100);
        assert!(!t.has_playback_started(START + 129));
        assert_eq!(t.expiry_time(START + 129, false), Some(START + RENTAL));
        assert!(t.has_playback_started(START + 130));
        assert_eq!(t.expiry_time(START + 130, false), Some(START + 100 + PLAYBACK));
    }

    #[test]
    fn soft_enforce_defers_to_hard_limit_unless_expired_on_load() {
        let policy = LicensePolicy {
            soft_enforce_playback_duration: Some(true),
            license_duration_seconds: Some(RENTAL),
            ..policy()
        };
        let mut t = timeline(&policy, START + 10);
        assert_eq!(t.expiry_time(START + 20, false), Some(START + RENTAL));
        assert_eq!(t.expiry_time(START + 20, true), Some(START + 10 + PLAYBACK));
        t.was_expired_on_load = true;
        assert_eq!(t.expiry_time(START + 20, false), Some(START + 10 + PLAYBACK));
    }

    #[test]
    fn remaining_values() {
        let policy = policy();
        let idle = timeline(&policy, 0);
        assert_eq!(idle.playback_remaining(START + 5), PLAYBACK);
        assert_eq!(idle.license_or_rental_remaining(START + 5), RENTAL - 5);
        let playing = timeline(&policy, START + 10);
        assert_eq!(playing.playback_remaining(START + 110), PLAYBACK - 100);
        assert_eq!(playing.license_or_rental_remaining(START + 10 + PLAYBACK), 0);
        assert_eq!(playing.playback_remaining(START + 11 + PLAYBACK), 0);
    }

    #[test]
    fn can_play_false_is_expired() {
        let policy = LicensePolicy {
            can_play: Some(false),
            ..Default::default()
        };
        assert_eq!(timeline(&policy, 0).window(START), KeyStatus::Expired);
    }
}
