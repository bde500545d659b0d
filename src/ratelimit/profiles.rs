//! The predefined limiter profiles.
//!
//! Each profile is the same [`Limiter`] with its own policy and its own
//! [`WindowStore`], so one class of endpoint never eats another's quota.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};
use super::limiter::{Limiter, LimiterPolicy};
use super::store::WindowStore;
use crate::error::{Result, WardenError};

const MINUTE: u64 = 60;

/// A named endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// All API traffic
    General,
    /// Login attempts
    Auth,
    /// Password reset requests
    PasswordReset,
    /// Account creation
    Registration,
    /// Sensitive mutating endpoints
    Strict,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::General,
        Profile::Auth,
        Profile::PasswordReset,
        Profile::Registration,
        Profile::Strict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::General => "general",
            Profile::Auth => "auth",
            Profile::PasswordReset => "password_reset",
            Profile::Registration => "registration",
            Profile::Strict => "strict",
        }
    }

    /// The fixed policy for this profile.
    pub fn policy(&self) -> LimiterPolicy {
        let (window_mins, max_requests, message) = match self {
            Profile::General => (
                15,
                100,
                "Too many requests from this IP, please try again later.",
            ),
            Profile::Auth => (
                15,
                5,
                "Too many authentication attempts, please try again later.",
            ),
            Profile::PasswordReset => (
                60,
                3,
                "Too many password reset attempts, please try again later.",
            ),
            Profile::Registration => (
                60,
                5,
                "Too many accounts created from this IP, please try again later.",
            ),
            Profile::Strict => (
                15,
                10,
                "Too many requests to this sensitive endpoint, please try again later.",
            ),
        };

        LimiterPolicy::preset(Duration::from_secs(window_mins * MINUTE), max_requests, message)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "general" => Ok(Profile::General),
            "auth" => Ok(Profile::Auth),
            "password_reset" | "passwordReset" => Ok(Profile::PasswordReset),
            "registration" => Ok(Profile::Registration),
            "strict" => Ok(Profile::Strict),
            other => Err(WardenError::Config(format!("unknown profile: {}", other))),
        }
    }
}

/// The five profile limiters, each over an independent store.
pub struct Profiles {
    general: Arc<Limiter>,
    auth: Arc<Limiter>,
    password_reset: Arc<Limiter>,
    registration: Arc<Limiter>,
    strict: Arc<Limiter>,
}

impl Profiles {
    /// Build all profiles on the system clock. With `disabled` set, every
    /// limiter admits all requests untouched.
    pub fn new(disabled: bool) -> Self {
        Self::with_clock(disabled, Arc::new(SystemClock))
    }

    pub fn with_clock(disabled: bool, clock: Arc<dyn Clock>) -> Self {
        if disabled {
            warn!("Rate limiting is disabled for all profiles");
        }
        let build = |profile: Profile| {
            let store = Arc::new(WindowStore::with_clock(clock.clone()));
            let limiter = Limiter::new(profile.as_str(), profile.policy(), store);
            Arc::new(limiter.with_enabled(!disabled))
        };

        Self {
            general: build(Profile::General),
            auth: build(Profile::Auth),
            password_reset: build(Profile::PasswordReset),
            registration: build(Profile::Registration),
            strict: build(Profile::Strict),
        }
    }

    pub fn get(&self, profile: Profile) -> &Arc<Limiter> {
        match profile {
            Profile::General => &self.general,
            Profile::Auth => &self.auth,
            Profile::PasswordReset => &self.password_reset,
            Profile::Registration => &self.registration,
            Profile::Strict => &self.strict,
        }
    }

    pub fn general(&self) -> &Arc<Limiter> {
        &self.general
    }

    pub fn auth(&self) -> &Arc<Limiter> {
        &self.auth
    }

    pub fn password_reset(&self) -> &Arc<Limiter> {
        &self.password_reset
    }

    pub fn registration(&self) -> &Arc<Limiter> {
        &self.registration
    }

    pub fn strict(&self) -> &Arc<Limiter> {
        &self.strict
    }

    /// Start the background sweep on every profile store.
    pub fn spawn_sweepers(&self, period: Duration) {
        let started = Profile::ALL
            .iter()
            .filter(|profile| self.get(**profile).store().spawn_sweeper(period))
            .count();
        info!(started, "Profile sweepers running");
    }

    /// Stop every sweep and clear every store.
    pub fn destroy(&self) {
        for profile in Profile::ALL {
            self.get(profile).store().destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::limiter::{
        Decision, HeaderError, RequestContext, DEFAULT_REJECTION_MESSAGE,
    };

    struct Caller(&'static str);

    impl RequestContext for Caller {
        fn caller_address(&self) -> Option<String> {
            Some(self.0.to_string())
        }

        fn set_header(
            &mut self,
            _: &'static str,
            _: &str,
        ) -> std::result::Result<(), HeaderError> {
            Ok(())
        }
    }

    #[test]
    fn test_profile_policies() {
        let expected = [
            (Profile::General, 900, 100),
            (Profile::Auth, 900, 5),
            (Profile::PasswordReset, 3600, 3),
            (Profile::Registration, 3600, 5),
            (Profile::Strict, 900, 10),
        ];

        for (profile, window_secs, max_requests) in expected {
            let policy = profile.policy();
            assert_eq!(policy.window(), Duration::from_secs(window_secs), "{}", profile);
            assert_eq!(policy.max_requests(), max_requests, "{}", profile);
            assert_ne!(policy.rejection_message(), DEFAULT_REJECTION_MESSAGE, "{}", profile);
        }
    }

    #[test]
    fn test_profile_policies_pass_validation() {
        for profile in Profile::ALL {
            let policy = profile.policy();
            assert!(LimiterPolicy::new(policy.window(), policy.max_requests()).is_ok());
        }
    }

    #[test]
    fn test_profile_round_trip_names() {
        for profile in Profile::ALL {
            assert_eq!(profile.as_str().parse::<Profile>().unwrap(), profile);
        }
        assert_eq!("passwordReset".parse::<Profile>().unwrap(), Profile::PasswordReset);
        assert!("admin".parse::<Profile>().is_err());
    }

    #[test]
    fn test_profiles_have_independent_stores() {
        let profiles = Profiles::new(false);

        for _ in 0..5 {
            assert!(profiles.auth().evaluate(&mut Caller("10.0.0.1")).is_allowed());
        }
        assert!(!profiles.auth().evaluate(&mut Caller("10.0.0.1")).is_allowed());

        assert!(profiles.general().evaluate(&mut Caller("10.0.0.1")).is_allowed());
        assert!(profiles.strict().evaluate(&mut Caller("10.0.0.1")).is_allowed());
        assert!(!Arc::ptr_eq(profiles.auth().store(), profiles.general().store()));
    }

    #[test]
    fn test_password_reset_rejection_message() {
        let clock = Arc::new(ManualClock::default());
        let profiles = Profiles::with_clock(false, clock);
        let limiter = profiles.get(Profile::PasswordReset);

        for _ in 0..3 {
            limiter.evaluate(&mut Caller("10.0.0.2"));
        }
        match limiter.evaluate(&mut Caller("10.0.0.2")) {
            Decision::Rejected(rejection) => {
                assert_eq!(
                    rejection.body.error.message,
                    "Too many password reset attempts, please try again later."
                );
                assert_eq!(rejection.retry_after(), 3600);
            }
            Decision::Allowed(_) => panic!("Fourth reset should be rejected"),
        }
    }

    #[test]
    fn test_disabled_profiles_never_throttle() {
        let profiles = Profiles::new(true);

        for profile in Profile::ALL {
            let limiter = profiles.get(profile);
            assert!(!limiter.is_enabled());
            for _ in 0..200 {
                assert!(limiter.evaluate(&mut Caller("10.0.0.3")).is_allowed());
            }
            assert!(limiter.store().is_empty());
        }
    }

    #[test]
    fn test_registration_window_expires() {
        let clock = Arc::new(ManualClock::default());
        let profiles = Profiles::with_clock(false, clock.clone());
        let limiter = profiles.registration();

        for _ in 0..5 {
            limiter.evaluate(&mut Caller("10.0.0.4"));
        }
        assert!(!limiter.evaluate(&mut Caller("10.0.0.4")).is_allowed());

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.evaluate(&mut Caller("10.0.0.4")).is_allowed());
    }

    #[tokio::test]
    async fn test_spawn_and_destroy() {
        let profiles = Profiles::new(false);
        profiles.spawn_sweepers(Duration::from_secs(60));
        for profile in Profile::ALL {
            assert!(profiles.get(profile).store().has_sweeper());
        }

        profiles.general().evaluate(&mut Caller("10.0.0.5"));
        profiles.destroy();
        profiles.destroy();

        for profile in Profile::ALL {
            let store = profiles.get(profile).store();
            assert!(!store.has_sweeper());
            assert!(store.is_empty());
        }
    }
}
