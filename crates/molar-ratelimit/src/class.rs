//! Limiter classes and their budgets.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use molar_config::LimiterOverride;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Endpoint family a request is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterClass {
    Api,
    Auth,
    Upload,
    PasswordReset,
    EmailVerification,
    Invitation,
}

impl LimiterClass {
    pub const ALL: [LimiterClass; 6] = [
        LimiterClass::Api,
        LimiterClass::Auth,
        LimiterClass::Upload,
        LimiterClass::PasswordReset,
        LimiterClass::EmailVerification,
        LimiterClass::Invitation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterClass::Api => "api",
            LimiterClass::Auth => "auth",
            LimiterClass::Upload => "upload",
            LimiterClass::PasswordReset => "password_reset",
            LimiterClass::EmailVerification => "email_verification",
            LimiterClass::Invitation => "invitation",
        }
    }

    /// Built-in budget for the class.
    pub fn default_policy(&self) -> RatePolicy {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(3_600);
        const DAY: Duration = Duration::from_secs(86_400);

        match self {
            LimiterClass::Api => RatePolicy::new(100, MINUTE),
            LimiterClass::Auth => RatePolicy::new(10, MINUTE),
            LimiterClass::Upload => RatePolicy::new(20, MINUTE),
            LimiterClass::PasswordReset => {
                RatePolicy::new(3, HOUR).with_block(Duration::from_secs(900))
            }
            LimiterClass::EmailVerification => {
                RatePolicy::new(5, HOUR).with_block(Duration::from_secs(900))
            }
            LimiterClass::Invitation => RatePolicy::new(25, DAY).with_block(HOUR),
        }
    }
}

impl fmt::Display for LimiterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown limiter class `{0}`")]
pub struct UnknownClass(pub String);

impl FromStr for LimiterClass {
    type Err = UnknownClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimiterClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| UnknownClass(s.to_string()))
    }
}

/// Sliding-window budget: `points` requests per `duration`, optionally
/// followed by a `block_duration` lockout once exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub points: u32,
    pub duration: Duration,
    pub block_duration: Option<Duration>,
}

impl RatePolicy {
    pub const fn new(points: u32, duration: Duration) -> Self {
        Self {
            points,
            duration,
            block_duration: None,
        }
    }

    pub const fn with_block(mut self, block: Duration) -> Self {
        self.block_duration = Some(block);
        self
    }
}

impl From<&LimiterOverride> for RatePolicy {
    fn from(o: &LimiterOverride) -> Self {
        Self {
            points: o.points,
            duration: o.duration,
            block_duration: o.block_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        assert_eq!(LimiterClass::Api.default_policy().points, 100);
        assert_eq!(
            LimiterClass::PasswordReset.default_policy(),
            RatePolicy {
                points: 3,
                duration: Duration::from_secs(3_600),
                block_duration: Some(Duration::from_secs(900)),
            }
        );
        assert_eq!(
            LimiterClass::Invitation.default_policy().block_duration,
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(LimiterClass::Upload.default_policy().block_duration, None);
    }

    #[test]
    fn test_parse_class_names() {
        for class in LimiterClass::ALL {
            assert_eq!(class.as_str().parse::<LimiterClass>().unwrap(), class);
        }
        assert!("passwordReset".parse::<LimiterClass>().is_err());
    }
}
