//! Admission Gateway: the one gate every submission passes through before a
//! job is created. Order matters — cheapest checks first, so an
//! unauthenticated flood never reaches the regex-heavy screening pass:
//! API key -> rate limits -> input shape -> static code screening.

mod ratelimit;
mod screening;

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use std::sync::LazyLock;
use subtle::ConstantTimeEq;

use crate::broker::Broker;
use crate::domain::{CodeSubmission, MAX_CODE_BYTES, MAX_FILENAME_BYTES};

pub use ratelimit::{RateLimiter, Verdict as RateLimitVerdict};
pub use screening::ScreeningHit;

static FILENAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("missing API key")]
    AuthMissing,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("code exceeds the {0} byte limit")]
    CodeTooLarge(usize),

    #[error("filename exceeds the {0} byte limit")]
    FilenameTooLong(usize),

    #[error("filename contains characters outside [A-Za-z0-9_.-]")]
    FilenameInvalid,

    #[error("submission rejected by static screening: {0}")]
    ScreeningRejected(String),
}

/// A single entry appended to the broker's `security_events` list whenever
/// admission rejects a submission for a security-relevant reason (as
/// opposed to a plain shape error like an empty filename).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityEvent {
    pub kind: &'static str,
    pub ip: String,
    pub detail: String,
    pub timestamp: i64,
}

const SECURITY_EVENTS_KEY: &str = "security_events";
const SECURITY_EVENTS_MAX_LEN: isize = 1000;

pub struct AdmissionGateway {
    broker: Arc<dyn Broker>,
    limiter: RateLimiter,
    api_keys: HashSet<String>,
}

impl AdmissionGateway {
    pub fn new(
        broker: Arc<dyn Broker>,
        api_keys: HashSet<String>,
        ratelimit_hmac_key: impl Into<Vec<u8>>,
    ) -> Self {
        let limiter = RateLimiter::new(broker.clone(), ratelimit_hmac_key);
        Self {
            broker,
            limiter,
            api_keys,
        }
    }

    /// Constant-time membership check against the configured API key set,
    /// so response latency can't leak how many characters of a guessed key
    /// matched a real one.
    pub fn check_api_key(&self, presented: Option<&str>) -> Result<(), AdmissionError> {
        let presented = presented.ok_or(AdmissionError::AuthMissing)?;
        let matches_any = self
            .api_keys
            .iter()
            .any(|known| known.as_bytes().ct_eq(presented.as_bytes()).into());
        if matches_any {
            Ok(())
        } else {
            Err(AdmissionError::AuthInvalid)
        }
    }

    pub async fn check_rate_limits(
        &self,
        ip: &str,
        api_key: &str,
        now: i64,
    ) -> Result<(), AdmissionError> {
        if self.limiter.check_ip(ip, now).await == RateLimitVerdict::Limited {
            return Err(AdmissionError::RateLimited);
        }
        if self.limiter.check_key(api_key, now).await == RateLimitVerdict::Limited {
            return Err(AdmissionError::RateLimited);
        }
        Ok(())
    }

    pub fn check_shape(&self, submission: &CodeSubmission) -> Result<(), AdmissionError> {
        if submission.code.len() > MAX_CODE_BYTES {
            return Err(AdmissionError::CodeTooLarge(MAX_CODE_BYTES));
        }
        if submission.filename.len() > MAX_FILENAME_BYTES {
            return Err(AdmissionError::FilenameTooLong(MAX_FILENAME_BYTES));
        }
        if submission.filename.is_empty() || !FILENAME_PATTERN.is_match(&submission.filename) {
            return Err(AdmissionError::FilenameInvalid);
        }
        Ok(())
    }

    pub fn screen_code(&self, submission: &CodeSubmission) -> Result<(), AdmissionError> {
        let hits = screening::screen(&submission.code, submission.language);
        if let Some(first) = hits.first() {
            return Err(AdmissionError::ScreeningRejected(first.matched.clone()));
        }
        Ok(())
    }

    /// Runs the full gate in order, recording a `security_events` entry for
    /// anything past the shape-validation stage (auth failures, rate
    /// limiting, and screening rejections are all security-relevant; a
    /// malformed filename is just a client mistake).
    pub async fn admit(
        &self,
        ip: &str,
        api_key: Option<&str>,
        submission: &CodeSubmission,
        now: i64,
    ) -> Result<(), AdmissionError> {
        self.check_api_key(api_key).map_err(|e| {
            self.record_blocking(ip, &e, now);
            e
        })?;
        let api_key = api_key.expect("checked by check_api_key");

        self.check_rate_limits(ip, api_key, now).await.map_err(|e| {
            self.record_blocking(ip, &e, now);
            e
        })?;

        self.check_shape(submission)?;

        self.screen_code(submission).map_err(|e| {
            self.record_blocking(ip, &e, now);
            e
        })?;

        Ok(())
    }

    fn record_blocking(&self, ip: &str, error: &AdmissionError, now: i64) {
        let event = SecurityEvent {
            kind: "admission_rejected",
            ip: ip.to_string(),
            detail: error.to_string(),
            timestamp: now,
        };
        let broker = self.broker.clone();
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tokio::spawn(async move {
            let _ = broker
                .push_and_trim(SECURITY_EVENTS_KEY, &payload, SECURITY_EVENTS_MAX_LEN)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::domain::Language;

    fn gateway() -> AdmissionGateway {
        let mut keys = HashSet::new();
        keys.insert("correct-key".to_string());
        AdmissionGateway::new(Arc::new(FakeBroker::new()), keys, b"test-hmac-key".to_vec())
    }

    fn submission(code: &str) -> CodeSubmission {
        CodeSubmission {
            code: code.to_string(),
            language: Language::Python,
            filename: "main.py".to_string(),
        }
    }

    #[test]
    fn accepts_the_configured_key() {
        assert!(gateway().check_api_key(Some("correct-key")).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_key() {
        let gw = gateway();
        assert!(matches!(
            gw.check_api_key(None),
            Err(AdmissionError::AuthMissing)
        ));
        assert!(matches!(
            gw.check_api_key(Some("wrong")),
            Err(AdmissionError::AuthInvalid)
        ));
    }

    #[test]
    fn rejects_oversized_code() {
        let gw = gateway();
        let huge = "x".repeat(MAX_CODE_BYTES + 1);
        assert!(matches!(
            gw.check_shape(&submission(&huge)),
            Err(AdmissionError::CodeTooLarge(_))
        ));
    }

    #[test]
    fn rejects_filenames_with_path_traversal() {
        let gw = gateway();
        let mut sub = submission("print(1)");
        sub.filename = "../../etc/passwd".to_string();
        assert!(matches!(
            gw.check_shape(&sub),
            Err(AdmissionError::FilenameInvalid)
        ));
    }

    #[test]
    fn screens_out_blocked_keywords() {
        let gw = gateway();
        let sub = submission("import os\nos.system('id')");
        assert!(matches!(
            gw.screen_code(&sub),
            Err(AdmissionError::ScreeningRejected(_))
        ));
    }

    #[tokio::test]
    async fn admit_passes_clean_submission_end_to_end() {
        let gw = gateway();
        let sub = submission("print('hello')");
        assert!(gw.admit("1.2.3.4", Some("correct-key"), &sub, 0).await.is_ok());
    }

    #[tokio::test]
    async fn admit_rejects_before_rate_limits_on_bad_key() {
        let gw = gateway();
        let sub = submission("print('hello')");
        let err = gw.admit("1.2.3.4", Some("nope"), &sub, 0).await.unwrap_err();
        assert!(matches!(err, AdmissionError::AuthInvalid));
    }
}
