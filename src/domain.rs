//! Core data model: jobs, languages, and execution results.
//!
//! A [`Job`] is the single authoritative record for one submitted execution
//! request; every component that touches a job agrees on this shape when
//! reading/writing it through the broker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Java,
    Cpp,
    C,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Javascript,
        Language::Typescript,
        Language::Java,
        Language::Cpp,
        Language::C,
        Language::Go,
        Language::Rust,
    ];

    /// The `queue:<language>` / app-name tag used in the broker keyspace.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::Javascript),
            "typescript" => Ok(Language::Typescript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "go" | "golang" => Ok(Language::Go),
            "rust" => Ok(Language::Rust),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

/// Job lifecycle status. Transitions only move forward along
/// `queued -> processing -> (completed | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Not a persisted status; the read-only answer when a record is
    /// absent or has expired.
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// True if `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                // the result-service self-heal rule is the one documented
                // non-monotonic exception.
                | (Failed, Completed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "unknown" => Ok(JobStatus::Unknown),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// The sandbox's black-box execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

/// Client-submitted request to run a piece of code.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeSubmission {
    pub code: String,
    pub language: Language,
    pub filename: String,
}

pub const MAX_CODE_BYTES: usize = 10_000;
pub const MAX_FILENAME_BYTES: usize = 255;

/// The authoritative job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub filename: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub result: Option<ExecutionResult>,
    /// The stored `result` text verbatim, set only when it could not be
    /// decoded into an [`ExecutionResult`] even after unwrapping one legacy
    /// double-JSON-encoding layer. Readers that can't use the structured
    /// form still get the string rather than an error (spec §4.5).
    #[serde(default)]
    pub raw_result: Option<String>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: Uuid, submission: CodeSubmission, created_at: i64) -> Self {
        Self {
            id,
            code: submission.code,
            language: submission.language,
            filename: submission.filename,
            status: JobStatus::Queued,
            created_at,
            completed_at: None,
            result: None,
            raw_result: None,
            error: None,
        }
    }
}

/// Generates a 128-bit random job id rendered as a hyphenated hex string.
pub fn new_job_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_roundtrips_through_tag() {
        for lang in Language::ALL {
            assert_eq!(lang.tag().parse::<Language>().unwrap(), lang);
        }
    }

    #[test]
    fn status_monotonic_happy_path() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_rejects_backwards_and_skipped_transitions() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn status_self_heal_exception_is_the_only_backwards_edge() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
    }
}
