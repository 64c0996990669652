//! Remote job error classification.
//!
//! Failed jobs carry a free-form description, usually a JSON object such as
//! `{"ErrType": "fetchFailed", "ErrDetail": "..."}` but sometimes plain text.
//! Classification never fails: anything unrecognized is `Unknown`.

use serde::Deserialize;
use tracing::debug;

use crate::types::UpdateErrorType;

#[derive(Debug, Default, Deserialize)]
struct JobErrorDescription {
    #[serde(rename = "ErrType", default)]
    err_type: String,
    #[serde(rename = "ErrDetail", default)]
    err_detail: String,
}

/// Substrings recognized in error text, checked in order.
const TEXT_PATTERNS: &[(&str, UpdateErrorType)] = &[
    ("no space left", UpdateErrorType::DiskSpace),
    ("insufficient space", UpdateErrorType::DiskSpace),
    ("not enough space", UpdateErrorType::DiskSpace),
    ("you don't have enough free space", UpdateErrorType::DiskSpace),
    ("dpkg was interrupted", UpdateErrorType::DpkgInterrupted),
    ("unmet dependencies", UpdateErrorType::Dependency),
    ("dependencies broken", UpdateErrorType::Dependency),
    ("broken packages", UpdateErrorType::Dependency),
    ("held broken", UpdateErrorType::Dependency),
    ("unauthorized", UpdateErrorType::Auth),
    ("authentication", UpdateErrorType::Auth),
    ("no_pubkey", UpdateErrorType::Auth),
    ("signatures couldn't be verified", UpdateErrorType::Auth),
    ("temporary failure resolving", UpdateErrorType::Network),
    ("could not resolve", UpdateErrorType::Network),
    ("network is unreachable", UpdateErrorType::Network),
    ("connection timed out", UpdateErrorType::Network),
    ("connection refused", UpdateErrorType::Network),
    ("failed to fetch", UpdateErrorType::Network),
];

/// Map a remote `ErrType` name.
fn classify_err_type(err_type: &str) -> Option<UpdateErrorType> {
    match err_type {
        "insufficientSpace" => Some(UpdateErrorType::DiskSpace),
        "fetchFailed" | "indexDownloadFailed" | "platformUnreachable" | "networkError" => {
            Some(UpdateErrorType::Network)
        }
        "dependenciesBroken" | "unmetDependencies" => Some(UpdateErrorType::Dependency),
        "dpkgInterrupted" => Some(UpdateErrorType::DpkgInterrupted),
        "authFailed" | "gpgError" | "invalidSignature" => Some(UpdateErrorType::Auth),
        _ => None,
    }
}

fn classify_text(text: &str) -> Option<UpdateErrorType> {
    let lower = text.to_lowercase();
    TEXT_PATTERNS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
}

/// Classify the description of a failed job.
pub fn analyze_job_error_message(description: &str) -> UpdateErrorType {
    let parsed: Option<JobErrorDescription> = serde_json::from_str(description).ok();

    let kind = match parsed {
        Some(desc) => classify_err_type(&desc.err_type)
            .or_else(|| classify_text(&desc.err_detail))
            .or_else(|| classify_text(&desc.err_type)),
        None => classify_text(description),
    }
    .unwrap_or(UpdateErrorType::Unknown);

    debug!(kind = ?kind, "Classified job error");
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_descriptions() {
        assert_eq!(
            analyze_job_error_message(r#"{"ErrType":"fetchFailed","ErrDetail":"E: Failed"}"#),
            UpdateErrorType::Network
        );
        assert_eq!(
            analyze_job_error_message(r#"{"ErrType":"dpkgInterrupted","ErrDetail":""}"#),
            UpdateErrorType::DpkgInterrupted
        );
        assert_eq!(
            analyze_job_error_message(
                r#"{"ErrType":"unknown","ErrDetail":"write failed: No space left on device"}"#
            ),
            UpdateErrorType::DiskSpace
        );
    }

    #[test]
    fn test_plain_text_descriptions() {
        assert_eq!(
            analyze_job_error_message("E: You don't have enough free space in /var/cache/apt"),
            UpdateErrorType::DiskSpace
        );
        assert_eq!(
            analyze_job_error_message("Temporary failure resolving 'mirror.example.org'"),
            UpdateErrorType::Network
        );
        assert_eq!(
            analyze_job_error_message("The following packages have unmet dependencies"),
            UpdateErrorType::Dependency
        );
        assert_eq!(
            analyze_job_error_message("NO_PUBKEY 1234ABCD"),
            UpdateErrorType::Auth
        );
    }

    #[test]
    fn test_unrecognized_is_unknown() {
        assert_eq!(analyze_job_error_message(""), UpdateErrorType::Unknown);
        assert_eq!(analyze_job_error_message("{}"), UpdateErrorType::Unknown);
        assert_eq!(analyze_job_error_message("something odd"), UpdateErrorType::Unknown);
        assert_eq!(analyze_job_error_message("[1, 2"), UpdateErrorType::Unknown);
    }
}
