//! Input validation for the tool surface. Every parameter is checked here
//! before anything is persisted; failures name the exact parameter path.

use crate::{
    constants::{MAX_DESCRIPTION_LENGTH, MAX_PROPOSAL_CONTENT_BYTES, MAX_TITLE_LENGTH},
    QuorumError, Result,
};

/// Complexity and risk scores live on a closed 1..=10 scale.
pub fn validate_score(path: &str, value: u8) -> Result<u8> {
    if (1..=10).contains(&value) {
        Ok(value)
    } else {
        Err(QuorumError::invalid(
            path,
            format!("must be between 1 and 10, got {value}"),
        ))
    }
}

/// Confidence is strictly bounded to 0..=1.
pub fn validate_confidence(path: &str, value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(QuorumError::invalid(
            path,
            format!("must be between 0.0 and 1.0, got {value}"),
        ))
    }
}

pub fn validate_title(path: &str, title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(QuorumError::invalid(path, "must not be empty"));
    }
    if trimmed.len() > MAX_TITLE_LENGTH {
        return Err(QuorumError::invalid(
            path,
            format!("exceeds {MAX_TITLE_LENGTH} characters"),
        ));
    }
    Ok(())
}

pub fn validate_description(path: &str, description: &str) -> Result<()> {
    if description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(QuorumError::invalid(
            path,
            format!("exceeds {MAX_DESCRIPTION_LENGTH} characters"),
        ));
    }
    Ok(())
}

/// Proposal bodies are capped at 100 KB.
pub fn validate_proposal_content(path: &str, content: &str) -> Result<()> {
    if content.is_empty() {
        return Err(QuorumError::invalid(path, "must not be empty"));
    }
    if content.len() > MAX_PROPOSAL_CONTENT_BYTES {
        return Err(QuorumError::invalid(
            path,
            format!("exceeds {MAX_PROPOSAL_CONTENT_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Agent identifiers appear in URLs, log lines and database keys, so the
/// accepted alphabet is narrow.
pub fn validate_agent_id(path: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(QuorumError::invalid(path, "must be 1-128 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == ':')
    {
        return Err(QuorumError::invalid(
            path,
            "may only contain alphanumerics, '-', '_', '.', ':'",
        ));
    }
    Ok(())
}
