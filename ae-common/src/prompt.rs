//! Prompt loading and sanitizing.
//!
//! The prompt must not point the agent at the upstream repository or pull
//! request, so repository links are removed before the text is sent.

use std::path::Path;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::errors::ValidationError;

struct Patterns {
    repo_link_block: Regex,
    hosting_url: Regex,
    blank_runs: Regex,
}

static PATTERNS: OnceLock<Result<Patterns, String>> = OnceLock::new();

fn patterns() -> Result<&'static Patterns, ValidationError> {
    PATTERNS
        .get_or_init(|| {
            Ok(Patterns {
                repo_link_block: Regex::new(r"\n*\*\*Repo Link:\*\*\s*\n\[[^\]]*\]\([^)]*\)\s*\n*")
                    .map_err(|e| e.to_string())?,
                hosting_url: RegexBuilder::new(r"https?://(?:github\.com|gitee\.com|gitlab\.com)/\S+")
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| e.to_string())?,
                blank_runs: Regex::new(r"\n{3,}").map_err(|e| e.to_string())?,
            })
        })
        .as_ref()
        .map_err(|e| ValidationError::Invalid(format!("prompt patterns: {}", e)))
}

/// Remove the `**Repo Link:**` block, redact git-hosting URLs and collapse
/// runs of blank lines.
pub fn sanitize_prompt(prompt: &str) -> Result<String, ValidationError> {
    let p = patterns()?;
    let out = p.repo_link_block.replace_all(prompt, "\n\n");
    let out = p.hosting_url.replace_all(&out, "[REDACTED]");
    let out = p.blank_runs.replace_all(&out, "\n\n");
    let out = out.trim().to_string();
    if out.len() != prompt.trim().len() {
        debug!(before = prompt.len(), after = out.len(), "prompt sanitized");
    }
    Ok(out)
}

/// Read a prompt file; empty (after trimming) is an error.
pub fn load_prompt(path: &Path) -> Result<String, ValidationError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::Invalid(format!("cannot read prompt {}: {}", path.display(), e)))?;
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_link_block_removed() {
        let prompt = "# Task\n\nFix the bug.\n\n**Repo Link:**\n[owner/repo](https://github.com/owner/repo/pull/12)\n\n\n\nDetails here.";
        let out = sanitize_prompt(prompt).unwrap();
        assert_eq!(out, "# Task\n\nFix the bug.\n\nDetails here.");
    }

    #[test]
    fn test_hosting_urls_redacted_case_insensitive() {
        let out = sanitize_prompt(
            "See https://GitHub.com/o/r/issues/1 and http://gitlab.com/g/p and https://gitee.com/x/y.\nKeep https://docs.rs/regex",
        )
        .unwrap();
        assert_eq!(out.matches("[REDACTED]").count(), 3);
        assert!(out.contains("https://docs.rs/regex"));
        assert!(!out.to_lowercase().contains("github.com"));
    }

    #[test]
    fn test_plain_prompt_untouched() {
        assert_eq!(sanitize_prompt("  just do it\n").unwrap(), "just do it");
    }

    #[test]
    fn test_load_prompt_rejects_blank() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.md");
        std::fs::write(&path, "\n  \n").unwrap();
        assert!(matches!(load_prompt(&path), Err(ValidationError::EmptyPrompt)));
        assert!(load_prompt(&dir.path().join("missing.md")).is_err());
    }
}
