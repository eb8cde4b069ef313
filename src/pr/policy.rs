//! Pure policy evaluation for PR write actions.
//!
//! Evaluation is side-effect-free; the gateway owns the transactional
//! plumbing. Rules run in a fixed order and the first violation
//! short-circuits with its stable code.

use regex::Regex;

use crate::config::PrPolicyConfig;

/// Allow/deny verdict with a stable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub code: String,
    pub message: String,
}

impl PolicyDecision {
    fn deny(code: &str, message: &str) -> Self {
        Self {
            allowed: false,
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    fn allow() -> Self {
        Self {
            allowed: true,
            code: "ALLOWED".to_string(),
            message: "Allowed by policy".to_string(),
        }
    }
}

/// Inputs to policy evaluation. Diff statistics and check results are
/// optional — rules that need them are skipped when the caller has none.
#[derive(Debug, Clone, Default)]
pub struct PolicyRequest<'a> {
    pub repo_full_name: &'a str,
    pub base_branch: &'a str,
    pub head_branch: &'a str,
    pub changed_files: Option<&'a [String]>,
    pub files_changed: Option<u32>,
    pub additions: Option<u32>,
    pub deletions: Option<u32>,
    pub passed_checks: Option<&'a [String]>,
}

/// Match a value against an allowlist entry — exact, or glob (`*`, `**`,
/// `?`).
fn allowlist_matches(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }
    glob_match(pattern, value)
}

/// Minimal glob matcher via regex translation. `**` crosses `/`
/// boundaries, `*` and `?` do not.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return false;
    }
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Optionally swallow a following separator so
                    // "secrets/**" also matches "secrets".
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(value)).unwrap_or(false)
}

/// Evaluate the create-PR policy. Empty allowlists and unset limits
/// disable their rules; the write-enabled flag always applies.
pub fn evaluate_create_pr_policy(
    config: &PrPolicyConfig,
    request: &PolicyRequest<'_>,
) -> PolicyDecision {
    if !config.write_enabled {
        return PolicyDecision::deny(
            "PR_WRITE_DISABLED",
            "PR write operations are disabled by default",
        );
    }

    if !config.repo_allowlist.is_empty()
        && !config
            .repo_allowlist
            .iter()
            .any(|p| allowlist_matches(p, request.repo_full_name))
    {
        return PolicyDecision::deny("REPO_NOT_ALLOWED", "Target repository is not in allowlist");
    }

    if !config.base_branch_allowlist.is_empty()
        && !config
            .base_branch_allowlist
            .iter()
            .any(|p| allowlist_matches(p, request.base_branch))
    {
        return PolicyDecision::deny("BASE_NOT_ALLOWED", "Target base branch is not in allowlist");
    }

    if let Some(pattern) = &config.head_branch_regex {
        let matched = Regex::new(pattern)
            .map(|re| re.is_match(request.head_branch))
            .unwrap_or(false);
        if !matched {
            return PolicyDecision::deny(
                "HEAD_BRANCH_INVALID",
                "Head branch does not match the required naming pattern",
            );
        }
    }

    let diff_lines = request.additions.unwrap_or(0) + request.deletions.unwrap_or(0);
    let too_many_files = config
        .max_changed_files
        .zip(request.files_changed)
        .is_some_and(|(max, n)| n > max);
    let too_many_lines = config
        .max_diff_lines
        .is_some_and(|max| (request.additions.is_some() || request.deletions.is_some()) && diff_lines > max);
    if too_many_files || too_many_lines {
        return PolicyDecision::deny("DIFF_TOO_LARGE", "Change set exceeds the configured limits");
    }

    if !config.forbidden_path_patterns.is_empty() {
        if let Some(files) = request.changed_files {
            for file in files {
                if config
                    .forbidden_path_patterns
                    .iter()
                    .any(|p| allowlist_matches(p, file))
                {
                    return PolicyDecision::deny(
                        "FORBIDDEN_PATH_TOUCHED",
                        &format!("Change touches forbidden path: {file}"),
                    );
                }
            }
        }
    }

    if !config.required_checks.is_empty() {
        if let Some(passed) = request.passed_checks {
            let missing = config
                .required_checks
                .iter()
                .any(|check| !passed.iter().any(|p| p == check));
            if missing {
                return PolicyDecision::deny(
                    "REQUIRED_CHECKS_FAILED",
                    "Not all required checks have passed",
                );
            }
        }
    }

    PolicyDecision::allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PrPolicyConfig {
        PrPolicyConfig {
            write_enabled: true,
            ..Default::default()
        }
    }

    fn base_request<'a>() -> PolicyRequest<'a> {
        PolicyRequest {
            repo_full_name: "octo/repo",
            base_branch: "main",
            head_branch: "forge-123",
            ..Default::default()
        }
    }

    #[test]
    fn denies_when_writes_disabled() {
        let config = PrPolicyConfig::default();
        let decision = evaluate_create_pr_policy(&config, &base_request());
        assert!(!decision.allowed);
        assert_eq!(decision.code, "PR_WRITE_DISABLED");
    }

    #[test]
    fn denies_repo_not_allowed() {
        let config = PrPolicyConfig {
            repo_allowlist: vec!["octo/allowed".into()],
            ..base_config()
        };
        let decision = evaluate_create_pr_policy(&config, &base_request());
        assert_eq!(decision.code, "REPO_NOT_ALLOWED");
    }

    #[test]
    fn denies_base_not_allowed() {
        let config = PrPolicyConfig {
            repo_allowlist: vec!["octo/repo".into()],
            base_branch_allowlist: vec!["release/*".into()],
            ..base_config()
        };
        let decision = evaluate_create_pr_policy(&config, &base_request());
        assert_eq!(decision.code, "BASE_NOT_ALLOWED");
    }

    #[test]
    fn base_allowlist_accepts_glob() {
        let config = PrPolicyConfig {
            base_branch_allowlist: vec!["release/*".into()],
            ..base_config()
        };
        let request = PolicyRequest {
            base_branch: "release/1.2",
            ..base_request()
        };
        assert!(evaluate_create_pr_policy(&config, &request).allowed);
    }

    #[test]
    fn denies_head_branch_invalid() {
        let config = PrPolicyConfig {
            head_branch_regex: Some(r"^forge-[0-9]+$".into()),
            ..base_config()
        };
        let request = PolicyRequest {
            head_branch: "forge-abc",
            ..base_request()
        };
        let decision = evaluate_create_pr_policy(&config, &request);
        assert_eq!(decision.code, "HEAD_BRANCH_INVALID");
    }

    #[test]
    fn denies_diff_too_large() {
        let config = PrPolicyConfig {
            max_changed_files: Some(3),
            ..base_config()
        };
        let request = PolicyRequest {
            files_changed: Some(10),
            additions: Some(1),
            deletions: Some(1),
            ..base_request()
        };
        let decision = evaluate_create_pr_policy(&config, &request);
        assert_eq!(decision.code, "DIFF_TOO_LARGE");
    }

    #[test]
    fn denies_forbidden_path_touched() {
        let config = PrPolicyConfig {
            forbidden_path_patterns: vec![".env".into(), "**/*.pem".into(), "secrets/**".into()],
            ..base_config()
        };
        let files = vec!["src/app.rs".to_string(), ".env".to_string()];
        let request = PolicyRequest {
            changed_files: Some(&files),
            ..base_request()
        };
        let decision = evaluate_create_pr_policy(&config, &request);
        assert_eq!(decision.code, "FORBIDDEN_PATH_TOUCHED");
    }

    #[test]
    fn forbidden_path_glob_crosses_directories() {
        let config = PrPolicyConfig {
            forbidden_path_patterns: vec!["**/*.pem".into()],
            ..base_config()
        };
        let files = vec!["certs/deep/server.pem".to_string()];
        let request = PolicyRequest {
            changed_files: Some(&files),
            ..base_request()
        };
        assert_eq!(
            evaluate_create_pr_policy(&config, &request).code,
            "FORBIDDEN_PATH_TOUCHED"
        );
    }

    #[test]
    fn denies_required_checks_failed() {
        let config = PrPolicyConfig {
            required_checks: vec!["ci/unit".into(), "ci/lint".into()],
            ..base_config()
        };
        let passed = vec!["ci/unit".to_string()];
        let request = PolicyRequest {
            passed_checks: Some(&passed),
            ..base_request()
        };
        let decision = evaluate_create_pr_policy(&config, &request);
        assert_eq!(decision.code, "REQUIRED_CHECKS_FAILED");
    }

    #[test]
    fn allows_when_all_rules_pass() {
        let config = PrPolicyConfig {
            repo_allowlist: vec!["octo/repo".into()],
            base_branch_allowlist: vec!["main".into(), "release/*".into()],
            head_branch_regex: Some(r"^forge-[0-9]+$".into()),
            max_changed_files: Some(10),
            max_diff_lines: Some(20),
            forbidden_path_patterns: vec![".env".into()],
            required_checks: vec!["ci/unit".into()],
            ..base_config()
        };
        let files = vec!["src/app.rs".to_string()];
        let passed = vec!["ci/unit".to_string()];
        let request = PolicyRequest {
            changed_files: Some(&files),
            files_changed: Some(2),
            additions: Some(5),
            deletions: Some(5),
            passed_checks: Some(&passed),
            ..base_request()
        };
        let decision = evaluate_create_pr_policy(&config, &request);
        assert!(decision.allowed);
        assert_eq!(decision.code, "ALLOWED");
    }

    #[test]
    fn glob_star_does_not_cross_separators() {
        assert!(glob_match("release/*", "release/1.2"));
        assert!(!glob_match("release/*", "release/1/2"));
        assert!(glob_match("secrets/**", "secrets/prod/key"));
    }
}
