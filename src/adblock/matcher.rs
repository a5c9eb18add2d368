use crate::adblock::rules::{Rule, RuleOptions};
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Inputs for one match attempt, extracted from the request by the ad-block
/// layer.
#[derive(Debug, Default, Clone)]
pub struct MatchRequest {
    pub url: String,
    /// Request host, from the Host header.
    pub domain: String,
    pub content_type: String,
    /// Origin domain, derived from the Referer.
    pub origin_domain: String,
}

/// Immutable rule matcher built once after all sources are loaded.
pub struct RuleMatcher {
    block: Vec<CompiledRule>,
    exceptions: Vec<CompiledRule>,
}

struct CompiledRule {
    regex: Regex,
    options: RuleOptions,
}

impl RuleMatcher {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut block = Vec::new();
        let mut exceptions = Vec::new();

        for rule in rules {
            let expr = pattern_to_regex(&rule.pattern);
            let regex = match RegexBuilder::new(&expr).case_insensitive(true).build() {
                Ok(regex) => regex,
                Err(e) => {
                    warn!(rule = %rule.raw, error = %e, "cannot compile adblock rule");
                    continue;
                }
            };
            let compiled = CompiledRule {
                regex,
                options: rule.options,
            };
            if rule.exception {
                exceptions.push(compiled);
            } else {
                block.push(compiled);
            }
        }

        Self { block, exceptions }
    }

    pub fn rule_count(&self) -> usize {
        self.block.len() + self.exceptions.len()
    }

    /// Whether the request should be blocked. Exceptions always win.
    pub fn matches(&self, request: &MatchRequest) -> bool {
        if self.exceptions.iter().any(|r| rule_matches(r, request)) {
            return false;
        }
        self.block.iter().any(|r| rule_matches(r, request))
    }
}

fn rule_matches(rule: &CompiledRule, request: &MatchRequest) -> bool {
    if !rule.regex.is_match(&request.url) {
        return false;
    }

    let domain = request.domain.to_ascii_lowercase();
    let options = &rule.options;

    if !options.include_domains.is_empty()
        && !options.include_domains.iter().any(|d| domain_of(&domain, d))
    {
        return false;
    }
    if options.exclude_domains.iter().any(|d| domain_of(&domain, d)) {
        return false;
    }

    if let Some(wants_third_party) = options.third_party {
        let origin = request.origin_domain.to_ascii_lowercase();
        let is_third_party = !origin.is_empty() && !same_site(&domain, &origin);
        if is_third_party != wants_third_party {
            return false;
        }
    }

    if !options.resource_types.is_empty() {
        if request.content_type.is_empty() {
            return false;
        }
        if !options
            .resource_types
            .iter()
            .any(|t| t.matches_content_type(&request.content_type))
        {
            return false;
        }
    }

    true
}

/// `host` equals `domain` or is a subdomain of it.
fn domain_of(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

fn same_site(a: &str, b: &str) -> bool {
    a == b || domain_of(a, b) || domain_of(b, a)
}

/// Translate an ABP pattern into a regular expression.
///
/// `||` anchors at a hostname boundary, `|` at either end of the URL, `*` is
/// a wildcard and `^` a separator character (anything that is not a letter,
/// digit or one of `_ . % -`, or the end of the URL).
fn pattern_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;

    if let Some(stripped) = rest.strip_prefix("||") {
        out.push_str(r"^[a-z][a-z0-9+.-]*://(?:[^/?#]*\.)?");
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('|') {
        out.push('^');
        rest = stripped;
    }

    let end_anchor = match rest.strip_suffix('|') {
        Some(stripped) => {
            rest = stripped;
            true
        }
        None => false,
    };

    let mut chunk = [0u8; 4];
    for ch in rest.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '^' => out.push_str(r"(?:[^a-zA-Z0-9_.%-]|$)"),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut chunk))),
        }
    }

    if end_anchor {
        out.push('$');
    }
    out
}
