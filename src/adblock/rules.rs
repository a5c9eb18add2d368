//! Adblock Plus filter syntax, reduced to the subset the matcher supports.
//!
//! Supported: blocking and exception (`@@`) URL patterns with `|` / `||`
//! anchors, `*` wildcards and `^` separators, plus the `domain=`,
//! `third-party` and resource-type options. Everything else (element hiding,
//! regex filters, `popup`, `csp=`, ...) is reported as unsupported and the
//! rule is discarded by the loader.

/// Result of parsing one line of a filter list.
pub enum ParsedLine {
    Rule(Rule),
    /// Comments, section headers, blank lines.
    Ignored,
    /// Syntax the matcher does not implement; carries the reason.
    Unsupported(&'static str),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub raw: String,
    pub exception: bool,
    pub pattern: String,
    pub options: RuleOptions,
}

#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    /// `Some(true)` = third-party only, `Some(false)` = first-party only.
    pub third_party: Option<bool>,
    /// Resource types the rule is scoped to. Empty means any.
    pub resource_types: Vec<ResourceType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Script,
    Image,
    Stylesheet,
    Media,
    Font,
    Document,
}

impl ResourceType {
    /// Whether a request `Content-Type` value belongs to this resource type.
    pub fn matches_content_type(self, content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        match self {
            ResourceType::Script => ct.contains("javascript") || ct.contains("ecmascript"),
            ResourceType::Image => ct.starts_with("image/"),
            ResourceType::Stylesheet => ct.contains("css"),
            ResourceType::Media => ct.starts_with("audio/") || ct.starts_with("video/"),
            ResourceType::Font => ct.contains("font"),
            ResourceType::Document => ct.starts_with("text/html"),
        }
    }
}

pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return ParsedLine::Ignored;
    }
    if line.contains("##") || line.contains("#@#") || line.contains("#?#") {
        return ParsedLine::Unsupported("element hiding");
    }

    let (exception, rest) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    if rest.len() >= 2 && rest.starts_with('/') && rest.ends_with('/') {
        return ParsedLine::Unsupported("regex filter");
    }

    let (pattern, options) = match rest.rsplit_once('$') {
        Some((pattern, raw_options)) => match parse_options(raw_options) {
            Ok(options) => (pattern, options),
            Err(reason) => return ParsedLine::Unsupported(reason),
        },
        None => (rest, RuleOptions::default()),
    };

    if pattern.is_empty() {
        return ParsedLine::Ignored;
    }

    ParsedLine::Rule(Rule {
        raw: line.to_string(),
        exception,
        pattern: pattern.to_string(),
        options,
    })
}

fn parse_options(raw: &str) -> Result<RuleOptions, &'static str> {
    let mut options = RuleOptions::default();

    for token in raw.split(',') {
        let token = token.trim();
        match token {
            "third-party" => options.third_party = Some(true),
            "~third-party" => options.third_party = Some(false),
            "script" => options.resource_types.push(ResourceType::Script),
            "image" => options.resource_types.push(ResourceType::Image),
            "stylesheet" => options.resource_types.push(ResourceType::Stylesheet),
            "media" => options.resource_types.push(ResourceType::Media),
            "font" => options.resource_types.push(ResourceType::Font),
            "document" => options.resource_types.push(ResourceType::Document),
            _ => {
                if let Some(domains) = token.strip_prefix("domain=") {
                    for domain in domains.split('|') {
                        match domain.strip_prefix('~') {
                            Some(excluded) => {
                                options.exclude_domains.push(excluded.to_ascii_lowercase())
                            }
                            None => options.include_domains.push(domain.to_ascii_lowercase()),
                        }
                    }
                } else {
                    return Err("unsupported option");
                }
            }
        }
    }

    Ok(options)
}
