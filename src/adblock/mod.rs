pub mod matcher;
pub mod rules;

pub use matcher::{MatchRequest, RuleMatcher};

use arc_swap::ArcSwapOption;
use rules::{parse_line, ParsedLine, Rule};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared ad-block rule set: a matcher slot populated by a background
/// loader, and a gate that holds requests until loading completes.
///
/// Sources are fetched concurrently at startup. A source that cannot be
/// fetched or parsed aborts the process — a vanished filter list is a
/// configuration error, not a condition to silently degrade from.
pub struct RuleSet {
    matcher: ArcSwapOption<RuleMatcher>,
    loaded: watch::Receiver<bool>,
}

impl RuleSet {
    /// Create the rule set and spawn the loader task for `sources`.
    pub fn spawn_load(sources: Vec<String>) -> Arc<Self> {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let rule_set = Arc::new(Self {
            matcher: ArcSwapOption::const_empty(),
            loaded: loaded_rx,
        });

        let slot = rule_set.clone();
        tokio::spawn(async move {
            let rules = fetch_all(&sources).await;
            let matcher = RuleMatcher::new(rules);
            info!(rules = matcher.rule_count(), "adblock rules loaded");
            slot.matcher.store(Some(Arc::new(matcher)));
            loaded_tx.send_replace(true);
        });

        rule_set
    }

    /// Wait until the loader has installed the matcher.
    pub async fn wait_loaded(&self) {
        let mut loaded = self.loaded.clone();
        // A closed channel can only mean the loader already published.
        let _ = loaded.wait_for(|loaded| *loaded).await;
    }

    pub fn matcher(&self) -> Option<Arc<RuleMatcher>> {
        self.matcher.load_full()
    }
}

/// Fetch and parse every source concurrently; exit on the first failure.
async fn fetch_all(sources: &[String]) -> Vec<Rule> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .expect("reqwest client");

    let fetches = sources.iter().map(|source| fetch_source(&client, source));
    let results = futures_util::future::join_all(fetches).await;

    let mut rules = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(parsed) => rules.extend(parsed),
            Err(e) => {
                error!(source = %source, error = %e, "cannot load adblock list");
                std::process::exit(1);
            }
        }
    }
    rules
}

async fn fetch_source(client: &reqwest::Client, source: &str) -> anyhow::Result<Vec<Rule>> {
    debug!(source = %source, "fetch adblock list");

    let body = if source.starts_with("http://") || source.starts_with("https://") {
        client
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?
    } else {
        tokio::fs::read_to_string(source).await?
    };

    let mut rules = Vec::new();
    for line in body.lines() {
        match parse_line(line) {
            ParsedLine::Rule(rule) => rules.push(rule),
            ParsedLine::Unsupported(reason) => {
                debug!(rule = %line, reason = %reason, "skip unsupported adblock rule");
            }
            ParsedLine::Ignored => {}
        }
    }

    debug!(source = %source, rules = rules.len(), "parsed adblock list");
    Ok(rules)
}
