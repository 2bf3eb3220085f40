// Rate rules and their resolution

use std::collections::HashMap;

/// Admission limits for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    /// Maximum jobs running at once
    pub max_concurrent: usize,
    /// Minimum gap between processing starts
    pub delay_ms: i64,
}

impl RateRule {
    pub const fn new(max_concurrent: usize, delay_ms: i64) -> Self {
        Self {
            max_concurrent,
            delay_ms,
        }
    }
}

impl Default for RateRule {
    fn default() -> Self {
        Self::new(2, 1000)
    }
}

#[derive(Debug, Clone)]
struct RuleEntry {
    base: RateRule,
    handlers: HashMap<String, RateRule>,
}

impl RuleEntry {
    fn new(base: RateRule) -> Self {
        Self {
            base,
            handlers: HashMap::new(),
        }
    }

    fn pick(&self, handler: Option<&str>) -> RateRule {
        handler
            .and_then(|h| self.handlers.get(h))
            .copied()
            .unwrap_or(self.base)
    }
}

/// Rule table. Resolution order: exact key, then the longest matching
/// `*.suffix` wildcard, then the default; each level may specialise by handler.
#[derive(Debug, Clone)]
pub struct RateRules {
    default: RuleEntry,
    exact: HashMap<String, RuleEntry>,
    wildcard: Vec<(String, RuleEntry)>,
    global_delay_ms: i64,
}

impl Default for RateRules {
    fn default() -> Self {
        Self::new(RateRule::default())
    }
}

impl RateRules {
    pub fn new(default: RateRule) -> Self {
        Self {
            default: RuleEntry::new(default),
            exact: HashMap::new(),
            wildcard: Vec::new(),
            global_delay_ms: 0,
        }
    }

    /// Minimum gap between processing starts across all partitions
    pub fn global_delay_ms(mut self, delay_ms: i64) -> Self {
        self.global_delay_ms = delay_ms;
        self
    }

    pub fn global_delay(&self) -> i64 {
        self.global_delay_ms
    }

    /// Add a rule for `pattern`: `"*"` is the default, `"*.example.com"` a
    /// suffix wildcard, anything else an exact key.
    pub fn rule(mut self, pattern: &str, rule: RateRule) -> Self {
        self.entry_mut(pattern).base = rule;
        self
    }

    /// Specialise `pattern`'s rule for one handler
    pub fn handler_rule(mut self, pattern: &str, handler: &str, rule: RateRule) -> Self {
        self.entry_mut(pattern)
            .handlers
            .insert(handler.to_string(), rule);
        self
    }

    fn entry_mut(&mut self, pattern: &str) -> &mut RuleEntry {
        let pattern = pattern.to_ascii_lowercase();
        if pattern == "*" {
            return &mut self.default;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            let idx = match self.wildcard.iter().position(|(s, _)| s == suffix) {
                Some(idx) => idx,
                None => {
                    self.wildcard
                        .push((suffix.to_string(), RuleEntry::new(self.default.base)));
                    // Longest suffix first so the most specific wildcard wins
                    self.wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                    self.wildcard
                        .iter()
                        .position(|(s, _)| s == suffix)
                        .unwrap_or(0)
                }
            };
            return &mut self.wildcard[idx].1;
        }
        let base = self.default.base;
        self.exact
            .entry(pattern)
            .or_insert_with(|| RuleEntry::new(base))
    }

    pub fn resolve(&self, key: &str, handler: Option<&str>) -> RateRule {
        let key = key.to_ascii_lowercase();
        if let Some(entry) = self.exact.get(&key) {
            return entry.pick(handler);
        }
        for (suffix, entry) in &self.wildcard {
            let matches = key == *suffix
                || (key.len() > suffix.len()
                    && key.ends_with(suffix.as_str())
                    && key.as_bytes()[key.len() - suffix.len() - 1] == b'.');
            if matches {
                return entry.pick(handler);
            }
        }
        self.default.pick(handler)
    }
}
