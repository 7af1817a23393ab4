//! Ordered replacement rules.

use {
    regex::{NoExpand, Regex, RegexBuilder},
    tgrelay_config::ReplacementRule,
    tracing::warn,
};

enum CompiledRule {
    /// Case-sensitive literal substring replacement.
    Exact { find: String, replace: String },
    /// Case-insensitive literal, or a user pattern.
    Pattern {
        re: Regex,
        replace: String,
        expand: bool,
    },
}

/// Result of running text through a [`RulePipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOutcome {
    pub text: String,
    /// Whether any rule changed the text. Formatting entities only stay
    /// valid for unmutated text.
    pub mutated: bool,
}

/// Rules compiled once and applied in order.
pub struct RulePipeline {
    rules: Vec<CompiledRule>,
}

impl RulePipeline {
    /// Compile `rules`. Empty `find` values are dropped; an invalid regex is
    /// logged and skipped so the remaining rules still apply.
    #[must_use]
    pub fn new(rules: &[ReplacementRule]) -> Self {
        let rules = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.find.is_empty())
            .filter_map(|(index, rule)| match compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!(index, pattern = %rule.find, error = %e, "skipping invalid regex rule");
                    None
                },
            })
            .collect();
        Self { rules }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn apply(&self, text: &str) -> TextOutcome {
        let mut out = text.to_string();
        for rule in &self.rules {
            out = match rule {
                CompiledRule::Exact { find, replace } => out.replace(find.as_str(), replace),
                CompiledRule::Pattern {
                    re,
                    replace,
                    expand: true,
                } => re.replace_all(&out, replace.as_str()).into_owned(),
                CompiledRule::Pattern { re, replace, .. } => {
                    re.replace_all(&out, NoExpand(replace)).into_owned()
                },
            };
        }
        let mutated = out != text;
        TextOutcome { text: out, mutated }
    }
}

fn compile(rule: &ReplacementRule) -> Result<CompiledRule, regex::Error> {
    if rule.is_regex {
        let re = RegexBuilder::new(&rule.find)
            .case_insensitive(!rule.case_sensitive)
            .build()?;
        return Ok(CompiledRule::Pattern {
            re,
            replace: rule.replace.clone(),
            expand: true,
        });
    }
    if rule.case_sensitive {
        return Ok(CompiledRule::Exact {
            find: rule.find.clone(),
            replace: rule.replace.clone(),
        });
    }
    let re = RegexBuilder::new(&regex::escape(&rule.find))
        .case_insensitive(true)
        .build()?;
    Ok(CompiledRule::Pattern {
        re,
        replace: rule.replace.clone(),
        expand: false,
    })
}

/// One-shot convenience over [`RulePipeline`].
#[must_use]
pub fn process_text(text: &str, rules: &[ReplacementRule]) -> String {
    if text.is_empty() {
        return String::new();
    }
    RulePipeline::new(rules).apply(text).text
}
