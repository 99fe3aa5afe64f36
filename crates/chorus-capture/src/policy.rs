//! Per-target extraction policies, kept as data.
//!
//! Each target gets an ordered list of reply selectors (most specific known
//! structure first) and a disjunction of weak in-progress signals. Adding a
//! target is a table change, not new branching code. Selectors that fail to
//! parse are skipped with a warning so a bad table entry degrades to the
//! next fallback instead of breaking capture.

use chorus_core::Target;
use scraper::Selector;
use tracing::warn;

/// Minimum reply length used when the caller does not override it.
const DEFAULT_MIN_LEN: usize = 20;

/// In-progress signals shared by every target. No single signal is
/// guaranteed to exist, so any match counts.
const COMMON_BUSY: &[&str] = &[
    r#"[class*="loading"]"#,
    r#"[class*="streaming"]"#,
    r#"button[aria-label*="Stop"]"#,
    r#"button[aria-label*="停止"]"#,
];

struct SiteRules {
    target: Target,
    reply: &'static [&'static str],
    busy_extra: &'static [&'static str],
}

const SITE_RULES: &[SiteRules] = &[
    SiteRules {
        target: Target::Claude,
        reply: &[
            r#"[data-testid="assistant-message"]"#,
            r#".font-claude-message"#,
            r#"[class*="assistant"] [class*="markdown"]"#,
        ],
        busy_extra: &[r#"[data-is-streaming="true"]"#],
    },
    SiteRules {
        target: Target::ChatGpt,
        reply: &[
            r#"[data-message-author-role="assistant"] .markdown"#,
            r#"[data-message-author-role="assistant"]"#,
            r#".markdown.prose"#,
        ],
        busy_extra: &[r#".result-streaming"#],
    },
    SiteRules {
        target: Target::Gemini,
        reply: &[
            r#"message-content .markdown"#,
            r#"model-response"#,
            r#"[class*="response-container"] [class*="markdown"]"#,
        ],
        busy_extra: &[],
    },
    SiteRules {
        target: Target::DeepSeek,
        reply: &[
            r#".message.assistant .message-content"#,
            r#"[class*="assistant"] [class*="markdown"]"#,
            r#"[class*="ds-markdown"]"#,
            r#".markdown-body"#,
        ],
        busy_extra: &[],
    },
    SiteRules {
        target: Target::Qwen,
        reply: &[
            r#"[class*="assistant"] [class*="markdown"]"#,
            r#"[class*="message-content"]"#,
            r#".markdown-body"#,
        ],
        busy_extra: &[r#"[class*="generating"]"#],
    },
    SiteRules {
        target: Target::Kimi,
        reply: &[
            r#"[class*="segment-assistant"] [class*="markdown"]"#,
            r#"[class*="assistant"] [class*="markdown"]"#,
            r#".markdown-body"#,
        ],
        busy_extra: &[],
    },
    SiteRules {
        target: Target::Doubao,
        reply: &[
            r#"[data-testid="message_text_content"]"#,
            r#"[class*="assistant"] [class*="markdown"]"#,
            r#"[class*="message-content"]"#,
        ],
        busy_extra: &[r#"[class*="generating"]"#],
    },
    SiteRules {
        target: Target::ChatGlm,
        reply: &[
            r#".answer [class*="markdown"]"#,
            r#"[class*="assistant"]"#,
            r#".markdown-body"#,
        ],
        busy_extra: &[],
    },
];

/// Compiled extraction policy for one target.
pub struct ExtractionPolicy {
    reply: Vec<Selector>,
    busy: Vec<Selector>,
    pub min_len: usize,
}

impl ExtractionPolicy {
    /// Compile a policy from selector lists. Order is priority order.
    pub fn new(reply: &[&str], busy: &[&str], min_len: usize) -> Self {
        Self {
            reply: compile(reply),
            busy: compile(busy),
            min_len,
        }
    }

    /// Policy for a registered target, from the static tables.
    pub fn for_target(target: Target) -> Self {
        let rules = SITE_RULES
            .iter()
            .find(|r| r.target == target)
            .unwrap_or(&SITE_RULES[0]);
        let busy: Vec<&str> = COMMON_BUSY
            .iter()
            .chain(rules.busy_extra.iter())
            .copied()
            .collect();
        Self::new(rules.reply, &busy, DEFAULT_MIN_LEN)
    }

    pub fn with_min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len;
        self
    }

    pub(crate) fn reply_selectors(&self) -> &[Selector] {
        &self.reply
    }

    pub(crate) fn busy_selectors(&self) -> &[Selector] {
        &self.busy
    }
}

fn compile(list: &[&str]) -> Vec<Selector> {
    list.iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(e) => {
                warn!("Skipping unparsable selector {:?}: {:?}", s, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_target_has_rules() {
        for target in Target::all() {
            let policy = ExtractionPolicy::for_target(*target);
            assert!(
                !policy.reply_selectors().is_empty(),
                "no reply selectors for {}",
                target
            );
            assert!(!policy.busy_selectors().is_empty());
        }
    }

    #[test]
    fn test_all_table_selectors_compile() {
        for rules in SITE_RULES {
            assert_eq!(compile(rules.reply).len(), rules.reply.len());
            assert_eq!(compile(rules.busy_extra).len(), rules.busy_extra.len());
        }
        assert_eq!(compile(COMMON_BUSY).len(), COMMON_BUSY.len());
    }

    #[test]
    fn test_bad_selector_is_skipped() {
        let policy = ExtractionPolicy::new(&["p", "[[["], &[], 5);
        assert_eq!(policy.reply_selectors().len(), 1);
    }
}
