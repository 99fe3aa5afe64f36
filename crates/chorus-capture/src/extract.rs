//! Best-effort reply extraction over a document snapshot.
//!
//! Selectors are tried in priority order; the first one producing a
//! qualifying candidate wins, and within a selector the most recently
//! appended match is preferred. Candidates inside an editable input region
//! are always excluded. When no known structure matches, fall back to the
//! largest qualifying text block in the main content area. Occasionally
//! picking the wrong block is the accepted cost of surviving markup churn.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::policy::ExtractionPolicy;

static MAIN_BLOCKS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("main p, main pre, main li, main blockquote, article p")
        .expect("static selector")
});

static ANY_BLOCKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p, pre, li, blockquote").expect("static selector"));

/// Extract the current best-effort reply text from a snapshot.
pub fn latest_reply(html: &str, policy: &ExtractionPolicy) -> Option<String> {
    let doc = Html::parse_document(html);

    for selector in policy.reply_selectors() {
        let mut best: Option<String> = None;
        for el in doc.select(selector) {
            if in_editable_region(&el) {
                continue;
            }
            let text = block_text(&el);
            if text.chars().count() >= policy.min_len {
                // Later matches are more recently appended.
                best = Some(text);
            }
        }
        if best.is_some() {
            return best;
        }
    }

    largest_block(&doc, policy.min_len)
}

/// Whether the page is currently signaling active generation.
pub fn is_generating(html: &str, policy: &ExtractionPolicy) -> bool {
    let doc = Html::parse_document(html);
    policy
        .busy_selectors()
        .iter()
        .any(|sel| doc.select(sel).next().is_some())
}

/// Largest qualifying text block in the main content area, ties going to
/// the most recently appended.
fn largest_block(doc: &Html, min_len: usize) -> Option<String> {
    let mut candidates = collect_blocks(doc, &MAIN_BLOCKS, min_len);
    if candidates.is_none() {
        candidates = collect_blocks(doc, &ANY_BLOCKS, min_len);
    }
    candidates
}

fn collect_blocks(doc: &Html, selector: &Selector, min_len: usize) -> Option<String> {
    let mut best: Option<String> = None;
    for el in doc.select(selector) {
        if in_editable_region(&el) {
            continue;
        }
        let text = block_text(&el);
        let len = text.chars().count();
        if len < min_len {
            continue;
        }
        if best.as_ref().map_or(true, |b| len >= b.chars().count()) {
            best = Some(text);
        }
    }
    best
}

/// Visible text of an element, whitespace-normalized for stable comparison.
fn block_text(el: &ElementRef) -> String {
    el.text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the element is, or sits inside, an editable input region.
fn in_editable_region(el: &ElementRef) -> bool {
    if is_editable_element(el.value()) {
        return true;
    }
    el.ancestors().any(|node| {
        node.value()
            .as_element()
            .map_or(false, is_editable_element)
    })
}

fn is_editable_element(el: &scraper::node::Element) -> bool {
    matches!(el.name(), "textarea" | "input" | "select")
        || matches!(el.attr("contenteditable"), Some("true") | Some(""))
        || el.attr("role") == Some("textbox")
}
