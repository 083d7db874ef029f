//! Heuristic pre-filter run before any model call.
//!
//! A post survives when it matches no spam pattern and mentions at least one
//! technology keyword.

use std::sync::LazyLock;

use refinery_core::PostRecord;
use regex::RegexSet;

static NOISE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\bgiveaway\b",
        r"(?i)\bairdrop\b",
        r"(?i)\bfollow\b.*\b(?:retweet|repost|rt)\b",
        r"(?i)\bwin\s+\$?\d",
        r"(?i)\bdm\s+me\b",
        r"(?i)\bcheck\s+my\s+bio\b",
        r"(?i)\bfree\s+nft\b",
        r"🚀{3,}",
    ])
    .expect("valid noise patterns")
});

/// Lowercase substrings that mark a post as technology-related.
pub(crate) const SIGNAL_KEYWORDS: &[&str] = &[
    // change and adoption
    "migration",
    "migrating",
    "switched",
    "switching",
    "deprecated",
    "deprecating",
    "released",
    "launching",
    "shipped",
    "alternative",
    "replaced",
    "replacing",
    // pain
    "bug",
    "broken",
    "issue",
    "error",
    "crash",
    "friction",
    "pain point",
    "workaround",
    // performance
    "benchmark",
    "performance",
    "faster",
    "slower",
    // ecosystem
    "framework",
    "library",
    "sdk",
    "api",
    "typescript",
    "rust",
    "go",
    "python",
    "javascript",
    "react",
    "nextjs",
    "svelte",
    "vue",
    "angular",
    "docker",
    "kubernetes",
    "wasm",
    "edge",
];

#[must_use]
pub fn is_noise(content: &str) -> bool {
    NOISE_PATTERNS.is_match(content)
}

#[must_use]
pub fn has_signal(content: &str) -> bool {
    let lower = content.to_lowercase();
    SIGNAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Keeps posts that are not noise and carry a technology signal, in input
/// order.
pub fn filter_posts<'a, I>(posts: I) -> Vec<&'a PostRecord>
where
    I: IntoIterator<Item = &'a PostRecord>,
{
    posts
        .into_iter()
        .filter(|p| !is_noise(&p.content) && has_signal(&p.content))
        .collect()
}
