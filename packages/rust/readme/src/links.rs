//! Markdown link scanning.

use std::sync::LazyLock;

use regex::Regex;

/// Link schemes that point outside the local filesystem.
const EXTERNAL_SCHEMES: [&str; 4] = ["https://", "http://", "s3://", "gs://"];

/// True if `target` references a remote resource.
pub(crate) fn is_external(target: &str) -> bool {
    let lower = target.to_lowercase();
    EXTERNAL_SCHEMES.iter().any(|s| lower.contains(s))
}

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\([^\)]*\)").expect("valid regex"));

/// Byte offset where the target starts inside a matched link, and the target.
///
/// Only the first space-separated token inside the parentheses is the target,
/// so hover titles (`[a](b.png "title")`) are ignored.
fn split_link(link: &str) -> Option<(usize, &str)> {
    // Start after the first "](" so brackets like `[()]` are skipped.
    let start = link.find("](")? + 2;
    let inner = &link[start..link.len() - 1];
    inner.split(' ').next().map(|target| (start, target))
}

/// Extract the target of every `[text](target)` link, in order.
pub(crate) fn link_targets(md: &str) -> Vec<String> {
    LINK_RE
        .find_iter(md)
        .filter_map(|m| split_link(m.as_str()).map(|(_, target)| target.to_string()))
        .collect()
}

/// Rewrite link targets in place. Link text, titles and the surrounding
/// document are left untouched; targets `rewrite` returns `None` for are kept.
pub(crate) fn rewrite_targets(md: &str, rewrite: impl Fn(&str) -> Option<String>) -> String {
    LINK_RE
        .replace_all(md, |caps: &regex::Captures<'_>| {
            let link = &caps[0];
            match split_link(link) {
                Some((start, target)) => match rewrite(target) {
                    Some(new_target) => format!(
                        "{}{new_target}{}",
                        &link[..start],
                        &link[start + target.len()..]
                    ),
                    None => link.to_string(),
                },
                None => link.to_string(),
            }
        })
        .into_owned()
}
