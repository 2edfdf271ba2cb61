/// Maximum number of characters in a result snippet.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 200;

/// Delimiter placed on both sides of a highlighted match.
pub const HIGHLIGHT_MARKER: &str = "**";

/// Appended or prepended when the excerpt is cut.
pub const ELLIPSIS: char = '…';

const MARKER_COST: usize = 2 * HIGHLIGHT_MARKER.len();

/// Build a bounded excerpt of `content` around the densest cluster of
/// `terms`, with matches wrapped in [`HIGHLIGHT_MARKER`].
///
/// Whitespace runs are collapsed to single spaces. The returned string is
/// at most `max_len` characters including markers and ellipses, and a
/// highlighted match is never split. When no term occurs in `content` the
/// leading characters are returned instead; the result is empty only when
/// `content` has no visible characters or `max_len` is zero.
pub fn generate(content: &str, terms: &[&str], max_len: usize) -> String {
    let text = collapse_whitespace(content);
    if text.is_empty() || max_len == 0 {
        return String::new();
    }

    let spans = find_spans(&text, terms);
    match best_cluster(&text, &spans, max_len) {
        Some((first, last)) => render(&text, &spans, first, last, max_len),
        None => head(&text, max_len),
    }
}

fn collapse_whitespace(content: &str) -> Vec<char> {
    let mut out = Vec::with_capacity(content.len());
    let mut pending_space = false;
    for c in content.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Case folding that keeps a 1:1 mapping between input and folded chars.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Sorted, non-overlapping `[start, end)` char ranges of term occurrences
/// that begin at a word boundary.
fn find_spans(text: &[char], terms: &[&str]) -> Vec<(usize, usize)> {
    let folded: Vec<char> = text.iter().map(|&c| fold(c)).collect();
    let mut spans = Vec::new();

    for term in terms {
        let needle: Vec<char> = term.trim().chars().map(fold).collect();
        if needle.is_empty() || needle.len() > folded.len() {
            continue;
        }
        let mut i = 0;
        while i + needle.len() <= folded.len() {
            let at_word_start = i == 0 || !folded[i - 1].is_alphanumeric();
            if at_word_start && folded[i..i + needle.len()] == needle[..] {
                spans.push((i, i + needle.len()));
                i += needle.len();
            } else {
                i += 1;
            }
        }
    }

    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Rendered length of the window `[a, b)` holding `marked` highlights.
fn cost(len: usize, a: usize, b: usize, marked: usize) -> usize {
    (b - a)
        + MARKER_COST * marked
        + usize::from(a > 0)
        + usize::from(b < len)
}

/// Pick the run of consecutive spans with the most members that still fits
/// in `max_len`; the earliest run wins ties.
fn best_cluster(
    text: &[char],
    spans: &[(usize, usize)],
    max_len: usize,
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for first in 0..spans.len() {
        let mut last = None;
        for candidate in first..spans.len() {
            let marked = candidate - first + 1;
            let a = spans[first].0;
            let b = spans[candidate].1;
            if cost(text.len(), a, b, marked) > max_len {
                break;
            }
            last = Some(candidate);
        }
        if let Some(last) = last {
            let better = best.is_none_or(|(bf, bl)| last - first > bl - bf);
            if better {
                best = Some((first, last));
            }
        }
    }
    best
}

fn render(
    text: &[char],
    spans: &[(usize, usize)],
    first: usize,
    last: usize,
    max_len: usize,
) -> String {
    let len = text.len();
    let (mut a, mut b) = (spans[first].0, spans[last].1);
    let mut marked = last - first + 1;
    // Spans before `left` and from `right` on lie outside the window.
    let (mut left, mut right) = (first, last + 1);

    loop {
        let mut grew = false;

        if a > 0 {
            if left > 0 && spans[left - 1].1 == a {
                let start = spans[left - 1].0;
                if cost(len, start, b, marked + 1) <= max_len {
                    a = start;
                    left -= 1;
                    marked += 1;
                    grew = true;
                }
            } else if cost(len, a - 1, b, marked) <= max_len {
                a -= 1;
                grew = true;
            }
        }

        if b < len {
            if right < spans.len() && spans[right].0 == b {
                let end = spans[right].1;
                if cost(len, a, end, marked + 1) <= max_len {
                    b = end;
                    right += 1;
                    marked += 1;
                    grew = true;
                }
            } else if cost(len, a, b + 1, marked) <= max_len {
                b += 1;
                grew = true;
            }
        }

        if !grew {
            break;
        }
    }

    let cut_left = a > 0;
    let cut_right = b < len;
    while a < b && text[a] == ' ' {
        a += 1;
    }
    while b > a && text[b - 1] == ' ' {
        b -= 1;
    }

    let mut out = String::new();
    if cut_left {
        out.push(ELLIPSIS);
    }
    let mut span_iter = spans[left..right].iter().peekable();
    for (pos, &c) in text.iter().enumerate().take(b).skip(a) {
        if span_iter.peek().is_some_and(|s| s.0 == pos) {
            out.push_str(HIGHLIGHT_MARKER);
        }
        out.push(c);
        if let Some(&&(_, end)) = span_iter.peek()
            && end == pos + 1
        {
            out.push_str(HIGHLIGHT_MARKER);
            span_iter.next();
        }
    }
    if cut_right {
        out.push(ELLIPSIS);
    }
    out
}

/// Leading characters of `text`, cut with an ellipsis when too long.
fn head(text: &[char], max_len: usize) -> String {
    if text.len() <= max_len {
        return text.iter().collect();
    }
    if max_len == 1 {
        return text[0].to_string();
    }
    let mut out: String = text[..max_len - 1].iter().collect();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out.push(ELLIPSIS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn empty_content_gives_empty_snippet() {
        assert_eq!(generate("", &["budget"], 100), "");
        assert_eq!(generate(" \n\t ", &[], 100), "");
    }

    #[test]
    fn zero_length_gives_empty_snippet() {
        assert_eq!(generate("hello", &["hello"], 0), "");
    }

    #[test]
    fn no_terms_returns_head() {
        let content = "The quick brown fox jumps over the lazy dog";
        let snippet = generate(content, &[], 20);
        assert!(!snippet.is_empty());
        assert!(chars(&snippet) <= 20);
        assert!(snippet.starts_with("The quick"));
        assert!(snippet.ends_with(ELLIPSIS));
    }

    #[test]
    fn short_content_without_match_is_returned_whole() {
        assert_eq!(generate("hello   there", &["zzz"], 50), "hello there");
    }

    #[test]
    fn highlights_match_case_insensitively() {
        let snippet =
            generate("Please review the BUDGET today", &["budget"], 100);
        assert_eq!(snippet, "Please review the **BUDGET** today");
    }

    #[test]
    fn truncates_both_sides_around_match() {
        let filler = "lorem ipsum dolor sit amet ".repeat(20);
        let content = format!("{filler}the budget is final {filler}");
        let snippet = generate(&content, &["budget"], 60);

        assert!(chars(&snippet) <= 60);
        assert!(snippet.starts_with(ELLIPSIS));
        assert!(snippet.ends_with(ELLIPSIS));
        assert!(snippet.contains("**budget**"));
    }

    #[test]
    fn match_at_start_has_no_leading_ellipsis() {
        let content = format!("budget {}", "words ".repeat(50));
        let snippet = generate(&content, &["budget"], 40);
        assert!(snippet.starts_with("**budget**"));
        assert!(snippet.ends_with(ELLIPSIS));
        assert!(chars(&snippet) <= 40);
    }

    #[test]
    fn prefers_densest_cluster() {
        let gap = "x ".repeat(60);
        let content =
            format!("alpha {gap} alpha beta alpha {gap} end of message");
        let snippet = generate(&content, &["alpha", "beta"], 40);

        assert_eq!(snippet.matches("**").count(), 6);
        assert!(snippet.contains("**alpha** **beta** **alpha**"));
    }

    #[test]
    fn never_cuts_a_highlight() {
        let content = "aaaa supercalifragilistic bbbb";
        for max_len in 1..40 {
            let snippet = generate(content, &["supercalifragilistic"], max_len);
            assert!(chars(&snippet) <= max_len, "max_len {max_len}");
            let markers = snippet.matches(HIGHLIGHT_MARKER).count();
            assert!(markers == 0 || markers == 2, "max_len {max_len}");
        }
    }

    #[test]
    fn oversized_match_falls_back_to_head() {
        let snippet = generate("averyveryverylongword and more", &["averyveryverylongword"], 10);
        assert!(!snippet.contains(HIGHLIGHT_MARKER));
        assert!(chars(&snippet) <= 10);
        assert!(!snippet.is_empty());
    }

    #[test]
    fn matches_only_at_word_start() {
        let snippet = generate("income statement", &["com"], 100);
        assert_eq!(snippet, "income statement");

        let snippet = generate("alice@example.com wrote", &["com"], 100);
        assert_eq!(snippet, "alice@example.**com** wrote");
    }

    #[test]
    fn overlapping_terms_merge_into_one_highlight() {
        let snippet = generate("budgeting rules", &["budget", "budgeting"], 100);
        assert_eq!(snippet, "**budgeting** rules");
    }

    #[test]
    fn length_bound_holds_for_all_sizes() {
        let content = "Re: budget\n\nHi team,\n\nthe Q3 budget review moved to \
                       Thursday. Please bring the forecast and the budget \
                       spreadsheet.\n\nThanks";
        for max_len in 1..=120 {
            for terms in [&[][..], &["budget"][..], &["forecast", "q3"][..]] {
                let snippet = generate(content, terms, max_len);
                assert!(!snippet.is_empty(), "max_len {max_len}");
                assert!(chars(&snippet) <= max_len, "max_len {max_len}");
            }
        }
    }

    #[test]
    fn deterministic_output() {
        let content = "one budget two budget three";
        assert_eq!(
            generate(content, &["budget"], 20),
            generate(content, &["budget"], 20)
        );
    }
}
