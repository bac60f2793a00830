//! Failure-line extraction for verification diagnostics.

use std::sync::LazyLock;

use regex::Regex;

static FAILURE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // `\w*` lets `TypeError`, `AssertionError` or `RuntimeException` count.
    Regex::new(r"(?i)\w*(error|errors|exception)\b|\b(fail|failed|failing|failure|failures|panic|panicked|cannot find|not found)\b")
        .expect("failure pattern is valid")
});

/// Return at most `max_lines` lines of `output` that look like failures.
///
/// Lines are trimmed on the right and kept in their original order. Blank
/// lines never match.
pub fn failure_lines(output: &str, max_lines: usize) -> Vec<&str> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && FAILURE_LINE_RE.is_match(line))
        .take(max_lines)
        .collect()
}

/// Render a `[label]` block of failure lines, or a placeholder when nothing matched.
pub fn render_block(label: &str, output: &str, max_lines: usize) -> String {
    let lines = failure_lines(output, max_lines);
    let mut buf = format!("[{label}]\n");
    if lines.is_empty() {
        buf.push_str("(no error lines captured; see verify.log)\n");
        return buf;
    }
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    buf
}
