/// Lowercase ASCII slug: runs of anything that is not `[a-z0-9]` collapse to a
/// single `_`, leading/trailing separators are trimmed, and the result is cut
/// to at most `max_len` bytes (without leaving a trailing `_`).
///
/// Used for dataset names and for CSV header names, which become column names.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if out.len() > max_len {
        out.truncate(max_len);
        while out.ends_with('_') {
            out.pop();
        }
    }
    out
}
