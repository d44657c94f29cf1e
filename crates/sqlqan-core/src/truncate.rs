//! Query text truncation.

const ELLIPSIS: &str = "...";

/// Cuts `query` to at most `max_len` characters, ending with `...` when cut.
///
/// Works on `char` boundaries so multi-byte text is never split. A `max_len` of
/// zero disables truncation. Returns the text and whether it was cut.
pub fn truncate_query(query: &str, max_len: usize) -> (String, bool) {
    if max_len == 0 {
        return (query.to_string(), false);
    }
    if query.chars().count() <= max_len {
        return (query.to_string(), false);
    }

    let ellipsis_len = ELLIPSIS.chars().count();
    if max_len <= ellipsis_len {
        return (query.chars().take(max_len).collect(), true);
    }

    let mut out: String = query.chars().take(max_len - ellipsis_len).collect();
    out.push_str(ELLIPSIS);
    (out, true)
}
