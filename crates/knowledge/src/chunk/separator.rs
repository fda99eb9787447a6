//! Separator pre-split helpers.

/// Turn an escaped separator such as `\n\n\n` into its literal form.
///
/// Recognises `\n`, `\r`, `\t` and `\\`; any other escape is kept as written.
pub fn unescape_separator(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// Partition `text` on `separator`, keeping each segment's byte offset.
pub(super) fn segments<'t>(text: &'t str, separator: &str) -> Vec<(usize, &'t str)> {
    let mut out = Vec::new();
    let mut start = 0;

    for (pos, _) in text.match_indices(separator) {
        out.push((start, &text[start..pos]));
        start = pos + separator.len();
    }
    out.push((start, &text[start..]));

    out
}
