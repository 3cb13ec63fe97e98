//! Backslash escaping for separator-joined strings.
//!
//! Every nesting level of the wire format joins its parts with one
//! separator character and escapes only that separator plus the escape
//! character itself. Splitting undoes exactly one level, so levels can be
//! stacked (array inside payload entry inside frame) without ambiguity.

const ESCAPE: char = '\\';

/// Escapes `\` and `sep` in `value`.
pub fn escape(value: &str, sep: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ESCAPE || c == sep {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Escapes every part and joins them with `sep`.
pub fn join_escaped<I, S>(parts: I, sep: char) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(&escape(part.as_ref(), sep));
    }
    out
}

/// Splits `value` on unescaped `sep` and unescapes each part.
///
/// A trailing lone `\` is kept literally and logged. The empty string
/// yields a single empty part; callers decide what that means.
pub fn split_escaped(value: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c == ESCAPE {
            match chars.next() {
                Some(next) => current.push(next),
                None => {
                    tracing::warn!(value, "dangling escape character, kept literally");
                    current.push(ESCAPE);
                }
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_separator_and_backslash() {
        assert_eq!(escape("b,c", ','), "b\\,c");
        assert_eq!(escape("a\\b", ','), "a\\\\b");
        assert_eq!(escape("a;b", ','), "a;b");
    }

    #[test]
    fn test_join_escaped_matches_wire_example() {
        assert_eq!(join_escaped(["a", "b,c", "d"], ','), "a,b\\,c,d");
    }

    #[test]
    fn test_split_escaped_reverses_join() {
        let parts = ["x", "", "y,z", "\\", "tail\\,"];
        let joined = join_escaped(parts, ',');
        assert_eq!(split_escaped(&joined, ','), parts);
    }

    #[test]
    fn test_split_escaped_empty_is_single_empty_part() {
        assert_eq!(split_escaped("", ','), vec![String::new()]);
    }

    #[test]
    fn test_split_escaped_dangling_escape_kept() {
        assert_eq!(split_escaped("ab\\", ','), vec!["ab\\".to_string()]);
    }

    #[test]
    fn test_nested_levels_survive() {
        // An array joined with ',' placed inside a ';'-joined frame.
        let inner = join_escaped(["p;q", "r,s"], ',');
        let outer = join_escaped([inner.as_str(), "other"], ';');

        let outer_parts = split_escaped(&outer, ';');
        assert_eq!(outer_parts[1], "other");
        assert_eq!(split_escaped(&outer_parts[0], ','), ["p;q", "r,s"]);
    }
}
