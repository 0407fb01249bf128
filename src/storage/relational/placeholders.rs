//! Positional placeholder rewriting.
//!
//! Callers write portable `?` placeholders; PostgreSQL expects `$1..$n`.
//! These are copied untouched:
//!
//! - `'...'` literals, including `E'...'` strings with backslash escapes
//! - `"..."` identifiers
//! - `$$...$$` and `$tag$...$tag$` bodies
//! - `--` and `/* */` comments
//!
//! The JSONB operators `?`, `?|` and `?&` collide with the placeholder, so
//! write them doubled (`??`, `??|`, `??&`); a doubled `??` is emitted as a
//! single `?`.

/// Rewrites every `?` outside quotes and comments to `$n`, numbered from 1.
#[must_use]
pub fn rewrite_placeholders(sql: &str) -> String {
    if !sql.contains('?') {
        return sql.to_string();
    }

    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len + 8);
    let mut index = 0_usize;
    // Start of the text not yet copied to `out`. Only ever set just past an
    // ASCII byte, so slicing stays on char boundaries.
    let mut copied = 0_usize;
    let mut i = 0_usize;

    while i < len {
        match bytes[i] {
            b'?' => {
                out.push_str(&sql[copied..i]);
                if bytes.get(i + 1) == Some(&b'?') {
                    out.push('?');
                    i += 2;
                } else {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                    i += 1;
                }
                copied = i;
            },
            b'\'' => i = skip_quoted(bytes, i + 1, b'\'', is_escape_string(bytes, i)),
            b'"' => i = skip_quoted(bytes, i + 1, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = find(bytes, i + 2, b"\n").map_or(len, |end| end + 1);
            },
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(len, |end| end + 2);
            },
            b'$' => {
                i = match dollar_tag_end(bytes, i) {
                    Some(body) => {
                        let tag = &bytes[i..body];
                        find(bytes, body, tag).map_or(len, |end| end + tag.len())
                    },
                    None => i + 1,
                };
            },
            _ => i += 1,
        }
    }

    out.push_str(&sql[copied..]);
    out
}

const fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Whether the quote at `quote` opens an `E'...'` string.
fn is_escape_string(bytes: &[u8], quote: usize) -> bool {
    quote >= 1
        && matches!(bytes[quote - 1], b'E' | b'e')
        && (quote < 2 || !is_ident_byte(bytes[quote - 2]))
}

/// Index just past the closing `quote`, or the end of input.
///
/// A doubled quote closes and immediately reopens, which is equivalent.
fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8, backslash_escapes: bool) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash_escapes => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// If a dollar-quote delimiter starts at `start`, the index just past it.
///
/// `$1` and `a$b` are not delimiters.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && is_ident_byte(bytes[start - 1]) {
        return None;
    }
    let mut i = start + 1;
    match bytes.get(i) {
        Some(&b'$') => return Some(i + 1),
        Some(&b) if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 => i += 1,
        _ => return None,
    }
    while let Some(&b) = bytes.get(i) {
        match b {
            b'$' => return Some(i + 1),
            b if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 => i += 1,
            _ => return None,
        }
    }
    None
}

fn find(bytes: &[u8], from: usize, pattern: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(pattern.len())
        .position(|window| window == pattern)
        .map(|offset| offset + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_numbers_placeholders_in_order() {
        assert_eq!(
            rewrite_placeholders("UPDATE rate_limits SET hit_count = ? WHERE key = ?"),
            "UPDATE rate_limits SET hit_count = $1 WHERE key = $2"
        );
    }

    #[test]
    fn test_leaves_quoted_text_alone() {
        assert_eq!(
            rewrite_placeholders("SELECT '?', \"odd?col\" FROM t WHERE a = ? AND b = 'it''s ?'"),
            "SELECT '?', \"odd?col\" FROM t WHERE a = $1 AND b = 'it''s ?'"
        );
    }

    #[test]
    fn test_leaves_comments_alone() {
        assert_eq!(
            rewrite_placeholders("SELECT ? -- why?\n, ? /* really? */ , ?"),
            "SELECT $1 -- why?\n, $2 /* really? */ , $3"
        );
    }

    #[test]
    fn test_leaves_escape_strings_alone() {
        assert_eq!(
            rewrite_placeholders(r"SELECT E'it\'s ?', ? , e'\\', ?"),
            r"SELECT E'it\'s ?', $1 , e'\\', $2"
        );
        // A plain literal treats backslash as an ordinary character.
        assert_eq!(
            rewrite_placeholders(r"SELECT 'C:\', ?"),
            r"SELECT 'C:\', $1"
        );
        // Identifiers ending in `e` do not start an escape string.
        assert_eq!(
            rewrite_placeholders(r"SELECT name'x\', ?"),
            r"SELECT name'x\', $1"
        );
    }

    #[test]
    fn test_leaves_dollar_quoted_bodies_alone() {
        assert_eq!(
            rewrite_placeholders("SELECT $$why?$$, ?, $fn$ a ? b $$ ? $fn$, ?"),
            "SELECT $$why?$$, $1, $fn$ a ? b $$ ? $fn$, $2"
        );
    }

    #[test]
    fn test_existing_numbered_parameters_pass_through() {
        assert_eq!(
            rewrite_placeholders("SELECT $1::text, ?"),
            "SELECT $1::text, $1"
        );
    }

    #[test]
    fn test_doubled_question_mark_is_jsonb_operator() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE doc ?? ? AND tags ??| ? AND tags ??& ?"),
            "SELECT * FROM t WHERE doc ? $1 AND tags ?| $2 AND tags ?& $3"
        );
    }

    #[test]
    fn test_non_ascii_text_is_preserved() {
        assert_eq!(
            rewrite_placeholders("SELECT '读者？' AS 标题, ? -- 备注?\n"),
            "SELECT '读者？' AS 标题, $1 -- 备注?\n"
        );
    }

    #[test]
    fn test_no_placeholders_is_identity() {
        let sql = "SELECT 1";
        assert_eq!(rewrite_placeholders(sql), sql);
    }

    proptest! {
        #[test]
        fn prop_every_bare_placeholder_is_numbered(parts in prop::collection::vec("[a-z =,()]{1,8}", 1..12)) {
            let sql = parts.join("?");
            let rewritten = rewrite_placeholders(&sql);
            let expected = parts.len() - 1;

            prop_assert!(!rewritten.contains('?'));
            for n in 1..=expected {
                let marker = format!("${n}");
                prop_assert!(rewritten.contains(&marker));
            }
            let next = format!("${}", expected + 1);
            prop_assert!(!rewritten.contains(&next));
        }
    }
}
