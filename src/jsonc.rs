//! JSON-with-comments support for extension files.
//!
//! Theme, snippet, grammar and language-configuration files shipped by
//! extensions are frequently JSONC: they carry `//` line comments, `/* */`
//! block comments and trailing commas. The scanner below walks the input
//! one character at a time and tracks whether it is inside a string literal
//! (and whether the previous character was an escape), so comment markers
//! inside quoted values such as `"http://example.com"` survive untouched.

use serde::de::DeserializeOwned;

/// Remove `//` and `/* */` comments outside string literals.
///
/// Newlines inside removed comments are kept so that parser error positions
/// still point at the right line.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Remove commas that directly precede a closing `}` or `]`.
///
/// Expects comment-free input (run [`strip_comments`] first).
pub fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Turn JSONC text into plain JSON text.
pub fn to_json(input: &str) -> String {
    // Byte order marks show up in files saved by some Windows editors
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    strip_trailing_commas(&strip_comments(input))
}

/// Parse JSONC text into any deserializable type.
pub fn parse<T: DeserializeOwned>(input: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(&to_json(input))
}
