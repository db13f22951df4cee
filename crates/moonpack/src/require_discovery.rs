//! Discovery of `require` references in Lua source text
//!
//! Discovery is textual: comments are masked out first (keeping byte offsets
//! and line structure intact) and string literal spans are recorded so that a
//! `require` spelled inside a string is not mistaken for a dependency.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches every `require` call site. Exactly one of the capture groups is set:
/// a literal argument in one of four spellings, or a dynamic argument list.
static REQUIRE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\brequire\s*(?:\(\s*(?:"(?P<pdq>[^"\\\n]*)"|'(?P<psq>[^'\\\n]*)')\s*\)|"(?P<dq>[^"\\\n]*)"|'(?P<sq>[^'\\\n]*)'|\((?P<dynamic>[^)\n]*)\))"#,
    )
    .expect("require pattern is valid")
});

/// A `require` with a string literal argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireReference {
    pub name: String,
    /// 1-based line of the `require` keyword
    pub line: usize,
    /// 1-based byte column of the `require` keyword
    pub column: usize,
}

/// A `require` whose argument is an expression rather than a literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRequire {
    pub expression: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredRequires {
    /// Literal requires in source order
    pub literal: Vec<RequireReference>,
    pub dynamic: Vec<DynamicRequire>,
}

impl DiscoveredRequires {
    /// Required module names in source order, duplicates included
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.literal.iter().map(|r| r.name.as_str())
    }
}

/// Find every `require` in a module's source
pub fn discover_requires(source: &str) -> DiscoveredRequires {
    let scan = LuaTextScan::new(source);
    let mut discovered = DiscoveredRequires::default();

    for caps in REQUIRE_CALL.captures_iter(&scan.masked) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let start = whole.start();

        // Method calls (`obj.require`, `obj:require`) and text inside strings are not requires
        if start > 0 && matches!(scan.masked.as_bytes()[start - 1], b'.' | b':') {
            continue;
        }
        if scan.in_string(start) {
            continue;
        }

        let (line, column) = scan.line_column(start);
        let literal = ["pdq", "psq", "dq", "sq"]
            .iter()
            .find_map(|group| caps.name(group));

        if let Some(name) = literal {
            discovered.literal.push(RequireReference {
                name: name.as_str().to_owned(),
                line,
                column,
            });
        } else if let Some(expression) = caps.name("dynamic") {
            discovered.dynamic.push(DynamicRequire {
                expression: expression.as_str().trim().to_owned(),
                line,
                column,
            });
        }
    }

    discovered
}

/// Source text with comments blanked out, plus the byte ranges of string literals
struct LuaTextScan {
    masked: String,
    strings: Vec<Range<usize>>,
    line_starts: Vec<usize>,
}

impl LuaTextScan {
    fn new(source: &str) -> Self {
        let bytes = source.as_bytes();
        let mut masked = bytes.to_vec();
        let mut strings = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    let end = match long_bracket_level(bytes, i + 2) {
                        Some(level) => find_long_bracket_close(bytes, i + 2, level),
                        None => bytes[i..]
                            .iter()
                            .position(|&b| b == b'\n')
                            .map_or(bytes.len(), |offset| i + offset),
                    };
                    blank(&mut masked[i..end]);
                    i = end;
                }
                quote @ (b'"' | b'\'') => {
                    let end = find_quoted_end(bytes, i + 1, quote);
                    strings.push(i..end);
                    i = end;
                }
                b'[' => {
                    if let Some(level) = long_bracket_level(bytes, i) {
                        let end = find_long_bracket_close(bytes, i, level);
                        strings.push(i..end);
                        i = end;
                    } else {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }

        let line_starts = std::iter::once(0)
            .chain(
                bytes
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| **b == b'\n')
                    .map(|(idx, _)| idx + 1),
            )
            .collect();

        Self {
            // Only whole comment byte ranges were replaced with ASCII spaces
            masked: String::from_utf8_lossy(&masked).into_owned(),
            strings,
            line_starts,
        }
    }

    fn in_string(&self, offset: usize) -> bool {
        self.strings.iter().any(|range| range.contains(&offset))
    }

    fn line_column(&self, offset: usize) -> (usize, usize) {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        (line_idx + 1, offset - self.line_starts[line_idx] + 1)
    }
}

/// Replace comment bytes with spaces, keeping newlines so line numbers survive
fn blank(bytes: &mut [u8]) {
    for b in bytes.iter_mut().filter(|b| **b != b'\n') {
        *b = b' ';
    }
}

/// Level of a long bracket opening (`[[`, `[=[`, `[==[` ...) at `start`
fn long_bracket_level(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'[') {
        return None;
    }
    let level = bytes[start + 1..].iter().take_while(|&&b| b == b'=').count();
    (bytes.get(start + 1 + level) == Some(&b'[')).then_some(level)
}

/// End offset (exclusive) of the long bracket opened at `start`, or the end of input
fn find_long_bracket_close(bytes: &[u8], start: usize, level: usize) -> usize {
    let mut close = Vec::with_capacity(level + 2);
    close.push(b']');
    close.extend(std::iter::repeat_n(b'=', level));
    close.push(b']');

    let body_start = start + level + 2;
    bytes[body_start.min(bytes.len())..]
        .windows(close.len())
        .position(|window| window == close.as_slice())
        .map_or(bytes.len(), |offset| body_start + offset + close.len())
}

/// End offset (exclusive) of a quoted string whose body starts at `start`
fn find_quoted_end(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}
