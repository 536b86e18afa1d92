//! Finds top-level class definitions in Python source.
//!
//! This is a lexical scan, not a parser: comments and string literals are
//! blanked out first, then every `class` keyword at column 0 is read together
//! with its base list. Byte offsets in the blanked text equal those in the
//! source.

/// A top-level `class` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// The class name.
    pub name: String,
    /// Declared bases, reduced to their last dotted component and stripped of
    /// subscripts. Keyword arguments such as `metaclass=` are dropped.
    pub bases: Vec<String>,
    /// Byte offset of the first character of the name.
    pub name_start: usize,
    /// Byte offset just past the name.
    pub name_end: usize,
}

/// Returns the top-level classes of `source`, in source order.
pub fn scan(source: &str) -> Vec<ClassDef> {
    let masked = mask(source);
    let bytes = masked.as_bytes();
    let mut classes = Vec::new();

    let mut line_start = 0;
    while line_start < bytes.len() {
        if let Some(class) = class_at(&masked, line_start) {
            classes.push(class);
        }
        line_start = match bytes[line_start..].iter().position(|b| *b == b'\n') {
            Some(newline) => line_start + newline + 1,
            None => bytes.len(),
        };
    }
    classes
}

fn class_at(masked: &str, start: usize) -> Option<ClassDef> {
    let bytes = masked.as_bytes();
    let rest = bytes.get(start..)?;
    if !rest.starts_with(b"class") {
        return None;
    }
    let after_keyword = start + "class".len();
    match bytes.get(after_keyword) {
        Some(b' ' | b'\t' | b'\\') => {}
        _ => return None,
    }

    let name_start = skip_blanks(bytes, after_keyword);
    let name_end = identifier_end(bytes, name_start);
    if name_end == name_start || bytes[name_start].is_ascii_digit() {
        return None;
    }

    let mut bases = Vec::new();
    let after_name = skip_blanks(bytes, name_end);
    if bytes.get(after_name) == Some(&b'(') {
        let close = matching_paren(bytes, after_name)?;
        bases = parse_bases(&masked[after_name + 1..close]);
    }

    Some(ClassDef {
        name: masked[name_start..name_end].to_string(),
        bases,
        name_start,
        name_end,
    })
}

/// Skips spaces, tabs and backslash line continuations.
fn skip_blanks(bytes: &[u8], mut at: usize) -> usize {
    loop {
        match bytes.get(at) {
            Some(b' ' | b'\t' | b'\x0c') => at += 1,
            Some(b'\\') => match bytes.get(at + 1) {
                Some(b'\n') => at += 2,
                Some(b'\r') if bytes.get(at + 2) == Some(&b'\n') => at += 3,
                _ => return at,
            },
            _ => return at,
        }
    }
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn identifier_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while bytes.get(end).is_some_and(|b| is_identifier_byte(*b)) {
        end += 1;
    }
    end
}

fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_bases(list: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in list.chars() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| base_name(part))
        .collect()
}

fn base_name(part: &str) -> Option<String> {
    let compact: String = part
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\\')
        .collect();
    if compact.is_empty() || compact.starts_with('*') || compact.contains('=') {
        return None;
    }
    let head = compact
        .split(['[', '('])
        .next()
        .unwrap_or_default();
    let name = head.rsplit('.').next().unwrap_or_default();
    let valid = !name.is_empty()
        && !name.as_bytes()[0].is_ascii_digit()
        && name.bytes().all(is_identifier_byte);
    valid.then(|| name.to_string())
}

/// Replaces comments and string literals with spaces, keeping newlines and
/// byte offsets.
pub fn mask(source: &str) -> String {
    let ranges = literal_ranges(source.as_bytes());
    let mut masked = String::with_capacity(source.len());
    let mut ranges = ranges.into_iter().peekable();

    for (offset, ch) in source.char_indices() {
        while ranges.peek().is_some_and(|(_, end)| *end <= offset) {
            ranges.next();
        }
        let hidden = ranges
            .peek()
            .is_some_and(|(start, end)| (*start..*end).contains(&offset));
        if hidden && ch != '\n' {
            masked.extend(std::iter::repeat_n(' ', ch.len_utf8()));
        } else {
            masked.push(ch);
        }
    }
    masked
}

/// Byte ranges of comments and string literals, in order.
fn literal_ranges(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |n| i + n);
                ranges.push((i, end));
                i = end;
            }
            quote @ (b'\'' | b'"') => {
                let triple = bytes.get(i..i + 3) == Some(&[quote, quote, quote][..]);
                let end = if triple {
                    triple_quoted_end(bytes, i + 3, quote)
                } else {
                    single_quoted_end(bytes, i + 1, quote)
                };
                ranges.push((i, end));
                i = end;
            }
            _ => i += 1,
        }
    }
    ranges
}

fn triple_quoted_end(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote && bytes.get(i..i + 3) == Some(&[quote, quote, quote][..]) => {
                return i + 3;
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn single_quoted_end(bytes: &[u8], mut i: usize, quote: u8) -> usize {
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
