//! Line-level mutation operators for C-family sources.
//!
//! Operators only touch code outside string/char literals and line comments.

/// One textual edit of a single source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMutation {
    /// Operator family name.
    pub operator: &'static str,
    /// Byte offset of the replaced span.
    pub start: usize,
    /// Exclusive end of the replaced span.
    pub end: usize,
    /// Replacement text.
    pub replacement: String,
}

impl LineMutation {
    fn new(
        operator: &'static str,
        start: usize,
        end: usize,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            operator,
            start,
            end,
            replacement: replacement.into(),
        }
    }

    /// Apply to `line`.
    pub fn apply(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len() + self.replacement.len());
        out.push_str(&line[..self.start]);
        out.push_str(&self.replacement);
        out.push_str(&line[self.end..]);
        out
    }
}

/// Bytes that are code (not inside a literal or trailing comment).
fn code_mask(line: &str) -> Vec<bool> {
    let bytes = line.as_bytes();
    let mut mask = vec![true; bytes.len()];
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                mask[i] = false;
                if b == b'\\' {
                    if i + 1 < bytes.len() {
                        mask[i + 1] = false;
                    }
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                    mask[i] = false;
                } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
                    mask[i..].iter_mut().for_each(|m| *m = false);
                    break;
                }
            }
        }
        i += 1;
    }
    mask
}

fn occurrences<'a>(
    line: &'a str,
    mask: &'a [bool],
    pattern: &'a str,
) -> impl Iterator<Item = usize> + 'a {
    line.match_indices(pattern)
        .map(|(pos, _)| pos)
        .filter(move |&pos| mask[pos..pos + pattern.len()].iter().all(|&m| m))
}

fn comparison_replacements(op: &str) -> &'static [(&'static str, &'static str)] {
    match op {
        ">" => &[("boundary", ">="), ("negate_cmp", "<=")],
        ">=" => &[("boundary", ">"), ("negate_cmp", "<")],
        "<" => &[("boundary", "<="), ("negate_cmp", ">=")],
        "<=" => &[("boundary", "<"), ("negate_cmp", ">")],
        "==" => &[("negate_eq", "!=")],
        "!=" => &[("negate_eq", "==")],
        _ => &[],
    }
}

/// Relational operators. Single-character `<`/`>` require surrounding spaces to keep
/// generics and shifts out.
pub fn comparison_mutations(line: &str) -> Vec<LineMutation> {
    let mask = code_mask(line);
    let mut out = Vec::new();
    for op in [">=", "<=", "==", "!="] {
        for pos in occurrences(line, &mask, op) {
            for (name, repl) in comparison_replacements(op) {
                out.push(LineMutation::new(name, pos, pos + op.len(), *repl));
            }
        }
    }
    for op in [">", "<"] {
        let spaced = format!(" {op} ");
        for pos in occurrences(line, &mask, &spaced) {
            for (name, repl) in comparison_replacements(op) {
                out.push(LineMutation::new(name, pos + 1, pos + 2, *repl));
            }
        }
    }
    out
}

/// `&&` <-> `||`.
pub fn logical_mutations(line: &str) -> Vec<LineMutation> {
    let mask = code_mask(line);
    let mut out = Vec::new();
    for (op, repl) in [("&&", "||"), ("||", "&&")] {
        for pos in occurrences(line, &mask, op) {
            out.push(LineMutation::new("logic_flip", pos, pos + 2, repl));
        }
    }
    out
}

/// Binary arithmetic, spaced operators only.
pub fn arithmetic_mutations(line: &str) -> Vec<LineMutation> {
    let mask = code_mask(line);
    let mut out = Vec::new();
    for (op, repl) in [(" + ", "-"), (" - ", "+"), (" * ", "/"), (" / ", "*"), (" % ", "*")] {
        for pos in occurrences(line, &mask, op) {
            out.push(LineMutation::new("arith", pos + 1, pos + 2, repl));
        }
    }
    out
}

fn words(line: &str, mask: &[bool]) -> Vec<(usize, usize)> {
    let bytes = line.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if mask[i] && is_word(bytes[i]) {
            let start = i;
            while i < bytes.len() && mask[i] && is_word(bytes[i]) {
                i += 1;
            }
            out.push((start, i));
        } else {
            i += 1;
        }
    }
    out
}

/// `true` <-> `false` and integer literal nudges.
pub fn literal_mutations(line: &str) -> Vec<LineMutation> {
    let mask = code_mask(line);
    let bytes = line.as_bytes();
    let mut out = Vec::new();
    for (start, end) in words(line, &mask) {
        let word = &line[start..end];
        match word {
            "true" => out.push(LineMutation::new("bool_flip", start, end, "false")),
            "false" => out.push(LineMutation::new("bool_flip", start, end, "true")),
            _ => {
                let adjacent_dot = (start > 0 && bytes[start - 1] == b'.')
                    || bytes.get(end) == Some(&b'.');
                if adjacent_dot || !word.bytes().all(|b| b.is_ascii_digit()) {
                    continue;
                }
                let Ok(value) = word.parse::<u64>() else {
                    continue;
                };
                let replacement = match value {
                    0 => "1".to_string(),
                    1 => "0".to_string(),
                    n => (n + 1).to_string(),
                };
                out.push(LineMutation::new("constant", start, end, replacement));
            }
        }
    }
    out
}

/// Span of the parenthesized condition following a branch keyword.
fn condition_span(line: &str, mask: &[bool]) -> Option<(usize, usize)> {
    let bytes = line.as_bytes();
    let keyword_end = ["if", "while"].iter().find_map(|kw| {
        words(line, mask)
            .into_iter()
            .find(|&(s, e)| &line[s..e] == *kw)
            .map(|(_, e)| e)
    })?;
    let open = (keyword_end..bytes.len()).find(|&i| mask[i] && bytes[i] == b'(')?;
    if line[keyword_end..open].trim() != "" {
        return None;
    }
    let mut depth = 0i32;
    for i in open..bytes.len() {
        if !mask[i] {
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((open, i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Negate an `if`/`while` condition.
pub fn negate_condition(line: &str) -> Vec<LineMutation> {
    let mask = code_mask(line);
    match condition_span(line, &mask) {
        Some((start, end)) => {
            let inner = &line[start + 1..end - 1];
            vec![LineMutation::new(
                "negate_cond",
                start,
                end,
                format!("(!({inner}))"),
            )]
        }
        None => vec![],
    }
}

/// Drop an assignment or call statement, leaving an empty statement.
pub fn statement_removal(line: &str) -> Vec<LineMutation> {
    let trimmed = line.trim();
    if !trimmed.ends_with(';') {
        return vec![];
    }
    let head = trimmed.split_whitespace().next().unwrap_or_default();
    if matches!(head, "return" | "throw" | "break" | "continue" | "yield") {
        return vec![];
    }
    let body = trimmed.trim_end_matches(';');
    let is_assignment = body
        .split_once('=')
        .is_some_and(|(lhs, rhs)| {
            !rhs.starts_with('=') && lhs.trim().split_whitespace().count() == 1
        });
    let is_call = !body.contains('=') && body.ends_with(')');
    if !(is_assignment || is_call || body.ends_with("++") || body.ends_with("--")) {
        return vec![];
    }
    let start = line.len() - line.trim_start().len();
    let end = start + trimmed.len();
    vec![LineMutation::new("stmt_remove", start, end, ";")]
}

/// Operators applied to executed lines: expression-level edits.
pub fn trace_guided_mutations(line: &str) -> Vec<LineMutation> {
    let mut out = comparison_mutations(line);
    out.extend(logical_mutations(line));
    out.extend(arithmetic_mutations(line));
    out.extend(literal_mutations(line));
    out.sort_by(|a, b| (a.start, a.operator).cmp(&(b.start, b.operator)));
    out
}

/// Operators applied to control-dominated lines: branch and statement edits.
pub fn control_dominated_mutations(line: &str) -> Vec<LineMutation> {
    let mut out = negate_condition(line);
    if out.is_empty() {
        out.extend(statement_removal(line));
    } else {
        out.extend(comparison_mutations(line));
    }
    out
}
