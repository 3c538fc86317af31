//! Splitting a SQL script into statements.
//!
//! Only lexical structure is understood: `;` terminates a statement unless it
//! sits inside a single-quoted literal, a double-quoted identifier, a
//! dollar-quoted body, or a comment. Nothing else about SQL is parsed.

/// Split `sql` into trimmed statements without their trailing `;`.
/// Statements that are empty or consist only of comments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = quoted_end(&chars, i, c, c == '\'' && is_escape_prefix(&chars, i));
                current.extend(&chars[i..end]);
                has_code = true;
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map(|p| i + p + 1)
                    .unwrap_or(chars.len());
                current.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = block_comment_end(&chars, i);
                current.extend(&chars[i..end]);
                i = end;
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => {
                    let end = dollar_body_end(&chars, i + tag.len(), &tag);
                    current.extend(&chars[i..end]);
                    has_code = true;
                    i = end;
                }
                None => {
                    current.push(c);
                    has_code = true;
                    i += 1;
                }
            },
            ';' => {
                push_statement(&mut statements, &current, has_code);
                current.clear();
                has_code = false;
                i += 1;
            }
            _ => {
                if !c.is_whitespace() {
                    has_code = true;
                }
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &current, has_code);
    statements
}

fn push_statement(out: &mut Vec<String>, text: &str, has_code: bool) {
    let trimmed = text.trim();
    if has_code && !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Whether the quote at `quote_at` opens an `E'...'` escape string.
fn is_escape_prefix(chars: &[char], quote_at: usize) -> bool {
    if quote_at == 0 || !matches!(chars[quote_at - 1], 'E' | 'e') {
        return false;
    }
    // `nameE'x'` is not an escape string, `E'x'` and `(E'x'` are
    quote_at < 2 || !(chars[quote_at - 2].is_alphanumeric() || chars[quote_at - 2] == '_')
}

/// Index just past the closing quote; a doubled quote is an escaped quote,
/// and in escape strings a backslash escapes the next character.
fn quoted_end(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if backslash_escapes && chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Block comments nest in PostgreSQL.
fn block_comment_end(chars: &[char], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            depth += 1;
            i += 2;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    chars.len()
}

/// `$$` or `$tag$` opening at `start`, if any. Positional parameters such as
/// `$1` are not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '$' {
            return Some(chars[start..=i].iter().collect());
        }
        let valid = if i == start + 1 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        i += 1;
    }
    None
}

fn dollar_body_end(chars: &[char], body_start: usize, tag: &str) -> usize {
    let tag: Vec<char> = tag.chars().collect();
    let mut i = body_start;
    while i + tag.len() <= chars.len() {
        if chars[i..i + tag.len()] == tag[..] {
            return i + tag.len();
        }
        i += 1;
    }
    chars.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
