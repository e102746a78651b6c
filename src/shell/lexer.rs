// ABOUTME: Conservative shell lexer — segments command lines, classifies opaque constructs, tokenizes words.
// ABOUTME: Quote/escape aware; never executes or expands anything, only finds command boundaries.

use std::fmt;

/// Why a segment was left unparsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexReason {
    CommandSubstitution,
    Backticks,
    ProcessSubstitution,
    Heredoc,
}

impl fmt::Display for ComplexReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CommandSubstitution => "command substitution",
            Self::Backticks => "backtick substitution",
            Self::ProcessSubstitution => "process substitution",
            Self::Heredoc => "heredoc",
        };
        f.write_str(text)
    }
}

/// One classified command segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BashNode {
    /// A plain command: unquoted command word, unquoted arguments, and the raw tokens.
    Command {
        command: String,
        args: Vec<String>,
        tokens: Vec<String>,
    },
    /// A segment whose content cannot be analysed statically.
    Complex { reason: ComplexReason, raw: String },
    /// A `( ... )` subshell or `{ ...; }` group; `body` is parsed again.
    Group { body: String, raw: String },
}

/// Reserved words that may precede the command word of a segment.
pub const KEYWORDS: &[&str] = &["!", "if", "then", "do", "else", "elif", "while", "until"];

/// Split a command line into independently executed segments.
///
/// Separators are `;`, newlines, `&&`, `||`, `|` and a lone `&`, but only
/// outside quotes and outside groups. `&>`, `&>>`, `>&` and `<&` are
/// redirections and do not split. A group is a `(` at command position or
/// after `$`, `<` or `>`, or a standalone `{` at command position. If a group
/// is never closed the line is split as if it had no groups.
pub fn segment(command: &str) -> Vec<String> {
    match split(command, true) {
        Some(segments) => segments,
        None => split(command, false).unwrap_or_default(),
    }
}

/// `None` when `track_groups` is set and a group is left open.
fn split(command: &str, track_groups: bool) -> Option<Vec<String>> {
    let chars: Vec<char> = command.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    // Closing characters of the open groups, innermost last.
    let mut groups: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let prev = if i > 0 { Some(chars[i - 1]) } else { None };
        i += 1;

        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if c == '\\' {
            current.push(c);
            escaped = true;
            continue;
        }
        if in_double {
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            continue;
        }

        match c {
            '\'' => in_single = true,
            '"' => in_double = true,
            '(' if track_groups
                && (matches!(prev, Some('$' | '<' | '>')) || at_command_position(&current)) =>
            {
                groups.push(')');
            }
            '{' if track_groups
                && (prev == Some('$')
                    || (at_command_position(&current) && next.is_none_or(char::is_whitespace))) =>
            {
                groups.push('}');
            }
            ')' | '}' if groups.last() == Some(&c) => {
                groups.pop();
            }
            _ => {}
        }

        if !groups.is_empty() {
            current.push(c);
            continue;
        }

        match c {
            ';' | '\n' | '\r' => flush(&mut segments, &mut current),
            '&' if next == Some('&') => {
                i += 1;
                flush(&mut segments, &mut current);
            }
            '&' if next == Some('>') || matches!(prev, Some('>') | Some('<')) => current.push(c),
            '&' => flush(&mut segments, &mut current),
            '|' if next == Some('|') => {
                i += 1;
                flush(&mut segments, &mut current);
            }
            '|' if prev == Some('>') => current.push(c),
            '|' => flush(&mut segments, &mut current),
            _ => current.push(c),
        }
    }
    if !groups.is_empty() {
        return None;
    }
    flush(&mut segments, &mut current);
    Some(segments)
}

/// True when the next word of `current` would be a command word.
fn at_command_position(current: &str) -> bool {
    let trimmed = current.trim_end();
    match trimmed.split_whitespace().last() {
        None => true,
        Some("(") => true,
        Some(word) => {
            trimmed.len() < current.len() && (word == "{" || KEYWORDS.contains(&word))
        }
    }
}

fn flush(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

/// Detect constructs whose content is opaque to static analysis.
///
/// Single quotes make everything inert. Double quotes still allow `$(` and
/// backticks but turn `<(` and `<<` into literal text.
pub fn find_complex(segment: &str) -> Option<ComplexReason> {
    let chars: Vec<char> = segment.chars().collect();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        let next = chars.get(i + 1).copied();
        if escaped {
            escaped = false;
            continue;
        }
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            '$' if next == Some('(') => return Some(ComplexReason::CommandSubstitution),
            '`' => return Some(ComplexReason::Backticks),
            '<' | '>' if !in_double && next == Some('(') => {
                return Some(ComplexReason::ProcessSubstitution);
            }
            '<' if !in_double && next == Some('<') => return Some(ComplexReason::Heredoc),
            _ => {}
        }
    }
    None
}

/// Classify one segment as a group, an opaque complex construct, or a plain command.
pub fn classify(segment: &str) -> Option<BashNode> {
    if let Some(body) = group_body(strip_keywords(segment)) {
        return Some(BashNode::Group {
            body: body.to_string(),
            raw: segment.to_string(),
        });
    }
    if let Some(reason) = find_complex(segment) {
        return Some(BashNode::Complex {
            reason,
            raw: segment.to_string(),
        });
    }
    let tokens = tokenize(segment);
    let mut words = tokens.iter().map(|t| unquote(t));
    let command = words.next()?;
    let args: Vec<String> = words.collect();
    Some(BashNode::Command {
        command,
        args,
        tokens,
    })
}

fn strip_keywords(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        let end = text.find(char::is_whitespace).unwrap_or(text.len());
        if end < text.len() && KEYWORDS.contains(&&text[..end]) {
            text = &text[end..];
        } else {
            return text;
        }
    }
}

/// Inner text of a leading `( ... )` or `{ ...; }`. An unclosed group runs
/// to the end of the segment.
fn group_body(text: &str) -> Option<&str> {
    let (open, close) = if text.starts_with('(') {
        ('(', ')')
    } else if text.starts_with('{') && text[1..].starts_with(char::is_whitespace) {
        ('{', '}')
    } else {
        return None;
    };
    let inner = &text[1..];
    let end = matching_close(inner, open, close).unwrap_or(inner.len());
    Some(inner[..end].trim())
}

/// Byte offset of the `close` that balances an already-consumed `open`.
fn matching_close(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            _ if in_double => {}
            c if c == open => depth += 1,
            c if c == close => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Segment and classify a full command line.
pub fn parse(command: &str) -> Vec<BashNode> {
    segment(command).iter().filter_map(|s| classify(s)).collect()
}

/// Split a segment on unquoted whitespace, emitting redirection operators
/// as their own tokens. Quotes and escapes are kept in the raw tokens.
pub fn tokenize(segment: &str) -> Vec<String> {
    let chars: Vec<char> = segment.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        i += 1;

        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if c == '\\' {
            current.push(c);
            escaped = true;
            continue;
        }
        if in_double {
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = true;
                current.push(c);
            }
            c if c.is_whitespace() => push_token(&mut tokens, &mut current),
            '>' | '<' => {
                push_token(&mut tokens, &mut current);
                let mut op = c.to_string();
                while let Some(&n) = chars.get(i) {
                    if op.len() < 3 && (n == c || n == '&' || (c == '>' && n == '|')) {
                        op.push(n);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(op);
            }
            '&' if next == Some('>') => {
                push_token(&mut tokens, &mut current);
                let mut op = String::from("&>");
                i += 1;
                if chars.get(i) == Some(&'>') {
                    op.push('>');
                    i += 1;
                }
                tokens.push(op);
            }
            _ => current.push(c),
        }
    }
    push_token(&mut tokens, &mut current);
    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

/// True for tokens produced as redirection operators by [`tokenize`].
pub fn is_redirection(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| matches!(c, '>' | '<' | '&' | '|'))
}

/// Strip quote delimiters and resolve backslash escapes.
///
/// Single-quoted content is kept verbatim. Inside double quotes only `$`,
/// `` ` ``, `"`, `\` and newline are escapable.
pub fn unquote(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                out.push(c);
            }
        } else if in_double {
            match c {
                '"' => in_double = false,
                '\\' => match chars.peek() {
                    Some(&n) if matches!(n, '$' | '`' | '"' | '\\' | '\n') => {
                        out.push(n);
                        chars.next();
                    }
                    _ => out.push('\\'),
                },
                _ => out.push(c),
            }
        } else {
            match c {
                '\'' => in_single = true,
                '"' => in_double = true,
                '\\' => {
                    if let Some(n) = chars.next() {
                        out.push(n);
                    }
                }
                _ => out.push(c),
            }
        }
    }
    out
}
