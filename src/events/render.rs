//! Display-line rendering and the bracket helpers shared by the parser and
//! the rollup.

pub const BULLET: &str = "•";

/// Escape literal brackets so they cannot be taken for a phase tag.
pub fn escape_brackets(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inverse of [`escape_brackets`], also undoing the leading `\(` that
/// [`bullet`] writes.
pub fn unescape_brackets(text: &str) -> String {
    let text = text.strip_prefix("\\(").map_or_else(|| text.to_string(), |rest| format!("({}", rest));
    text.replace("\\[", "[").replace("\\]", "]")
}

/// `• [phase] (host) message`; missing parts are omitted.
pub fn bullet(phase: Option<&str>, host: Option<&str>, message: &str) -> String {
    let mut line = String::from(BULLET);
    if let Some(phase) = phase.filter(|p| !p.is_empty()) {
        line.push_str(" [");
        line.push_str(phase);
        line.push(']');
    }
    if let Some(host) = host.filter(|h| !h.is_empty()) {
        line.push_str(" (");
        line.push_str(host);
        line.push(')');
    }
    line.push(' ');
    // A leading paren would read back as a host.
    if message.starts_with('(') {
        line.push('\\');
    }
    line.push_str(&escape_brackets(message));
    line
}

/// Index of the `]` that closes the `[` at byte offset `open`.
///
/// Nested brackets are counted and brackets inside double-quoted strings are
/// ignored, so `[run:x] tests=["a]"]` closes at the final bracket.
pub fn find_matching_bracket(text: &str, open: usize) -> Option<usize> {
    if text.as_bytes().get(open) != Some(&b'[') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a leading `[phase:tag]` off a task name. Returns the tag and the
/// remaining label, or `None` when the name does not start with a tag.
pub fn split_phase_tag(name: &str) -> Option<(&str, &str)> {
    let trimmed = name.trim_start();
    if !trimmed.starts_with('[') {
        return None;
    }
    let close = find_matching_bracket(trimmed, 0)?;
    let tag = trimmed[1..close].trim();
    if tag.is_empty() || tag.contains('"') {
        return None;
    }
    Some((tag, trimmed[close + 1..].trim()))
}

/// Drop a leading `<module> : ` qualifier when what follows is a phase tag.
pub fn strip_module_qualifier(name: &str) -> &str {
    match name.split_once(" : ") {
        Some((module, rest))
            if !module.contains('[') && rest.trim_start().starts_with('[') =>
        {
            rest.trim_start()
        }
        _ => name,
    }
}

/// A parsed display line: prefix (bullet, phase, host) and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayParts<'a> {
    pub prefix: &'a str,
    pub phase: Option<&'a str>,
    pub host: Option<&'a str>,
    /// Message with bracket escapes still in place.
    pub message: &'a str,
}

/// Split a rendered line back into its parts. Lines without a bullet are
/// all message.
pub fn split_display(line: &str) -> DisplayParts<'_> {
    let Some(after_bullet) = line.strip_prefix(BULLET) else {
        return DisplayParts {
            prefix: "",
            phase: None,
            host: None,
            message: line,
        };
    };

    let mut rest = after_bullet.trim_start();
    let mut phase = None;
    if rest.starts_with('[') {
        if let Some(close) = find_matching_bracket(rest, 0) {
            phase = Some(&rest[1..close]);
            rest = rest[close + 1..].trim_start();
        }
    }
    let mut host = None;
    if rest.starts_with('(') {
        if let Some(close) = rest.find(')') {
            host = Some(&rest[1..close]);
            rest = rest[close + 1..].trim_start();
        }
    }
    let prefix_len = line.len() - rest.len();
    DisplayParts {
        prefix: &line[..prefix_len],
        phase,
        host,
        message: rest,
    }
}
