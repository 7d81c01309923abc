//! `{name}` placeholder parsing for argument and output templates
//!
//! `{{` and `}}` stand for literal braces. An opening brace without a closing
//! one is kept literally.

/// Piece of a parsed template string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Split a template into literal text and `{name}` placeholders
pub fn parse(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '{' => match template[i + 1..].find('}') {
                Some(end) => {
                    let name = &template[i + 1..i + 1 + end];
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.trim().to_string()));
                    // skip past the closing brace
                    let close = i + 1 + end;
                    while let Some((j, _)) = chars.peek() {
                        if *j > close {
                            break;
                        }
                        chars.next();
                    }
                }
                None => literal.push('{'),
            },
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Names referenced by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    parse(template)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// The placeholder name when the whole template is exactly one placeholder
pub fn sole_placeholder(template: &str) -> Option<String> {
    match parse(template).as_slice() {
        [Segment::Placeholder(name)] => Some(name.clone()),
        _ => None,
    }
}

/// Substitute every placeholder through `lookup`
///
/// Returns the first unresolved name as the error.
pub fn render(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::new();
    for segment in parse(template) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Placeholder(name) => match lookup(&name) {
                Some(value) => out.push_str(&value),
                None => return Err(name),
            },
        }
    }
    Ok(out)
}
