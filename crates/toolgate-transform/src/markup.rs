//! Tolerant scanner for the tag samples found in tool catalogues.
//!
//! Samples are hand-written prose, not XML documents: they contain bare `&`, `<` in
//! comparisons and pseudo-tags such as `(<file> elements)`. An opening tag only
//! starts an element when its matching closing tag follows in the same scope;
//! everything else is kept as text.

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub tag: String,
    /// Text directly inside the element, children excluded.
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.tag == tag)
    }

    /// Child tags in first-seen order with their multiplicity.
    pub fn grouped_children(&self) -> Vec<(&str, Vec<&Element>)> {
        let mut groups: Vec<(&str, Vec<&Element>)> = Vec::new();
        for child in &self.children {
            match groups.iter_mut().find(|(tag, _)| *tag == child.tag) {
                Some((_, members)) => members.push(child),
                None => groups.push((child.tag.as_str(), vec![child])),
            }
        }
        groups
    }
}

/// Parses a sample whose root element starts the (trimmed) input.
pub fn parse_element(source: &str) -> Option<Element> {
    let source = source.trim();
    let open = open_tag_at(source, 0)?;
    if open.self_closing {
        return Some(Element {
            tag: open.name.to_string(),
            ..Element::default()
        });
    }
    let (element, _) = parse_body(source, open.name, open.end)?;
    Some(element)
}

struct OpenTag<'a> {
    name: &'a str,
    end: usize,
    self_closing: bool,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

/// Reads `<name attr="...">` starting at `pos`. Attributes are skipped.
fn open_tag_at(source: &str, pos: usize) -> Option<OpenTag<'_>> {
    let rest = source.get(pos..)?;
    let after = rest.strip_prefix('<')?;
    let name_len = after
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(index, _)| index)
        .unwrap_or(after.len());
    if name_len == 0 || !after.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        return None;
    }
    let name = &after[..name_len];
    let tail = &after[name_len..];
    if !(tail.starts_with('>') || tail.starts_with('/') || tail.starts_with(char::is_whitespace)) {
        return None;
    }
    let close = tail.find('>')?;
    if tail[..close].contains('<') {
        return None;
    }
    let self_closing = tail[..close].trim_end().ends_with('/');
    Some(OpenTag {
        name,
        end: pos + 1 + name_len + close + 1,
        self_closing,
    })
}

/// Parses element content after its opening tag up to `</tag>`. Returns the element
/// and the offset just past the closing tag.
fn parse_body(source: &str, tag: &str, start: usize) -> Option<(Element, usize)> {
    let closing = format!("</{tag}>");
    let mut element = Element {
        tag: tag.to_string(),
        ..Element::default()
    };
    let mut pos = start;
    loop {
        let lt = pos + source[pos..].find('<')?;
        element.text.push_str(&source[pos..lt]);
        if source[lt..].starts_with(&closing) {
            return Some((element, lt + closing.len()));
        }
        if let Some(open) = open_tag_at(source, lt) {
            if open.self_closing {
                element.children.push(Element {
                    tag: open.name.to_string(),
                    ..Element::default()
                });
                pos = open.end;
                continue;
            }
            let scope_end = source[open.end..]
                .find(&closing)
                .map(|offset| open.end + offset)
                .unwrap_or(source.len());
            let child_closing = format!("</{}>", open.name);
            if source[open.end..scope_end].contains(&child_closing) {
                if let Some((child, end)) = parse_body(source, open.name, open.end) {
                    element.children.push(child);
                    pos = end;
                    continue;
                }
            }
        }
        element.text.push('<');
        pos = lt + 1;
    }
}
