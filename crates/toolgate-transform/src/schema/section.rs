//! Markdown tool catalogue grammar: `# Tools`, `## <tool>` headings, labelled blocks
//! and indented parameter bullets.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

static TOOLS_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+Tools\b").expect("valid regex"));
static TOP_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\s+").expect("valid regex"));
static TOOL_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##\s+(\w+)[ \t]*\r?$").expect("valid regex"));
static BLOCK_TERMINATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\*\*)?(?:(?:Required |Optional )?Parameters?:|##?\s|Usages?:|(?:Usage )?Examples?(?:\b[\w ]+)?:)",
    )
    .expect("valid regex")
});
static DESCRIPTIVE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\*\*)?(?:Required |Optional )?(?:Description|Parameter)s?:").expect("valid regex")
});
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)-\s*(\w+)\s*:\s*(.*)$").expect("valid regex"));

/// One `## <tool>` entry of the catalogue.
#[derive(Debug, Clone)]
pub(crate) struct ToolDoc<'a> {
    pub name: &'a str,
    pub body: &'a str,
    pub description: String,
    pub bullets: Vec<Bullet>,
    pub samples: Vec<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bullet {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub children: Vec<Bullet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LabelBlock {
    /// Label line through the line before the terminator.
    pub span: Range<usize>,
    pub text: String,
}

/// Byte range of the `# Tools` section, up to the next top-level heading.
pub(crate) fn tools_section(doc: &str) -> Option<Range<usize>> {
    let heading = TOOLS_HEADING.find(doc)?;
    let end = TOP_HEADING
        .find(&doc[heading.end()..])
        .map(|next| heading.end() + next.start())
        .unwrap_or(doc.len());
    Some(heading.start()..end)
}

pub(crate) fn split_tools(section: &str) -> Vec<ToolDoc<'_>> {
    let headings: Vec<_> = TOOL_HEADING.captures_iter(section).collect();
    let mut tools = Vec::with_capacity(headings.len());
    for (position, captures) in headings.iter().enumerate() {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let end = headings
            .get(position + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(section.len());
        tools.push(tool_doc(name.as_str(), &section[whole.end()..end]));
    }
    tools
}

fn tool_doc<'a>(name: &'a str, body: &'a str) -> ToolDoc<'a> {
    let description = label_block(body, "Description:");
    let mut bullets = Vec::new();
    let mut consumed: Vec<Range<usize>> = description.iter().map(|block| block.span.clone()).collect();
    for (label, optional) in [
        ("Parameters:", false),
        ("Required Parameters:", false),
        ("Optional Parameters:", true),
    ] {
        if let Some(block) = label_block(body, label) {
            bullets.extend(parse_bullets(&block.text, optional));
            consumed.push(block.span);
        }
    }
    let samples = find_samples(body, name)
        .into_iter()
        .filter(|range| !consumed.iter().any(|span| span.start <= range.start && range.end <= span.end))
        .map(|range| &body[range])
        .collect();
    ToolDoc {
        name,
        body,
        description: description.map(|block| block.text).unwrap_or_default(),
        bullets,
        samples,
    }
}

/// Finds the first block introduced by `label` at the start of a line, optionally
/// wrapped in `**`. The block ends at the next label line or heading.
pub(crate) fn label_block(body: &str, label: &str) -> Option<LabelBlock> {
    let mut lines = line_spans(body);
    let (start, content_start) = lines.by_ref().find_map(|(offset, line)| {
        let rest = line.strip_prefix("**").unwrap_or(line);
        let after = rest.strip_prefix(label)?;
        let after = after.strip_prefix("**").unwrap_or(after);
        Some((offset, offset + (line.len() - after.len())))
    })?;
    let end = lines
        .find(|(_, line)| BLOCK_TERMINATOR.is_match(line))
        .map(|(offset, _)| offset)
        .unwrap_or(body.len());
    Some(LabelBlock {
        span: start..end,
        text: body[content_start..end].trim().to_string(),
    })
}

/// Removes `Description:` and `Parameters:` style blocks; their text is carried by the
/// synthesized declarations instead.
pub(crate) fn strip_descriptive_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut skipping = false;
    for (offset, line) in line_spans(text) {
        if DESCRIPTIVE_LABEL.is_match(line) {
            skipping = true;
            continue;
        }
        if skipping && BLOCK_TERMINATOR.is_match(line) {
            skipping = false;
        }
        if !skipping {
            let end = (offset + line.len() + 1).min(text.len());
            out.push_str(&text[offset..end]);
        }
    }
    out
}

/// Inserts `paragraph` on its own lines right below the `# Tools` heading.
pub(crate) fn insert_after_tools_heading(text: &str, paragraph: &str) -> String {
    let Some(heading) = TOOLS_HEADING.find(text) else {
        return text.to_string();
    };
    let line_end = text[heading.end()..]
        .find('\n')
        .map(|offset| heading.end() + offset + 1)
        .unwrap_or(text.len());
    let mut out = String::with_capacity(text.len() + paragraph.len() + 2);
    out.push_str(&text[..line_end]);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(paragraph);
    out.push('\n');
    out.push_str(&text[line_end..]);
    out
}

/// `<tool ...> ... </tool>` spans, case-insensitive, shortest match.
pub(crate) fn find_samples(body: &str, tool: &str) -> Vec<Range<usize>> {
    let pattern = format!(r"(?i)<{0}\b[\s\S]*?</{0}>", regex::escape(tool));
    match Regex::new(&pattern) {
        Ok(regex) => regex.find_iter(body).map(|found| found.range()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Parses indented `- name: text` bullets into a forest. Lines that are not bullets
/// continue the description of the previous bullet.
pub(crate) fn parse_bullets(markdown: &str, optional_block: bool) -> Vec<Bullet> {
    let mut roots: Vec<Bullet> = Vec::new();
    // Path of child indices from `roots` to the most recent bullet at each depth.
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for line in markdown.lines().filter(|line| !line.trim().is_empty()) {
        let Some(captures) = BULLET.captures(line) else {
            if let Some(last) = last_bullet(&mut roots, &stack) {
                let joined = format!("{}\n{}", last.description, line.trim());
                last.description = joined.trim().to_string();
            }
            continue;
        };
        let indent = captures[1].replace('\t', "    ").len();
        let raw = captures[3].trim();
        let bullet = Bullet {
            name: captures[2].to_string(),
            description: raw.replace("(required)", "").replace("(Required)", "").trim().to_string(),
            required: !optional_block && !raw.to_lowercase().contains("(optional)"),
            children: Vec::new(),
        };
        while stack.last().is_some_and(|(_, depth_indent)| *depth_indent >= indent) {
            stack.pop();
        }
        let Some(siblings) = children_at(&mut roots, &stack) else {
            continue;
        };
        siblings.push(bullet);
        let index = siblings.len() - 1;
        stack.push((index, indent));
    }
    roots
}

fn children_at<'a>(roots: &'a mut Vec<Bullet>, stack: &[(usize, usize)]) -> Option<&'a mut Vec<Bullet>> {
    let Some(((first, _), rest)) = stack.split_first() else {
        return Some(roots);
    };
    let mut node = roots.get_mut(*first)?;
    for (index, _) in rest {
        node = node.children.get_mut(*index)?;
    }
    Some(&mut node.children)
}

fn last_bullet<'a>(roots: &'a mut [Bullet], stack: &[(usize, usize)]) -> Option<&'a mut Bullet> {
    let ((first, _), rest) = stack.split_first()?;
    let mut node = roots.get_mut(*first)?;
    for (index, _) in rest {
        node = node.children.get_mut(*index)?;
    }
    Some(node)
}

/// Name-keyed (lower-case) descriptions and required flags across the whole forest.
pub(crate) fn bullet_index(bullets: &[Bullet]) -> (HashMap<String, String>, HashSet<String>) {
    fn visit(bullet: &Bullet, descriptions: &mut HashMap<String, String>, required: &mut HashSet<String>) {
        let key = bullet.name.to_lowercase();
        if !bullet.description.is_empty() {
            descriptions.entry(key.clone()).or_insert_with(|| bullet.description.clone());
        }
        if bullet.required {
            required.insert(key);
        }
        for child in &bullet.children {
            visit(child, descriptions, required);
        }
    }
    let mut descriptions = HashMap::new();
    let mut required = HashSet::new();
    for bullet in bullets {
        visit(bullet, &mut descriptions, &mut required);
    }
    (descriptions, required)
}

fn line_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.strip_suffix('\n').unwrap_or(raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOGUE: &str = "Intro text.\n\n# Tools\n\n## read_file\nDescription: Request to read a file.\nParameters:\n- path: (required) The path of the file\n- encoding: (optional) Text encoding\nUsage:\n<read_file>\n<path>File path here</path>\n</read_file>\n\n## attempt_completion\n**Description:** Present the result.\n**Parameters:**\n- result: (required) The result\n\n# Rules\n\nBe nice.\n";

    #[test]
    fn tools_section_stops_at_next_top_level_heading() {
        let range = tools_section(CATALOGUE).expect("section");
        let section = &CATALOGUE[range];
        assert!(section.starts_with("# Tools"));
        assert!(!section.contains("# Rules"));
    }

    #[test]
    fn split_tools_reads_labels_bullets_and_samples() {
        let range = tools_section(CATALOGUE).expect("section");
        let tools = split_tools(&CATALOGUE[range]);
        assert_eq!(tools.len(), 2);

        let read = &tools[0];
        assert_eq!(read.name, "read_file");
        assert_eq!(read.description, "Request to read a file.");
        assert_eq!(read.bullets.len(), 2);
        assert!(read.bullets[0].required);
        assert!(!read.bullets[1].required);
        assert_eq!(read.bullets[0].description, "The path of the file");
        assert_eq!(read.samples, vec!["<read_file>\n<path>File path here</path>\n</read_file>"]);

        let done = &tools[1];
        assert_eq!(done.description, "Present the result.");
        assert_eq!(done.bullets[0].name, "result");
        assert!(done.samples.is_empty());
    }

    #[test]
    fn bullets_nest_by_indentation_and_absorb_continuation_lines() {
        let bullets = parse_bullets(
            "- args: Contains file elements\n  - file: One file\n    - path: (required) File path\n      relative to cwd\n- mode: (optional) Mode",
            false,
        );
        assert_eq!(bullets.len(), 2);
        let path = &bullets[0].children[0].children[0];
        assert_eq!(path.name, "path");
        assert_eq!(path.description, "File path\nrelative to cwd");
        let (descriptions, required) = bullet_index(&bullets);
        assert_eq!(descriptions.get("file").map(String::as_str), Some("One file"));
        assert!(required.contains("path"));
        assert!(!required.contains("mode"));
    }

    #[test]
    fn optional_block_marks_every_bullet_optional() {
        let bullets = parse_bullets("- limit: Maximum lines", true);
        assert!(!bullets[0].required);
    }

    #[test]
    fn strip_descriptive_blocks_keeps_usage() {
        let stripped = strip_descriptive_blocks(
            "## tool\nDescription: Does things\nacross lines\nParameters:\n- a: x\nUsage:\n<tool></tool>\n",
        );
        assert_eq!(stripped, "## tool\nUsage:\n<tool></tool>\n");
    }

    #[test]
    fn label_block_stops_at_example_heading() {
        let block = label_block("Diff format:\n<<<<<<< SEARCH\nx\nExample 1:\nmore", "Diff format:")
            .expect("block");
        assert_eq!(block.text, "<<<<<<< SEARCH\nx");
    }
}
