//! `==Heading==` sections: locating a body and finding where appended
//! content belongs. The built-in handlers only edit template parameters and
//! category links, so these are entry points for callers that read or extend
//! section prose.

use std::ops::Range;

const CATEGORY_LINK_PREFIX: &str = "[[category:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: usize,
    pub title: String,
    /// The heading line, without its line terminator.
    pub line: Range<usize>,
    /// First byte after the heading line and its terminator.
    pub body_start: usize,
}

/// Span of a section body, bounded to one pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub start: usize,
    pub end: usize,
    pub level: usize,
}

impl Section {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn text<'a>(&self, page_text: &'a str) -> &'a str {
        &page_text[self.range()]
    }
}

/// Every `==Title==` style heading with its nesting level, in document order.
pub fn headings(text: &str) -> Vec<Heading> {
    let mut out = Vec::new();
    let mut line_start = 0usize;

    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        if let Some((level, title)) = parse_heading_line(content) {
            out.push(Heading {
                level,
                title,
                line: line_start..line_start + content.len(),
                body_start: line_end,
            });
        }
        line_start = line_end;
    }

    out
}

/// Locate the body of the first section titled `title` (case-insensitive).
///
/// The body runs from the end of the heading line to the first following
/// heading, template opening or category link. A run of trailing newlines is
/// collapsed to a single one.
pub fn locate_section(text: &str, title: &str) -> Option<Section> {
    let wanted = title.trim().to_lowercase();
    let all = headings(text);
    let heading = all
        .iter()
        .find(|heading| heading.title.to_lowercase() == wanted)?;

    let start = heading.body_start;
    let next_heading = all
        .iter()
        .map(|candidate| candidate.line.start)
        .find(|offset| *offset >= start);
    let lowered = text[start..].to_ascii_lowercase();
    let next_template = text[start..].find("{{").map(|offset| start + offset);
    let next_category = lowered
        .find(CATEGORY_LINK_PREFIX)
        .map(|offset| start + offset);

    let mut end = [next_heading, next_template, next_category]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(text.len());
    while end > start + 1 && text[..end].ends_with("\n\n") {
        end -= 1;
    }

    Some(Section {
        start,
        end,
        level: heading.level,
    })
}

/// Offset at which content belonging at the end of section `title` should be
/// inserted: the next heading at the same or a higher level, or end of text.
pub fn section_insertion_point(text: &str, title: &str) -> Option<usize> {
    let wanted = title.trim().to_lowercase();
    let all = headings(text);
    let index = all
        .iter()
        .position(|heading| heading.title.to_lowercase() == wanted)?;
    Some(next_heading_at_or_above(&all, index).unwrap_or(text.len()))
}

/// Line start of the first heading after `all[index]` whose level is the same
/// or higher (fewer `=`). [`section_insertion_point`] builds on this; callers
/// holding a [`headings`] list can use it directly.
pub fn next_heading_at_or_above(all: &[Heading], index: usize) -> Option<usize> {
    let level = all.get(index)?.level;
    all[index + 1..]
        .iter()
        .find(|heading| heading.level <= level)
        .map(|heading| heading.line.start)
}

fn parse_heading_line(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_end();
    if !trimmed.starts_with("==") || !trimmed.ends_with("==") {
        return None;
    }

    let leading = trimmed.chars().take_while(|ch| *ch == '=').count();
    let trailing = trimmed.chars().rev().take_while(|ch| *ch == '=').count();
    if leading + trailing >= trimmed.len() {
        return None;
    }
    let level = leading.min(trailing).min(6);
    if level < 2 {
        return None;
    }

    let title = trimmed[level..trimmed.len() - level].trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{headings, locate_section, next_heading_at_or_above, section_insertion_point};

    #[test]
    fn section_stops_before_template() {
        let text = "==Foo==\nbar\n{{Baz}}";
        let section = locate_section(text, "Foo").expect("section");
        assert_eq!(section.text(text), "bar\n");
        assert_eq!(section.level, 2);
    }

    #[test]
    fn section_matches_case_insensitively_and_stops_at_next_heading() {
        let text = "intro\n== Drops ==\n*[[A]]\n*[[B]]\n\n\n===Notes===\nx\n";
        let section = locate_section(text, "drops").expect("section");
        assert_eq!(section.text(text), "*[[A]]\n*[[B]]\n");
    }

    #[test]
    fn section_stops_at_category_link() {
        let text = "==Trivia==\nfun fact\n[[category:Items]]";
        let section = locate_section(text, "Trivia").expect("section");
        assert_eq!(section.text(text), "fun fact\n");
    }

    #[test]
    fn section_runs_to_end_of_text_without_terminator() {
        let text = "==Trivia==\nlast words";
        let section = locate_section(text, "Trivia").expect("section");
        assert_eq!(section.text(text), "last words");
    }

    #[test]
    fn missing_section_is_none() {
        assert!(locate_section("==Other==\ntext", "Trivia").is_none());
        assert!(locate_section("plain text", "Trivia").is_none());
    }

    #[test]
    fn headings_report_levels_and_skip_non_headings() {
        let text = "=Top=\n==A==\n===B===\n== C ==\nnot == a heading ==x\n====\n";
        let found = headings(text);
        let summary = found
            .iter()
            .map(|heading| (heading.level, heading.title.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![(2, "A"), (3, "B"), (2, "C")]);
    }

    #[test]
    fn insertion_point_skips_deeper_subsections() {
        let text = "==A==\na\n===A1===\nx\n==B==\nb\n";
        let all = headings(text);
        assert_eq!(next_heading_at_or_above(&all, 0), text.find("==B=="));
        assert_eq!(section_insertion_point(text, "A"), text.find("==B=="));
        assert_eq!(section_insertion_point(text, "B"), Some(text.len()));
        assert_eq!(section_insertion_point(text, "Z"), None);
    }
}
