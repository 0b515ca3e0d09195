//! Template invocation scanning and parameter extraction.
//!
//! Only the subset of wikitext the bots rely on is understood: `{{Name|...}}`
//! invocations whose parameters are split on top-level `|`. Pipes inside
//! `[[link|label]]` markup never split a parameter. Templates nested inside a
//! parameter value are matched for brace balance but their pipes are not
//! protected, so such values come back fragmented.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::error::PageError;

/// Values that count as "present but unspecified".
const UNSPECIFIED_VALUES: [&str; 2] = ["", "?"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawParameter {
    /// Raw text between the delimiting pipes, untrimmed.
    pub text: String,
    /// Byte span of `text` within the scanned page text.
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInvocation {
    pub name: String,
    /// Span from the opening `{{` to just past the closing `}}`.
    pub span: Range<usize>,
    pub parameters: Vec<RawParameter>,
}

impl TemplateInvocation {
    pub fn raw_parameters(&self) -> Vec<String> {
        self.parameters
            .iter()
            .map(|parameter| parameter.text.clone())
            .collect()
    }

    pub fn parameter_map(&self) -> ParameterMap {
        ParameterMap::from_raw(&self.parameters)
    }

    pub fn is_named(&self, name: &str) -> bool {
        template_names_match(&self.name, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterEntry {
    pub name: String,
    /// Trimmed value, sentinels left untouched.
    pub value: String,
    /// Byte span of the trimmed value within the page text. Empty values get a
    /// zero-width span just after the `=`.
    pub value_span: Range<usize>,
}

impl ParameterEntry {
    pub fn is_specified(&self) -> bool {
        !UNSPECIFIED_VALUES.contains(&self.value.as_str())
    }
}

/// Name → value view of one invocation, built once and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: Vec<ParameterEntry>,
}

impl ParameterMap {
    pub fn from_raw(parameters: &[RawParameter]) -> Self {
        let mut positional = 0usize;
        let entries = parameters
            .iter()
            .map(|parameter| parse_entry(parameter, &mut positional))
            .collect();
        Self { entries }
    }

    /// First entry with this name, sentinel values included.
    pub fn entry(&self, name: &str) -> Option<&ParameterEntry> {
        let wanted = name.trim();
        self.entries.iter().find(|entry| entry.name == wanted)
    }

    /// First value for `name`, or `None` when missing or unspecified.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .filter(|entry| entry.is_specified())
            .map(|entry| entry.value.as_str())
    }

    pub fn is_specified(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn entries(&self) -> &[ParameterEntry] {
        &self.entries
    }

    pub fn missing<'a, I>(&self, required: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        required
            .into_iter()
            .filter(|name| !self.is_specified(name))
            .map(ToString::to_string)
            .collect()
    }
}

/// Split the raw text of one invocation (`{{` through `}}`) into its raw
/// parameter strings, template name excluded.
pub fn extract_parameters(invocation: &str) -> Result<Vec<String>, PageError> {
    let template = parse_invocation_at(invocation, 0)?;
    Ok(template.raw_parameters())
}

/// First raw parameter named `name`, with `""` and `?` reported as absent.
pub fn param_value<'a>(parameters: &'a [String], name: &str) -> Option<&'a str> {
    let wanted = name.trim();
    parameters
        .iter()
        .filter_map(|raw| raw.split_once('='))
        .find(|(key, _)| key.trim() == wanted)
        .map(|(_, value)| value.trim())
        .filter(|value| !UNSPECIFIED_VALUES.contains(value))
}

pub fn render_template(name: &str, parameters: &[String]) -> String {
    let mut output = String::with_capacity(name.len() + 4);
    output.push_str("{{");
    output.push_str(name);
    for parameter in parameters {
        output.push('|');
        output.push_str(parameter);
    }
    output.push_str("}}");
    output
}

/// Every top-level invocation in `text`, in document order.
pub fn find_templates(text: &str) -> Result<Vec<TemplateInvocation>, PageError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            let template = parse_invocation_at(text, cursor)?;
            cursor = template.span.end;
            out.push(template);
            continue;
        }
        if bytes[cursor] == b'}' && bytes[cursor + 1] == b'}' {
            return Err(PageError::parse_failure(cursor, "unmatched `}}`"));
        }
        cursor += 1;
    }

    Ok(out)
}

pub fn find_template(text: &str, name: &str) -> Result<Option<TemplateInvocation>, PageError> {
    Ok(find_templates(text)?
        .into_iter()
        .find(|template| template.is_named(name)))
}

/// MediaWiki title comparison for template names: underscores are spaces,
/// whitespace runs collapse, the first letter is case-insensitive and a
/// `Template:` prefix is ignored.
pub fn template_names_match(left: &str, right: &str) -> bool {
    let left = normalize_template_name(left);
    let right = normalize_template_name(right);
    let mut left_chars = left.chars();
    let mut right_chars = right.chars();
    match (left_chars.next(), right_chars.next()) {
        (Some(a), Some(b)) => {
            a.to_lowercase().eq(b.to_lowercase()) && left_chars.as_str() == right_chars.as_str()
        }
        (None, None) => true,
        _ => false,
    }
}

pub fn normalize_template_name(name: &str) -> String {
    let collapsed = name
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    match collapsed.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("Template") => {
            rest.trim().to_string()
        }
        _ => collapsed,
    }
}

/// Byte spans of every `[[...]]` link in `text`, without nesting.
pub(crate) fn link_spans(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'[' && bytes[cursor + 1] == b'[' {
            let start = cursor;
            let mut end = cursor + 2;
            while end + 1 < bytes.len() && !(bytes[end] == b']' && bytes[end + 1] == b']') {
                end += 1;
            }
            if end + 1 >= bytes.len() {
                break;
            }
            out.push(start..end + 2);
            cursor = end + 2;
            continue;
        }
        cursor += 1;
    }

    out
}

fn parse_invocation_at(text: &str, start: usize) -> Result<TemplateInvocation, PageError> {
    let bytes = text.as_bytes();
    if !text[start..].starts_with("{{") {
        return Err(PageError::parse_failure(start, "expected `{{`"));
    }

    let mut depth = 1usize;
    let mut cursor = start + 2;
    let mut close = None;
    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            depth += 1;
            cursor += 2;
        } else if bytes[cursor] == b'}' && bytes[cursor + 1] == b'}' {
            depth -= 1;
            if depth == 0 {
                close = Some(cursor);
                break;
            }
            cursor += 2;
        } else {
            cursor += 1;
        }
    }
    let close = close.ok_or_else(|| PageError::parse_failure(start, "unclosed `{{`"))?;

    let body_start = start + 2;
    let fragments = split_top_level(&text[body_start..close]);
    let mut fragments = fragments
        .into_iter()
        .map(|range| (range.start + body_start)..(range.end + body_start));
    let name_range = fragments.next().unwrap_or(body_start..body_start);
    let name = normalize_template_name(&text[name_range]);
    if name.is_empty() {
        return Err(PageError::parse_failure(start, "template without a name"));
    }

    let parameters = fragments
        .map(|span| RawParameter {
            text: text[span.clone()].to_string(),
            span,
        })
        .collect();

    Ok(TemplateInvocation {
        name,
        span: start..close + 2,
        parameters,
    })
}

/// Split on `|`, masking pipes that sit inside `[[...]]` links.
fn split_top_level(body: &str) -> Vec<Range<usize>> {
    let masked = link_spans(body);
    let mut out = Vec::new();
    let mut fragment_start = 0usize;

    for (index, byte) in body.bytes().enumerate() {
        if byte != b'|' {
            continue;
        }
        if masked.iter().any(|span| span.contains(&index)) {
            continue;
        }
        out.push(fragment_start..index);
        fragment_start = index + 1;
    }
    out.push(fragment_start..body.len());
    out
}

fn parse_entry(parameter: &RawParameter, positional: &mut usize) -> ParameterEntry {
    let raw = parameter.text.as_str();
    let (name, value_offset) = match named_split(raw) {
        Some(eq_index) => (raw[..eq_index].trim().to_string(), eq_index + 1),
        None => {
            *positional += 1;
            (positional.to_string(), 0)
        }
    };

    let value_raw = &raw[value_offset..];
    let leading = value_raw.len() - value_raw.trim_start().len();
    let value = value_raw.trim();
    let value_start = parameter.span.start + value_offset + leading;
    ParameterEntry {
        name,
        value: value.to_string(),
        value_span: value_start..value_start + value.len(),
    }
}

/// Index of the `=` that separates a named parameter, if any. An `=` that
/// only appears inside a link does not make the parameter named.
fn named_split(raw: &str) -> Option<usize> {
    let masked = link_spans(raw);
    raw.bytes()
        .enumerate()
        .find(|(index, byte)| *byte == b'=' && !masked.iter().any(|span| span.contains(index)))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::{
        extract_parameters, find_template, find_templates, param_value, render_template,
        template_names_match,
    };

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn extract_keeps_pipes_inside_links() {
        let raw = "{{Item|name=Iron Pipe|from=[[Crate of Doom|the crate]]<br/>[[Boss]]|image=?}}";
        let params = extract_parameters(raw).expect("extract");
        assert_eq!(
            params,
            strings(&[
                "name=Iron Pipe",
                "from=[[Crate of Doom|the crate]]<br/>[[Boss]]",
                "image=?"
            ])
        );
    }

    #[test]
    fn render_then_extract_round_trips() {
        let cases = [
            strings(&["name=Foo", "from=[[A]]", "cost=100"]),
            strings(&[" spaced = value ", "2", ""]),
            strings(&["link=[[Target]] and [[Other]]"]),
        ];
        for params in cases {
            let rendered = render_template("Item", &params);
            assert_eq!(extract_parameters(&rendered).expect("extract"), params);
        }
    }

    #[test]
    fn param_value_returns_first_match_and_hides_sentinels() {
        let params = strings(&["image=?", "name = Foo ", "name=Bar", "cost=", "from=[[A|a=b]]"]);
        assert_eq!(param_value(&params, "name"), Some("Foo"));
        assert_eq!(param_value(&params, "image"), None);
        assert_eq!(param_value(&params, "cost"), None);
        assert_eq!(param_value(&params, "missing"), None);
        assert_eq!(param_value(&params, "from"), Some("[[A|a=b]]"));
    }

    #[test]
    fn find_templates_reports_spans_and_value_offsets() {
        let text = "intro {{Item\n|name=Foo\n|from=[[A]]\n}} tail {{Other}}";
        let templates = find_templates(text).expect("scan");
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].name, "Item");
        assert_eq!(&text[templates[0].span.clone()], "{{Item\n|name=Foo\n|from=[[A]]\n}}");
        assert_eq!(templates[1].name, "Other");

        let map = templates[0].parameter_map();
        let from = map.entry("from").expect("from entry");
        assert_eq!(from.value, "[[A]]");
        assert_eq!(&text[from.value_span.clone()], "[[A]]");
    }

    #[test]
    fn nested_templates_are_balanced_but_not_listed() {
        let text = "{{Item|cost={{Cash|100}}}}{{Next}}";
        let templates = find_templates(text).expect("scan");
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].span, 0..26);
    }

    #[test]
    fn unbalanced_delimiters_are_parse_failures() {
        let error = find_templates("ok {{Item|name=Foo").expect_err("unclosed");
        assert_eq!(error.reason(), "parse_failure");
        let error = find_templates("ok }} bad").expect_err("unmatched");
        assert_eq!(error.reason(), "parse_failure");
    }

    #[test]
    fn positional_parameters_are_numbered() {
        let text = "{{Drop Table|Foo|[[Bar]]|chance=5%}}";
        let template = find_template(text, "drop Table")
            .expect("scan")
            .expect("template");
        let map = template.parameter_map();
        assert_eq!(map.get("1"), Some("Foo"));
        assert_eq!(map.get("2"), Some("[[Bar]]"));
        assert_eq!(map.get("chance"), Some("5%"));
    }

    #[test]
    fn missing_treats_sentinels_as_absent() {
        let template = find_template("{{Item|image=?|name=Foo|cost=}}", "Item")
            .expect("scan")
            .expect("template");
        let missing = template
            .parameter_map()
            .missing(["image", "name", "cost", "from"]);
        assert_eq!(
            missing.into_iter().collect::<Vec<_>>(),
            strings(&["cost", "from", "image"])
        );
    }

    #[test]
    fn template_names_match_like_titles() {
        assert!(template_names_match("Tech_Lab Recipe", "tech  Lab_Recipe"));
        assert!(template_names_match("Template:Item", "item"));
        assert!(!template_names_match("Item", "ITEM"));
        assert!(!template_names_match("Item", "Items"));
    }
}
