use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Range;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::edits::EditPlan;
use crate::service::WikiContentService;

static CATEGORY_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\[[ \t]*category[ \t]*:[ \t]*([^\]\|\n]+?)[ \t]*(?:\|[^\]\n]*)?\]\]")
        .expect("category link pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLink {
    pub name: String,
    pub span: Range<usize>,
}

/// What one reconciliation pass decided, with the edits that realise it.
#[derive(Debug, Clone, Default)]
pub struct CategoryPlan {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Satisfied categories left alone because they are not leaf categories.
    pub retained: Vec<String>,
    pub edits: EditPlan,
}

impl CategoryPlan {
    pub fn is_noop(&self) -> bool {
        self.edits.is_empty()
    }
}

/// Adds "needs" categories for missing parameters and removes satisfied ones.
///
/// Only leaf categories are ever removed: a broader category may be owned by
/// several checks, and one of them being satisfied says nothing about the rest.
#[derive(Debug, Clone, Default)]
pub struct CategoryReconciler {
    leaf_categories: BTreeSet<String>,
}

impl CategoryReconciler {
    pub fn new<I, S>(leaf_categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            leaf_categories: leaf_categories
                .into_iter()
                .map(|name| normalize_category_name(name.as_ref()))
                .collect(),
        }
    }

    pub fn is_leaf(&self, category: &str) -> bool {
        self.leaf_categories
            .contains(&normalize_category_name(category))
    }

    pub fn leaf_categories(&self) -> &BTreeSet<String> {
        &self.leaf_categories
    }

    pub fn reconcile(
        &self,
        text: &str,
        missing_params: &BTreeSet<String>,
        current_categories: &BTreeSet<String>,
        requirement_map: &BTreeMap<String, String>,
    ) -> Result<String> {
        let plan = self.plan(text, missing_params, current_categories, requirement_map);
        plan.edits
            .apply(text)
            .context("failed to apply category edits")
    }

    pub fn plan(
        &self,
        text: &str,
        missing_params: &BTreeSet<String>,
        current_categories: &BTreeSet<String>,
        requirement_map: &BTreeMap<String, String>,
    ) -> CategoryPlan {
        let needed = categories_needed(missing_params, requirement_map);
        let links = category_links(text);
        let mut present: BTreeSet<String> = current_categories
            .iter()
            .map(|name| normalize_category_name(name))
            .collect();
        present.extend(links.iter().map(|link| link.name.clone()));

        let mut plan = CategoryPlan::default();

        let owned = requirement_map
            .values()
            .map(|name| normalize_category_name(name))
            .collect::<BTreeSet<_>>();
        let mut removals = Vec::new();
        for category in owned {
            if !present.contains(&category) || needed.contains(&category) {
                continue;
            }
            if !self.is_leaf(&category) {
                plan.retained.push(category);
                continue;
            }
            let matching = links
                .iter()
                .filter(|link| link.name == category)
                .collect::<Vec<_>>();
            if matching.is_empty() {
                debug!(category = %category, "satisfied category is not linked in page text");
                continue;
            }
            removals.extend(matching.iter().map(|link| removal_range(text, &link.span)));
            plan.removed.push(category);
        }
        let mut removals = merge_removals(text, removals);

        let additions = needed
            .iter()
            .filter(|category| !present.contains(*category))
            .cloned()
            .collect::<Vec<_>>();
        if !additions.is_empty() {
            let (offset, rendered) = render_additions(text, &links, &additions);
            // A removal that swallowed the newline before the insert point
            // becomes one replacement ending at end of text.
            match removals
                .iter()
                .position(|range| range.start < offset && offset < range.end)
            {
                Some(index) => {
                    let range = removals.remove(index);
                    let lead = &text[range.start..offset];
                    let body = rendered.strip_suffix('\n').unwrap_or(rendered.as_str());
                    plan.edits.replace(range, format!("{lead}{body}"));
                }
                None => plan.edits.insert(offset, rendered),
            }
            plan.added = additions;
        }
        for range in removals {
            plan.edits.delete(range);
        }

        plan
    }
}

/// Categories required by at least one missing parameter.
pub fn categories_needed(
    missing_params: &BTreeSet<String>,
    requirement_map: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    missing_params
        .iter()
        .filter_map(|param| requirement_map.get(param))
        .map(|name| normalize_category_name(name))
        .collect()
}

pub fn category_links(text: &str) -> Vec<CategoryLink> {
    CATEGORY_LINK
        .captures_iter(text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let name = normalize_category_name(captures.get(1)?.as_str());
            if name.is_empty() {
                return None;
            }
            Some(CategoryLink {
                name,
                span: whole.range(),
            })
        })
        .collect()
}

pub fn categories_in_text(text: &str) -> BTreeSet<String> {
    category_links(text)
        .into_iter()
        .map(|link| link.name)
        .collect()
}

/// Category names compare like page titles: `_` is a space, whitespace runs
/// collapse, an optional `Category:` prefix is dropped and the first letter is
/// upper-cased.
pub fn normalize_category_name(name: &str) -> String {
    let collapsed = name
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let body = match collapsed.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("Category") => rest.trim(),
        _ => collapsed.as_str(),
    };
    let mut chars = body.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn render_category_link(name: &str) -> String {
    format!("[[Category:{name}]]")
}

/// Walk the subcategory tree below `root` and return every category that has
/// no subcategories of its own.
pub fn discover_leaf_categories(
    service: &mut dyn WikiContentService,
    root: &str,
) -> Result<BTreeSet<String>> {
    let root = normalize_category_name(root);
    let mut leaves = BTreeSet::new();
    let mut visited = BTreeSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(category) = queue.pop_front() {
        let members = service
            .list_category_members(&category, false)
            .with_context(|| format!("failed to list members of Category:{category}"))?;
        let subcategories = members
            .iter()
            .filter(|title| is_category_title(title))
            .map(|title| normalize_category_name(title))
            .collect::<Vec<_>>();

        if subcategories.is_empty() && category != root {
            leaves.insert(category);
            continue;
        }
        for subcategory in subcategories {
            if visited.insert(subcategory.clone()) {
                queue.push_back(subcategory);
            }
        }
    }

    debug!(root = %root, leaves = leaves.len(), "discovered leaf categories");
    Ok(leaves)
}

pub fn is_category_title(title: &str) -> bool {
    title
        .split_once(':')
        .is_some_and(|(prefix, _)| prefix.trim().eq_ignore_ascii_case("Category"))
}

/// Insert position and text for new category links: in front of a trailing
/// block of category lines if the page has one, otherwise at end of text.
fn render_additions(text: &str, links: &[CategoryLink], additions: &[String]) -> (usize, String) {
    let rendered = additions
        .iter()
        .map(|name| render_category_link(name))
        .collect::<Vec<_>>();

    if let Some(block_start) = trailing_category_block_start(text, links) {
        let mut output = rendered.join("\n");
        output.push('\n');
        return (block_start, output);
    }

    let mut output = String::new();
    if !text.is_empty() && !text.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&rendered.join("\n"));
    if text.ends_with('\n') {
        output.push('\n');
    }
    (text.len(), output)
}

fn trailing_category_block_start(text: &str, links: &[CategoryLink]) -> Option<usize> {
    let mut block_start = None;
    let mut line_end = text.len();

    loop {
        let before = &text[..line_end];
        let trimmed_end = before.trim_end_matches(['\n', '\r']);
        let line_start = trimmed_end.rfind('\n').map_or(0, |index| index + 1);
        let line = &text[line_start..trimmed_end.len()];

        if line.trim().is_empty() {
            if line_start == 0 {
                break;
            }
        } else if line_is_only_category_links(line, line_start, links) {
            block_start = Some(line_start);
        } else {
            break;
        }

        if line_start == 0 {
            break;
        }
        line_end = line_start;
    }

    block_start
}

fn line_is_only_category_links(line: &str, line_start: usize, links: &[CategoryLink]) -> bool {
    let line_end = line_start + line.len();
    let mut cursor = line_start;
    let mut saw_link = false;
    for link in links
        .iter()
        .filter(|link| link.span.start >= line_start && link.span.end <= line_end)
    {
        let gap = &line[cursor - line_start..link.span.start - line_start];
        if !gap.trim().is_empty() {
            return false;
        }
        cursor = link.span.end;
        saw_link = true;
    }
    saw_link && line[cursor - line_start..].trim().is_empty()
}

/// The link itself, or its whole line with the line's own newline when
/// nothing else is on that line.
fn removal_range(text: &str, span: &Range<usize>) -> Range<usize> {
    let line_start = text[..span.start].rfind('\n').map_or(0, |index| index + 1);
    let line_end = text[span.end..]
        .find('\n')
        .map_or(text.len(), |index| span.end + index);
    let alone = text[line_start..span.start].trim().is_empty()
        && text[span.end..line_end].trim().is_empty();
    if !alone {
        return span.clone();
    }
    if line_end < text.len() {
        line_start..line_end + 1
    } else {
        line_start..line_end
    }
}

/// Sort and join touching ranges. A whole-line removal that runs to the end
/// of a text without a trailing newline also takes the newline before it.
fn merge_removals(text: &str, mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    ranges.sort_by_key(|range| (range.start, range.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    if let Some(last) = merged.last_mut()
        && last.end == text.len()
        && last.start > 0
        && !text.ends_with('\n')
        && text[..last.start].ends_with('\n')
    {
        last.start -= 1;
    }
    merged
}
