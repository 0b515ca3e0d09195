//! Cross-checks between an item page and the pages that mention it.
//!
//! A page states its own relations (`from=`, `recipe=`, `granted_by=`), and
//! other pages state the same relations from the far side (drop tables,
//! recipes, granting items). The checks here diff the two views; callers
//! decide per check whether a difference is only reported or rewritten.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::cache::{RosterEntry, fetch_optional};
use crate::categories::normalize_category_name;
use crate::config::BotSection;
use crate::service::WikiContentService;
use crate::template::{ParameterMap, find_templates, link_spans, template_names_match};

pub const RECIPE_TEMPLATE: &str = "Tech Lab Recipe";

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|\n").expect("line break pattern is valid"));

static TIME_TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([A-Za-z]*)").expect("time term pattern is valid")
});

/// Where a reverse reference was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClaimOrigin {
    /// The source page hands the item out through this template.
    Template(String),
    /// The source page is in a source category and links the item.
    Category(String),
}

/// "item X is obtainable from page Y".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceClaim {
    pub item: String,
    pub source: String,
    pub origin: ClaimOrigin,
}

/// Everything other pages say about one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseReferences {
    pub sources: Vec<SourceClaim>,
    /// Recipe pages whose `result=` is the item.
    pub recipes: Vec<String>,
    /// Pages whose `grants=` lists the item.
    pub grantors: Vec<String>,
}

impl ReverseReferences {
    pub fn source_titles(&self) -> Vec<String> {
        self.sources.iter().map(|claim| claim.source.clone()).collect()
    }
}

/// Set difference between what a page claims and what other pages corroborate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimReport {
    /// Found through reverse references but not claimed on the page.
    pub missing_from_page: Vec<String>,
    /// Claimed on the page but not corroborated. Advisory only.
    pub unverified_on_page: Vec<String>,
}

impl ClaimReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_page.is_empty() && self.unverified_on_page.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatMismatch {
    pub parameter: String,
    pub on_page: Option<String>,
    pub on_faction: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LieutenantReport {
    pub listed: bool,
    pub mismatches: Vec<StatMismatch>,
}

/// Split a source list into its entries. Entries are separated by `<br/>`
/// (any spelling), newlines or `*` list markers outside links.
pub fn parse_source_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    for line in LINE_BREAK.split(value) {
        let masked = link_spans(line);
        let mut start = 0usize;
        for (index, byte) in line.bytes().enumerate() {
            if byte == b'*' && !masked.iter().any(|span| span.contains(&index)) {
                push_entry(&mut entries, &line[start..index]);
                start = index + 1;
            }
        }
        push_entry(&mut entries, &line[start..]);
    }
    entries
}

fn push_entry(entries: &mut Vec<String>, raw: &str) {
    let entry = raw.trim();
    if !entry.is_empty() && entry != "?" {
        entries.push(entry.to_string());
    }
}

/// Target of a `[[Target|label]]` link, or the trimmed text when it is not one.
pub fn link_target(value: &str) -> &str {
    let trimmed = value.trim();
    let Some(inner) = trimmed
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
    else {
        return trimmed;
    };
    let target = inner.split_once('|').map_or(inner, |(target, _)| target);
    target.trim()
}

/// Page titles compare with `_` as space and a case-insensitive first letter.
pub fn titles_match(left: &str, right: &str) -> bool {
    let left = left.replace('_', " ");
    let right = right.replace('_', " ");
    let left = left.split_whitespace().collect::<Vec<_>>().join(" ");
    let right = right.split_whitespace().collect::<Vec<_>>().join(" ");
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

/// Whether two drop-list entries name the same page: `[[Foo]]` equals `Foo`,
/// and the first character is case-insensitive.
pub fn drop_params_match(left: &str, right: &str) -> bool {
    titles_match(link_target(left), link_target(right))
}

/// Whether two durations are the same: equal numerals with `d` matching any
/// unit containing "day" and `hr…` matching any unit containing "hour".
pub fn time_params_match(left: &str, right: &str) -> bool {
    let left_terms = time_terms(left);
    let right_terms = time_terms(right);
    if left_terms.is_empty() || right_terms.is_empty() {
        return left.trim().eq_ignore_ascii_case(right.trim());
    }
    left_terms == right_terms
}

fn time_terms(value: &str) -> Vec<(String, String)> {
    TIME_TERM
        .captures_iter(value)
        .filter_map(|captures| {
            let amount = captures.get(1)?.as_str().to_string();
            let unit = captures.get(2).map_or("", |unit| unit.as_str());
            Some((amount, canonical_time_unit(unit)))
        })
        .collect()
}

fn canonical_time_unit(unit: &str) -> String {
    let unit = unit.to_ascii_lowercase();
    if unit == "d" || unit.contains("day") {
        "day".to_string()
    } else if unit.starts_with("hr") || unit == "h" || unit.contains("hour") {
        "hour".to_string()
    } else if unit == "m" || unit.starts_with("min") {
        "minute".to_string()
    } else {
        unit
    }
}

/// Compare claimed entries with corroborated titles.
pub fn check_sources(claimed: &[String], found: &[String]) -> ClaimReport {
    let mut report = ClaimReport::default();
    for source in found {
        let already_claimed = claimed.iter().any(|entry| drop_params_match(entry, source));
        let already_listed = report
            .missing_from_page
            .iter()
            .any(|entry| drop_params_match(entry, source));
        if !already_claimed && !already_listed {
            report.missing_from_page.push(link_target(source).to_string());
        }
    }
    for entry in claimed {
        if !found.iter().any(|source| drop_params_match(entry, source)) {
            report.unverified_on_page.push(entry.clone());
        }
    }
    report
}

/// New value for a source list that lacks `missing`.
///
/// With nothing missing the value is returned untouched. A bulleted list is
/// extended in place; anything else (a single bare entry, `<br/>`-separated
/// entries, nothing at all) is promoted to a bulleted list first.
pub fn render_fixed_source_list(current: &str, missing: &[String]) -> String {
    if missing.is_empty() {
        return current.to_string();
    }

    let mut output = String::new();
    if is_bulleted_list(current) {
        output.push('\n');
        output.push_str(current.trim());
    } else {
        for entry in parse_source_list(current) {
            output.push_str("\n*");
            output.push_str(&entry);
        }
    }
    for source in missing {
        output.push_str("\n*[[");
        output.push_str(link_target(source));
        output.push_str("]]");
    }
    output
}

pub fn is_bulleted_list(value: &str) -> bool {
    value.trim_start().starts_with('*')
}

/// Read every page that links to `item` and collect what each says about it.
///
/// Referrers that cannot be read or parsed are skipped; a broken drop table
/// elsewhere should not stop the item page from being checked.
pub fn scan_reverse_references(
    service: &mut dyn WikiContentService,
    item: &str,
    config: &BotSection,
) -> Result<ReverseReferences> {
    let referrers = service
        .find_referencing_pages(item, false)
        .with_context(|| format!("failed to list pages referencing {item}"))?;
    let source_categories = config
        .source_categories
        .iter()
        .map(|name| normalize_category_name(name))
        .collect::<BTreeSet<_>>();

    let mut references = ReverseReferences::default();
    for referrer in referrers {
        if titles_match(&referrer, item) {
            continue;
        }
        let Some(page) = fetch_optional(service, &referrer)? else {
            continue;
        };
        let templates = match find_templates(&page.text) {
            Ok(templates) => templates,
            Err(error) => {
                debug!(title = %referrer, error = %error, "skipping unparsable referrer");
                continue;
            }
        };

        for template in &templates {
            let params = template.parameter_map();
            let is_source_template = config
                .source_templates
                .iter()
                .any(|name| template_names_match(&template.name, name));
            if is_source_template && lists_item(&params, item) {
                push_source(
                    &mut references,
                    item,
                    &referrer,
                    ClaimOrigin::Template(template.name.clone()),
                );
            }
            if template_names_match(&template.name, RECIPE_TEMPLATE)
                && params
                    .get("result")
                    .is_some_and(|result| drop_params_match(result, item))
                && !references.recipes.contains(&referrer)
            {
                references.recipes.push(referrer.clone());
            }
            if params.get("grants").is_some_and(|grants| {
                parse_source_list(grants)
                    .iter()
                    .any(|entry| drop_params_match(entry, item))
            }) && !references.grantors.contains(&referrer)
            {
                references.grantors.push(referrer.clone());
            }
        }

        let category = page
            .categories
            .iter()
            .map(|name| normalize_category_name(name))
            .find(|name| source_categories.contains(name));
        if let Some(category) = category
            && links_to(&page.text, item)
        {
            push_source(&mut references, item, &referrer, ClaimOrigin::Category(category));
        }
    }

    debug!(
        item,
        sources = references.sources.len(),
        recipes = references.recipes.len(),
        grantors = references.grantors.len(),
        "scanned reverse references"
    );
    Ok(references)
}

fn lists_item(params: &ParameterMap, item: &str) -> bool {
    params.entries().iter().any(|entry| {
        entry.is_specified()
            && parse_source_list(&entry.value)
                .iter()
                .any(|value| drop_params_match(value, item))
    })
}

fn links_to(text: &str, item: &str) -> bool {
    link_spans(text)
        .into_iter()
        .any(|span| titles_match(link_target(&text[span]), item))
}

fn push_source(references: &mut ReverseReferences, item: &str, source: &str, origin: ClaimOrigin) {
    if references
        .sources
        .iter()
        .any(|claim| titles_match(&claim.source, source))
    {
        return;
    }
    references.sources.push(SourceClaim {
        item: item.to_string(),
        source: source.to_string(),
        origin,
    });
}

/// Compare a lieutenant's own stats with its row on the faction page.
pub fn check_lieutenant(
    lieutenant: &str,
    params: &ParameterMap,
    roster: &[RosterEntry],
) -> LieutenantReport {
    let Some(entry) = roster
        .iter()
        .find(|entry| titles_match(&entry.name, lieutenant))
    else {
        return LieutenantReport::default();
    };

    let mut report = LieutenantReport {
        listed: true,
        mismatches: Vec::new(),
    };
    let stats = [
        ("rank", entry.rank.as_deref()),
        ("faction_points", entry.faction_points.as_deref()),
    ];
    for (parameter, on_faction) in stats {
        let Some(on_faction) = on_faction else {
            continue;
        };
        let on_page = params.get(parameter);
        if on_page.is_some_and(|value| value.trim() == on_faction.trim()) {
            continue;
        }
        report.mismatches.push(StatMismatch {
            parameter: parameter.to_string(),
            on_page: on_page.map(ToString::to_string),
            on_faction: on_faction.to_string(),
        });
    }
    report
}
