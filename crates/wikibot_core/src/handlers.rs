use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::debug;

use crate::cache::{LookupCaches, fetch_optional};
use crate::config::{BotSection, CheckPolicy};
use crate::crossref::{
    RECIPE_TEMPLATE, ReverseReferences, check_lieutenant, check_sources, drop_params_match,
    link_target, parse_source_list, render_fixed_source_list, scan_reverse_references,
    time_params_match,
};
use crate::edits::EditPlan;
use crate::error::ReconciliationWarning;
use crate::service::WikiContentService;
use crate::template::{ParameterMap, TemplateInvocation, find_template, template_names_match};

static INGREDIENT_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ingredient\d+$").expect("ingredient pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateKind {
    Item,
    Lieutenant,
    Property,
    Class,
    ExecutionMethod,
    District,
    TechLabRecipe,
}

impl TemplateKind {
    /// Key of this kind's `[bot.requirements.<kind>]` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Lieutenant => "lieutenant",
            Self::Property => "property",
            Self::Class => "class",
            Self::ExecutionMethod => "execution_method",
            Self::District => "district",
            Self::TechLabRecipe => "tech_lab_recipe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePattern {
    Exact(&'static str),
    /// The name itself or any `Name Variant` / `Name/Variant`.
    Prefix(&'static str),
}

impl NamePattern {
    pub fn matches(&self, template_name: &str) -> bool {
        match self {
            Self::Exact(name) => template_names_match(template_name, name),
            Self::Prefix(name) => {
                if template_names_match(template_name, name) {
                    return true;
                }
                let Some(head) = template_name.get(..name.len()) else {
                    return false;
                };
                let rest = &template_name[name.len()..];
                template_names_match(head, name) && (rest.starts_with(' ') || rest.starts_with('/'))
            }
        }
    }
}

pub type HandlerFn = fn(&mut HandlerContext<'_>, &TemplateInvocation) -> Result<()>;

pub struct HandlerEntry {
    pub pattern: NamePattern,
    pub kind: TemplateKind,
    pub handler: HandlerFn,
}

/// Template name → handler. Entries are tried in order; the first match wins.
pub static DISPATCH_TABLE: &[HandlerEntry] = &[
    HandlerEntry {
        pattern: NamePattern::Exact(RECIPE_TEMPLATE),
        kind: TemplateKind::TechLabRecipe,
        handler: handle_recipe,
    },
    HandlerEntry {
        pattern: NamePattern::Exact("Lieutenant"),
        kind: TemplateKind::Lieutenant,
        handler: handle_lieutenant,
    },
    HandlerEntry {
        pattern: NamePattern::Exact("Property"),
        kind: TemplateKind::Property,
        handler: categories_only,
    },
    HandlerEntry {
        pattern: NamePattern::Exact("Class"),
        kind: TemplateKind::Class,
        handler: categories_only,
    },
    HandlerEntry {
        pattern: NamePattern::Exact("Execution Method"),
        kind: TemplateKind::ExecutionMethod,
        handler: categories_only,
    },
    HandlerEntry {
        pattern: NamePattern::Exact("District"),
        kind: TemplateKind::District,
        handler: categories_only,
    },
    HandlerEntry {
        pattern: NamePattern::Prefix("Item"),
        kind: TemplateKind::Item,
        handler: handle_item,
    },
];

pub fn lookup_handler(template_name: &str) -> Option<&'static HandlerEntry> {
    DISPATCH_TABLE
        .iter()
        .find(|entry| entry.pattern.matches(template_name))
}

/// The first invocation of each handled template kind, in document order.
/// Later invocations of a kind already selected are ignored.
pub fn select_templates(
    templates: &[TemplateInvocation],
) -> Vec<(&'static HandlerEntry, &TemplateInvocation)> {
    let mut seen = BTreeSet::new();
    templates
        .iter()
        .filter_map(|template| lookup_handler(&template.name).map(|entry| (entry, template)))
        .filter(|(entry, _)| seen.insert(entry.kind))
        .collect()
}

/// State one handler run may read and the edits and warnings it records.
pub struct HandlerContext<'a> {
    pub title: &'a str,
    /// Page text every recorded edit is relative to.
    pub text: &'a str,
    pub service: &'a mut dyn WikiContentService,
    pub caches: &'a mut LookupCaches,
    pub config: &'a BotSection,
    pub edits: EditPlan,
    pub warnings: Vec<ReconciliationWarning>,
    /// Parameters the handler gave a value to.
    pub filled: BTreeSet<String>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        title: &'a str,
        text: &'a str,
        service: &'a mut dyn WikiContentService,
        caches: &'a mut LookupCaches,
        config: &'a BotSection,
    ) -> Self {
        Self {
            title,
            text,
            service,
            caches,
            config,
            edits: EditPlan::new(),
            warnings: Vec::new(),
            filled: BTreeSet::new(),
        }
    }

    pub fn policy(&self, check: &str) -> CheckPolicy {
        self.config.policy(check)
    }

    pub fn warn(&mut self, check: &str, message: impl Into<String>) {
        let warning = ReconciliationWarning::new(self.title, check, message);
        debug!(title = %self.title, check, message = %warning.message, "reconciliation warning");
        self.warnings.push(warning);
    }

    /// Record an edit that gives `name` the value `value`, appending the
    /// parameter when the invocation lacks it.
    pub fn set_parameter(&mut self, template: &TemplateInvocation, name: &str, value: &str) {
        let params = template.parameter_map();
        match params.entry(name) {
            Some(entry) => self.edits.replace(entry.value_span.clone(), value),
            None => {
                let close = template.span.end - 2;
                let rendered = if self.text[template.span.start..close].ends_with('\n') {
                    format!("|{name}={value}\n")
                } else {
                    format!("|{name}={value}")
                };
                self.edits.insert(close, rendered);
            }
        }
        self.filled.insert(name.to_string());
    }
}

fn categories_only(_ctx: &mut HandlerContext<'_>, _template: &TemplateInvocation) -> Result<()> {
    Ok(())
}

fn handle_item(ctx: &mut HandlerContext<'_>, template: &TemplateInvocation) -> Result<()> {
    let params = template.parameter_map();
    let references = scan_reverse_references(ctx.service, ctx.title, ctx.config)?;

    reconcile_sources(ctx, template, &params, &references);
    check_recipe(ctx, template, &params, &references)?;
    reconcile_grantors(ctx, template, &params, &references);
    Ok(())
}

fn reconcile_sources(
    ctx: &mut HandlerContext<'_>,
    template: &TemplateInvocation,
    params: &ParameterMap,
    references: &ReverseReferences,
) {
    let current = params.entry("from").map_or("", |entry| entry.value.as_str());
    let claimed = parse_source_list(current);
    let report = check_sources(&claimed, &references.source_titles());

    for entry in &report.unverified_on_page {
        ctx.warn(
            "item_sources",
            format!("source {entry} is not corroborated by any referencing page"),
        );
    }
    if report.missing_from_page.is_empty() {
        return;
    }
    match ctx.policy("item_sources") {
        CheckPolicy::Fix => {
            let value = render_fixed_source_list(current, &report.missing_from_page);
            ctx.set_parameter(template, "from", &value);
        }
        CheckPolicy::Report => {
            for source in &report.missing_from_page {
                ctx.warn("item_sources", format!("{source} drops this item but is not listed"));
            }
        }
    }
}

fn check_recipe(
    ctx: &mut HandlerContext<'_>,
    template: &TemplateInvocation,
    params: &ParameterMap,
    references: &ReverseReferences,
) -> Result<()> {
    let Some(claimed) = params.get("recipe").map(link_target) else {
        let Some(recipe) = references.recipes.first() else {
            return Ok(());
        };
        match ctx.policy("recipe_result") {
            CheckPolicy::Fix => ctx.set_parameter(template, "recipe", &format!("[[{recipe}]]")),
            CheckPolicy::Report => {
                ctx.warn("recipe_result", format!("{recipe} produces this item but recipe= is empty"))
            }
        }
        return Ok(());
    };

    let Some(page) = fetch_optional(ctx.service, claimed)? else {
        ctx.warn("recipe_result", format!("recipe page {claimed} does not exist"));
        return Ok(());
    };
    let recipe = find_template(&page.text, RECIPE_TEMPLATE)
        .map_err(|error| error.for_title(&page.title))?;
    let Some(recipe) = recipe else {
        ctx.warn("recipe_result", format!("{claimed} has no {RECIPE_TEMPLATE} template"));
        return Ok(());
    };

    let recipe_params = recipe.parameter_map();
    let produces_item = recipe_params
        .get("result")
        .is_some_and(|result| drop_params_match(result, ctx.title));
    if !produces_item {
        ctx.warn(
            "recipe_result",
            format!("{claimed} does not list this item as its result"),
        );
    }
    if let (Some(on_page), Some(on_recipe)) = (params.get("craft_time"), recipe_params.get("time"))
        && !time_params_match(on_page, on_recipe)
    {
        ctx.warn(
            "recipe_result",
            format!("craft_time {on_page} differs from {claimed} time {on_recipe}"),
        );
    }
    Ok(())
}

fn reconcile_grantors(
    ctx: &mut HandlerContext<'_>,
    template: &TemplateInvocation,
    params: &ParameterMap,
    references: &ReverseReferences,
) {
    let current = params.entry("granted_by").map_or("", |entry| entry.value.as_str());
    let claimed = parse_source_list(current);
    let report = check_sources(&claimed, &references.grantors);

    for entry in &report.unverified_on_page {
        ctx.warn(
            "granting_item",
            format!("{} does not list this item in grants=", link_target(entry)),
        );
    }
    if report.missing_from_page.is_empty() {
        return;
    }
    match ctx.policy("granting_item") {
        CheckPolicy::Fix => {
            let value = render_fixed_source_list(current, &report.missing_from_page);
            ctx.set_parameter(template, "granted_by", &value);
        }
        CheckPolicy::Report => {
            for grantor in &report.missing_from_page {
                ctx.warn(
                    "granting_item",
                    format!("{grantor} grants this item but is not in granted_by="),
                );
            }
        }
    }
}

fn handle_recipe(ctx: &mut HandlerContext<'_>, template: &TemplateInvocation) -> Result<()> {
    let params = template.parameter_map();
    let ingredients = params
        .entries()
        .iter()
        .filter(|entry| INGREDIENT_PARAM.is_match(&entry.name) && entry.is_specified())
        .map(|entry| (entry.name.clone(), link_target(&entry.value).to_string()))
        .collect::<Vec<_>>();

    for (name, ingredient) in ingredients {
        let image_param = format!("{name}_image");
        if params.is_specified(&image_param) {
            continue;
        }
        let Some(image) = ctx.caches.image_for(ctx.service, &ingredient)? else {
            ctx.warn("recipe_images", format!("ingredient {ingredient} has no image"));
            continue;
        };
        match ctx.policy("recipe_images") {
            CheckPolicy::Fix => ctx.set_parameter(template, &image_param, &image),
            CheckPolicy::Report => ctx.warn(
                "recipe_images",
                format!("{image_param} is empty, {ingredient} uses {image}"),
            ),
        }
    }
    Ok(())
}

fn handle_lieutenant(ctx: &mut HandlerContext<'_>, template: &TemplateInvocation) -> Result<()> {
    let params = template.parameter_map();
    let Some(faction) = params.get("faction").map(link_target) else {
        return Ok(());
    };

    let roster = ctx.caches.faction_roster(ctx.service, faction)?;
    let report = check_lieutenant(ctx.title, &params, &roster);
    if !report.listed {
        ctx.warn(
            "lieutenant_faction",
            format!("faction page {faction} does not list this lieutenant"),
        );
        return Ok(());
    }

    let policy = ctx.policy("lieutenant_stats");
    for mismatch in report.mismatches {
        match policy {
            CheckPolicy::Fix => {
                ctx.set_parameter(template, &mismatch.parameter, &mismatch.on_faction)
            }
            CheckPolicy::Report => ctx.warn(
                "lieutenant_stats",
                format!(
                    "{} is {} here but {} on {faction}",
                    mismatch.parameter,
                    mismatch.on_page.as_deref().unwrap_or("unset"),
                    mismatch.on_faction
                ),
            ),
        }
    }
    Ok(())
}
