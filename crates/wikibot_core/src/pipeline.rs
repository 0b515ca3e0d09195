//! Per-page transformation: fetch, check, rewrite, diff, confirm, save.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use similar::{DiffTag, TextDiff};
use tracing::{debug, info, warn};

use crate::cache::LookupCaches;
use crate::categories::{CategoryPlan, CategoryReconciler};
use crate::config::BotSection;
use crate::edits::EditPlan;
use crate::error::{PageError, ReconciliationWarning};
use crate::handlers::{HandlerContext, select_templates};
use crate::service::{FetchedPage, WikiContentService};
use crate::template::{TemplateInvocation, find_templates};

pub const NOWYSIWYG_MARKER: &str = "__NOWYSIWYG__";

/// One page under transformation. Templates are parsed on first use.
#[derive(Debug, Clone)]
pub struct Page {
    pub title: String,
    pub text: String,
    pub categories: BTreeSet<String>,
    templates: Option<Vec<TemplateInvocation>>,
}

impl Page {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            categories: BTreeSet::new(),
            templates: None,
        }
    }

    pub fn templates(&mut self) -> Result<&[TemplateInvocation], PageError> {
        if self.templates.is_none() {
            let parsed = find_templates(&self.text).map_err(|error| error.for_title(&self.title))?;
            self.templates = Some(parsed);
        }
        Ok(self.templates.as_deref().unwrap_or_default())
    }
}

impl From<FetchedPage> for Page {
    fn from(fetched: FetchedPage) -> Self {
        Self {
            title: fetched.title,
            text: fetched.text,
            categories: fetched.categories,
            templates: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageState {
    Fetched,
    TemplatesExtracted,
    CategoriesChecked,
    CrossReferencesChecked,
    Rewritten,
    DiffComputed,
    Confirmed,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// Accept this page and every later one in the batch.
    AcceptAll,
    Reject,
    Skip,
}

pub trait Confirmer {
    fn confirm(&mut self, title: &str, diff: &str) -> Result<Decision>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Confirmed,
    Rejected,
    Skipped,
    Unchanged,
    Failed,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub title: String,
    pub kind: OutcomeKind,
    /// Last state the page reached.
    pub state: PageState,
    pub reason: Option<String>,
    pub diff: Option<String>,
    pub warnings: Vec<ReconciliationWarning>,
}

impl PageOutcome {
    fn new(title: &str, kind: OutcomeKind, state: PageState) -> Self {
        Self {
            title: title.to_string(),
            kind,
            state,
            reason: None,
            diff: None,
            warnings: Vec::new(),
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<PageOutcome>,
}

impl BatchReport {
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.kind == kind)
            .count()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ReconciliationWarning> {
        self.outcomes
            .iter()
            .flat_map(|outcome| outcome.warnings.iter())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} pages: {} confirmed, {} rejected, {} skipped, {} unchanged, {} failed, {} warnings",
            self.outcomes.len(),
            self.count(OutcomeKind::Confirmed),
            self.count(OutcomeKind::Rejected),
            self.count(OutcomeKind::Skipped),
            self.count(OutcomeKind::Unchanged),
            self.count(OutcomeKind::Failed),
            self.warnings().count()
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Compute diffs but never save.
    pub dry_run: bool,
    /// Treat every page as accepted without asking.
    pub assume_yes: bool,
}

pub struct Pipeline<'a> {
    service: &'a mut dyn WikiContentService,
    confirmer: &'a mut dyn Confirmer,
    config: &'a BotSection,
    reconciler: CategoryReconciler,
    caches: LookupCaches,
    options: PipelineOptions,
    accept_all: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        service: &'a mut dyn WikiContentService,
        confirmer: &'a mut dyn Confirmer,
        config: &'a BotSection,
        reconciler: CategoryReconciler,
        caches: LookupCaches,
        options: PipelineOptions,
    ) -> Self {
        Self {
            service,
            confirmer,
            config,
            reconciler,
            caches,
            options,
            accept_all: options.assume_yes,
        }
    }

    pub fn caches(&self) -> &LookupCaches {
        &self.caches
    }

    pub fn run_batch<I, S>(&mut self, titles: I) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BatchReport::default();
        for title in titles {
            report.outcomes.push(self.run_page(title.as_ref()));
        }
        info!(summary = %report.summary(), "batch finished");
        report
    }

    /// Run one page to completion. Errors never escape: they become a
    /// `Skipped` outcome for expected page states and `Failed` otherwise.
    pub fn run_page(&mut self, title: &str) -> PageOutcome {
        match self.process_page(title) {
            Ok(outcome) => {
                info!(
                    title,
                    outcome = %outcome.kind,
                    warnings = outcome.warnings.len(),
                    "page processed"
                );
                outcome
            }
            Err(error) => match error.downcast_ref::<PageError>() {
                Some(page_error) => {
                    warn!(title, reason = page_error.reason(), error = %page_error, "page skipped");
                    PageOutcome::new(title, OutcomeKind::Skipped, PageState::Skipped)
                        .with_reason(page_error.reason())
                }
                None => {
                    let message = format!("{error:#}");
                    warn!(title, error = %message, "page failed");
                    PageOutcome::new(title, OutcomeKind::Failed, PageState::Skipped)
                        .with_reason(message)
                }
            },
        }
    }

    fn process_page(&mut self, title: &str) -> Result<PageOutcome> {
        let fetched = self.service.fetch(title)?;
        if fetched.protected {
            return Err(PageError::LockedPage(fetched.title).into());
        }
        let mut page = Page::from(fetched);
        debug!(title, state = ?PageState::Fetched, bytes = page.text.len(), "fetched page");

        let original = page.text.clone();
        let templates = page.templates()?.to_vec();
        debug!(title, state = ?PageState::TemplatesExtracted, templates = templates.len(), "extracted templates");

        let selected = select_templates(&templates);
        if selected.is_empty() {
            return Ok(
                PageOutcome::new(title, OutcomeKind::Unchanged, PageState::TemplatesExtracted)
                    .with_reason("no handled template"),
            );
        }

        // Parameter names are keyed by template kind so that two kinds on one
        // page never share a requirement.
        let mut requirements = BTreeMap::new();
        let mut missing = BTreeSet::new();
        for (entry, template) in &selected {
            let kind = entry.kind.as_str();
            let kind_requirements = self.config.requirements_for(kind);
            let kind_missing = template
                .parameter_map()
                .missing(kind_requirements.keys().map(String::as_str));
            missing.extend(kind_missing.iter().map(|param| requirement_key(kind, param)));
            requirements.extend(
                kind_requirements
                    .into_iter()
                    .map(|(param, category)| (requirement_key(kind, &param), category)),
            );
        }
        let mut category_plan =
            self.reconciler
                .plan(&original, &missing, &page.categories, &requirements);
        debug!(
            title,
            state = ?PageState::CategoriesChecked,
            added = category_plan.added.len(),
            removed = category_plan.removed.len(),
            "checked categories"
        );

        let mut handler_edits = EditPlan::new();
        let mut warnings = Vec::new();
        let mut filled = BTreeSet::new();
        for (entry, template) in &selected {
            let mut ctx = HandlerContext::new(
                &page.title,
                &original,
                &mut *self.service,
                &mut self.caches,
                self.config,
            );
            (entry.handler)(&mut ctx, template)?;
            let kind = entry.kind.as_str();
            handler_edits.extend(ctx.edits);
            warnings.extend(ctx.warnings);
            filled.extend(ctx.filled.iter().map(|param| requirement_key(kind, param)));
        }
        debug!(
            title,
            state = ?PageState::CrossReferencesChecked,
            templates = selected.len(),
            edits = handler_edits.len(),
            warnings = warnings.len(),
            "checked cross references"
        );

        if !filled.is_empty() {
            let still_missing: BTreeSet<String> = missing.difference(&filled).cloned().collect();
            category_plan =
                self.reconciler
                    .plan(&original, &still_missing, &page.categories, &requirements);
        }

        let edits = self.merge_edits(&original, handler_edits, category_plan);
        let rewritten = edits
            .apply(&original)
            .with_context(|| format!("failed to rewrite {title}"))?;
        debug!(title, state = ?PageState::Rewritten, edits = edits.len(), "rewrote page");

        if !material_change(&original, &rewritten) {
            let mut outcome =
                PageOutcome::new(title, OutcomeKind::Unchanged, PageState::Rewritten);
            outcome.warnings = warnings;
            return Ok(outcome);
        }

        let diff = unified_diff(title, &original, &rewritten);
        debug!(title, state = ?PageState::DiffComputed, "computed diff");

        let mut outcome = PageOutcome::new(title, OutcomeKind::Skipped, PageState::Skipped);
        outcome.diff = Some(diff.clone());
        outcome.warnings = warnings;

        if self.options.dry_run {
            return Ok(outcome.with_reason("dry_run"));
        }

        let decision = if self.accept_all {
            Decision::Accept
        } else {
            self.confirmer.confirm(title, &diff)?
        };

        match decision {
            Decision::Accept | Decision::AcceptAll => {
                if decision == Decision::AcceptAll {
                    self.accept_all = true;
                }
                self.service
                    .save(title, &rewritten, &self.config.edit_summary)
                    .with_context(|| format!("failed to save {title}"))?;
                outcome.kind = OutcomeKind::Confirmed;
                outcome.state = PageState::Confirmed;
                Ok(outcome)
            }
            Decision::Reject => {
                outcome.kind = OutcomeKind::Rejected;
                outcome.state = PageState::Rejected;
                Ok(outcome)
            }
            Decision::Skip => Ok(outcome.with_reason("skipped by operator")),
        }
    }

    fn merge_edits(
        &self,
        original: &str,
        handler_edits: EditPlan,
        categories: CategoryPlan,
    ) -> EditPlan {
        let mut edits = handler_edits;
        edits.extend(categories.edits);
        let wants_marker = !edits.is_empty() || self.config.always_add_nowysiwyg;
        if wants_marker && !original.contains(NOWYSIWYG_MARKER) {
            edits.insert(0, format!("{NOWYSIWYG_MARKER}\n"));
        }
        edits
    }
}

fn requirement_key(kind: &str, param: &str) -> String {
    format!("{kind}.{param}")
}

/// Whether two texts differ in anything other than whitespace.
pub fn material_change(before: &str, after: &str) -> bool {
    let before = normalized_lines(before);
    let after = normalized_lines(after);
    TextDiff::from_lines(before.as_str(), after.as_str())
        .ops()
        .iter()
        .any(|op| op.tag() != DiffTag::Equal)
}

fn normalized_lines(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        output.push_str(&collapsed);
        output.push('\n');
    }
    output
}

pub fn unified_diff(title: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{title}"), &format!("b/{title}"))
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::Result;

    use super::{
        Confirmer, Decision, NOWYSIWYG_MARKER, OutcomeKind, Page, PageState, Pipeline,
        PipelineOptions, material_change, unified_diff,
    };
    use crate::cache::LookupCaches;
    use crate::categories::CategoryReconciler;
    use crate::config::BotSection;
    use crate::service::tests::MockService;

    struct Scripted {
        answers: VecDeque<Decision>,
        asked: Vec<String>,
    }

    impl Scripted {
        fn new(answers: &[Decision]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                asked: Vec::new(),
            }
        }
    }

    impl Confirmer for Scripted {
        fn confirm(&mut self, title: &str, _diff: &str) -> Result<Decision> {
            self.asked.push(title.to_string());
            Ok(self.answers.pop_front().unwrap_or(Decision::Skip))
        }
    }

    fn config() -> BotSection {
        let mut config = BotSection::default();
        config.requirements.insert(
            "item".to_string(),
            [
                ("image".to_string(), "Items Needing Images".to_string()),
                ("from".to_string(), "Items Needing Sources".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        config
    }

    fn reconciler() -> CategoryReconciler {
        CategoryReconciler::new(["Items Needing Images", "Items Needing Sources"])
    }

    #[test]
    fn page_parses_templates_lazily_and_reports_title_on_failure() {
        let mut page = Page::new("Broken", "{{Item|name=x");
        let error = page.templates().expect_err("parse failure");
        assert!(error.to_string().contains("Broken"));

        let mut page = Page::new("Fine", "{{Item}}{{Other}}");
        assert_eq!(page.templates().expect("templates").len(), 2);
    }

    #[test]
    fn material_change_ignores_whitespace() {
        assert!(!material_change("a  b\n\nc\n", "a b\nc"));
        assert!(material_change("a b\nc", "a b\nd"));
        let diff = unified_diff("Page", "a\nb\n", "a\nc\n");
        assert!(diff.contains("--- a/Page"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }

    #[test]
    fn cross_reference_scenario_rewrites_sources_and_categories() {
        let mut service = MockService::default()
            .with_page(
                "Iron Pipe",
                "{{Item|name=Iron Pipe|image=?|from=[[A]]}}\n[[Category:Items]]\n",
            )
            .with_page("A", "{{Drop Table|[[Iron Pipe]]}}")
            .with_page("B", "{{Drop Table|[[Iron Pipe]]}}")
            .with_references("Iron Pipe", &["A", "B"]);
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Accept]);

        let outcome = {
            let mut pipeline = Pipeline::new(
                &mut service,
                &mut confirmer,
                &config,
                reconciler(),
                LookupCaches::default(),
                PipelineOptions::default(),
            );
            pipeline.run_page("Iron Pipe")
        };

        assert_eq!(outcome.kind, OutcomeKind::Confirmed);
        assert_eq!(outcome.state, PageState::Confirmed);
        let (title, text, summary) = service.saved.last().expect("saved");
        assert_eq!(title, "Iron Pipe");
        assert_eq!(summary, &config.edit_summary);
        assert_eq!(
            text,
            &format!(
                "{NOWYSIWYG_MARKER}\n{{{{Item|name=Iron Pipe|image=?|from=\n*[[A]]\n*[[B]]}}}}\n\
                 [[Category:Items Needing Images]]\n[[Category:Items]]\n"
            )
        );
    }

    #[test]
    fn filled_parameter_removes_its_category() {
        let mut service = MockService::default()
            .with_page(
                "Iron Pipe",
                "__NOWYSIWYG__\n{{Item|image=Pipe.png|from=}}\n[[Category:Items Needing Sources]]\n",
            )
            .with_page("A", "{{Drop Table|[[Iron Pipe]]}}")
            .with_references("Iron Pipe", &["A"]);
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Accept]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        )
        .run_page("Iron Pipe");

        assert_eq!(outcome.kind, OutcomeKind::Confirmed);
        assert_eq!(
            service.pages["Iron Pipe"],
            "__NOWYSIWYG__\n{{Item|image=Pipe.png|from=\n*[[A]]}}\n"
        );
    }

    #[test]
    fn second_run_is_unchanged() {
        let mut service = MockService::default()
            .with_page("Iron Pipe", "{{Item|from=[[A]]}}")
            .with_page("A", "{{Drop Table|[[Iron Pipe]]}}")
            .with_references("Iron Pipe", &["A"]);
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Accept, Decision::Accept]);
        let mut pipeline = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        );

        let first = pipeline.run_page("Iron Pipe");
        let second = pipeline.run_page("Iron Pipe");
        assert_eq!(first.kind, OutcomeKind::Confirmed);
        assert_eq!(second.kind, OutcomeKind::Unchanged);
    }

    #[test]
    fn dry_run_computes_diff_without_saving() {
        let mut service = MockService::default().with_page("Iron Pipe", "{{Item|from=?}}");
        let config = config();
        let mut confirmer = Scripted::new(&[]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions {
                dry_run: true,
                assume_yes: false,
            },
        )
        .run_page("Iron Pipe");

        assert_eq!(outcome.kind, OutcomeKind::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("dry_run"));
        let diff = outcome.diff.expect("diff");
        assert!(diff.contains("+[[Category:Items Needing Images]]"));
        assert!(service.saved.is_empty());
        assert!(confirmer.asked.is_empty());
    }

    #[test]
    fn accept_all_skips_later_prompts_and_errors_stay_per_page() {
        let mut service = MockService::default()
            .with_page("One", "{{Item|from=?}}")
            .with_page("Two", "{{Item|from=?}}")
            .with_page("Three", "{{Item|from=?}}")
            .with_page("Broken", "{{Item|from=?")
            .with_page("Vault", "{{Item|from=?}}");
        service.redirects.insert("Moved".to_string());
        service.locked.insert("Vault".to_string());
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Reject, Decision::AcceptAll]);

        let report = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        )
        .run_batch(["One", "Broken", "Moved", "Vault", "Missing", "Two", "Three"]);

        let kinds = report
            .outcomes
            .iter()
            .map(|outcome| (outcome.kind, outcome.reason.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                (OutcomeKind::Rejected, None),
                (OutcomeKind::Skipped, Some("parse_failure")),
                (OutcomeKind::Skipped, Some("redirect")),
                (OutcomeKind::Skipped, Some("locked")),
                (OutcomeKind::Skipped, Some("not_found")),
                (OutcomeKind::Confirmed, None),
                (OutcomeKind::Confirmed, None),
            ]
        );
        assert_eq!(confirmer.asked, vec!["One".to_string(), "Two".to_string()]);
        assert_eq!(service.saved.len(), 2);
        assert!(report.summary().starts_with("7 pages: 2 confirmed, 1 rejected, 4 skipped"));
    }

    #[test]
    fn protected_referrer_does_not_lock_the_item() {
        let mut service = MockService::default()
            .with_page("Iron Pipe", "{{Item|image=Pipe.png|from=[[A]]}}")
            .with_page("A", "{{Drop Table|[[Iron Pipe]]}}")
            .with_page("Main Page", "{{Drop Table|[[Iron Pipe]]}}")
            .with_references("Iron Pipe", &["A", "Main Page"]);
        service.locked.insert("Main Page".to_string());
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Accept]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        )
        .run_page("Iron Pipe");

        assert_eq!(outcome.kind, OutcomeKind::Confirmed);
        assert_eq!(
            service.pages["Iron Pipe"],
            format!("{NOWYSIWYG_MARKER}\n{{{{Item|image=Pipe.png|from=\n*[[A]]\n*[[Main Page]]}}}}")
        );
    }

    #[test]
    fn every_handled_template_kind_is_reconciled() {
        let mut config = config();
        config.requirements.insert(
            "district".to_string(),
            [("map".to_string(), "Districts Needing Maps".to_string())]
                .into_iter()
                .collect(),
        );
        let mut service = MockService::default().with_page(
            "Old Town",
            "__NOWYSIWYG__\n{{District|map=?}}\n{{Item|image=Key.png|from=}}",
        );
        let mut confirmer = Scripted::new(&[]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            CategoryReconciler::new(["Districts Needing Maps", "Items Needing Sources"]),
            LookupCaches::default(),
            PipelineOptions {
                dry_run: true,
                assume_yes: false,
            },
        )
        .run_page("Old Town");

        let diff = outcome.diff.expect("diff");
        assert!(diff.contains("+[[Category:Districts Needing Maps]]"));
        assert!(diff.contains("+[[Category:Items Needing Sources]]"));
    }

    #[test]
    fn save_failure_is_reported_as_failed() {
        let mut service = MockService::default().with_page("One", "{{Item|from=?}}");
        service.fail_saves = true;
        let config = config();
        let mut confirmer = Scripted::new(&[Decision::Accept]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        )
        .run_page("One");

        assert_eq!(outcome.kind, OutcomeKind::Failed);
        let reason = outcome.reason.expect("reason");
        assert!(reason.contains("failed to save One"));
        assert!(reason.contains("edit conflict"));
    }

    #[test]
    fn pages_without_handled_templates_are_left_alone() {
        let mut service = MockService::default().with_page("Lore", "Just prose.");
        let config = config();
        let mut confirmer = Scripted::new(&[]);

        let outcome = Pipeline::new(
            &mut service,
            &mut confirmer,
            &config,
            reconciler(),
            LookupCaches::default(),
            PipelineOptions::default(),
        )
        .run_page("Lore");
        assert_eq!(outcome.kind, OutcomeKind::Unchanged);
        assert_eq!(outcome.reason.as_deref(), Some("no handled template"));
    }
}
