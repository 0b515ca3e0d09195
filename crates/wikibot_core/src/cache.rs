use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use crate::crossref::link_target;
use crate::error::PageError;
use crate::service::{FetchedPage, WikiContentService};
use crate::template::{find_templates, link_spans, template_names_match};

/// Template a faction page uses for each row of its lieutenant roster.
pub const FACTION_ROSTER_TEMPLATE: &str = "Faction Lieutenant";

/// Title-keyed memo that is filled on a miss and never invalidated.
///
/// Lifetime is one process run. Pages edited during the run are not re-read.
#[derive(Debug)]
pub struct LookupCache<V> {
    entries: BTreeMap<String, V>,
    misses: usize,
}

impl<V> Default for LookupCache<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            misses: 0,
        }
    }
}

impl<V: Clone> LookupCache<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_or_try_insert_with<F>(&mut self, key: &str, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.entries.get(key) {
            return Ok(value.clone());
        }
        self.misses += 1;
        let value = load()?;
        self.entries.insert(key.to_string(), value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub rank: Option<String>,
    pub faction_points: Option<String>,
}

/// Caches shared by every page of one batch.
#[derive(Debug, Default)]
pub struct LookupCaches {
    /// Page title → its `image=` value, `None` when the page has none.
    pub images: LookupCache<Option<String>>,
    /// Faction title → the lieutenants its page lists.
    pub faction_rosters: LookupCache<Vec<RosterEntry>>,
}

impl LookupCaches {
    pub fn image_for(
        &mut self,
        service: &mut dyn WikiContentService,
        title: &str,
    ) -> Result<Option<String>> {
        self.images
            .get_or_try_insert_with(title, || load_image(service, title))
    }

    pub fn faction_roster(
        &mut self,
        service: &mut dyn WikiContentService,
        faction: &str,
    ) -> Result<Vec<RosterEntry>> {
        self.faction_rosters
            .get_or_try_insert_with(faction, || load_roster(service, faction))
    }
}

/// Fetch a page, mapping the "does not exist" family of states to `None`.
pub(crate) fn fetch_optional(
    service: &mut dyn WikiContentService,
    title: &str,
) -> Result<Option<FetchedPage>> {
    match service.fetch(title) {
        Ok(page) => Ok(Some(page)),
        Err(error) => match error.downcast_ref::<PageError>() {
            Some(PageError::NotFound(_) | PageError::RedirectPage(_)) => {
                debug!(title, error = %error, "lookup target unavailable");
                Ok(None)
            }
            _ => Err(error),
        },
    }
}

fn load_image(service: &mut dyn WikiContentService, title: &str) -> Result<Option<String>> {
    let Some(page) = fetch_optional(service, title)? else {
        return Ok(None);
    };
    let templates = find_templates(&page.text).map_err(|error| error.for_title(title))?;
    Ok(templates.iter().find_map(|template| {
        template
            .parameter_map()
            .get("image")
            .map(ToString::to_string)
    }))
}

/// Roster rows come from `{{Faction Lieutenant|...}}` invocations. Plain links
/// on the faction page also count as listing a lieutenant, without stats.
fn load_roster(service: &mut dyn WikiContentService, faction: &str) -> Result<Vec<RosterEntry>> {
    let Some(page) = fetch_optional(service, faction)? else {
        return Ok(Vec::new());
    };
    let templates = find_templates(&page.text).map_err(|error| error.for_title(faction))?;

    let mut roster = templates
        .iter()
        .filter(|template| template_names_match(&template.name, FACTION_ROSTER_TEMPLATE))
        .filter_map(|template| {
            let params = template.parameter_map();
            let name = params.get("name").or_else(|| params.get("1"))?;
            Some(RosterEntry {
                name: link_target(name).to_string(),
                rank: params.get("rank").map(ToString::to_string),
                faction_points: params.get("faction_points").map(ToString::to_string),
            })
        })
        .collect::<Vec<_>>();

    for span in link_spans(&page.text) {
        let target = link_target(&page.text[span]);
        if target.contains(':') || roster.iter().any(|entry| entry.name == target) {
            continue;
        }
        roster.push(RosterEntry {
            name: target.to_string(),
            ..RosterEntry::default()
        });
    }

    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::{LookupCache, LookupCaches, RosterEntry};
    use crate::service::tests::MockService;

    #[test]
    fn lookup_cache_loads_once_per_key() {
        let mut cache = LookupCache::<usize>::default();
        let mut loads = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("a", || {
                    loads += 1;
                    Ok(7)
                })
                .expect("load");
            assert_eq!(value, 7);
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.get("a"), Some(&7));
    }

    #[test]
    fn failed_load_is_not_cached() {
        let mut cache = LookupCache::<usize>::default();
        let error = cache
            .get_or_try_insert_with("a", || anyhow::bail!("offline"))
            .expect_err("fails");
        assert!(error.to_string().contains("offline"));
        assert!(cache.is_empty());
    }

    #[test]
    fn image_lookup_reads_first_image_parameter_and_caches_absence() {
        let mut service = MockService::default()
            .with_page("Iron", "{{Item|name=Iron|image=Iron.png}}")
            .with_page("Copper", "{{Item|name=Copper|image=?}}");
        let mut caches = LookupCaches::default();

        assert_eq!(
            caches.image_for(&mut service, "Iron").expect("iron"),
            Some("Iron.png".to_string())
        );
        assert_eq!(caches.image_for(&mut service, "Copper").expect("copper"), None);
        assert_eq!(caches.image_for(&mut service, "Missing").expect("missing"), None);
        assert_eq!(
            caches.image_for(&mut service, "Iron").expect("iron again"),
            Some("Iron.png".to_string())
        );
        assert_eq!(service.fetch_count, 3);
    }

    #[test]
    fn faction_roster_combines_rows_and_links() {
        let mut service = MockService::default().with_page(
            "The Syndicate",
            "{{Faction Lieutenant|name=[[Vito]]|rank=3|faction_points=120}}\n\
             Also working with [[Mara]] and [[Category:Factions]].",
        );
        let mut caches = LookupCaches::default();
        let roster = caches
            .faction_roster(&mut service, "The Syndicate")
            .expect("roster");
        assert_eq!(
            roster,
            vec![
                RosterEntry {
                    name: "Vito".to_string(),
                    rank: Some("3".to_string()),
                    faction_points: Some("120".to_string()),
                },
                RosterEntry {
                    name: "Mara".to_string(),
                    ..RosterEntry::default()
                },
            ]
        );
    }
}
