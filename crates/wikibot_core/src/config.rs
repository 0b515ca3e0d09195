use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikibot/0.2";
pub const DEFAULT_CONFIG_PATH: &str = ".wikibot/config.toml";
pub const DEFAULT_EDIT_SUMMARY: &str = "Bot: reconcile template data";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub bot: BotSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl Default for WikiSection {
    fn default() -> Self {
        Self {
            api_url: None,
            user_agent: None,
            timeout_ms: 30_000,
            rate_limit_read_ms: 300,
            rate_limit_write_ms: 1_000,
        }
    }
}

impl WikiSection {
    /// Resolve the wiki API URL: env > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        env_override("WIKI_API_URL").or_else(|| self.api_url.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Credentials are never read from the config file.
    pub fn bot_username(&self) -> Option<String> {
        env_override("WIKI_BOT_USERNAME")
    }

    pub fn bot_password(&self) -> Option<String> {
        env_override("WIKI_BOT_PASSWORD")
    }
}

/// Whether a cross-reference check only reports a mismatch or also rewrites text.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckPolicy {
    Report,
    Fix,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BotSection {
    pub edit_summary: String,
    /// Root of the "needs more information" tree; its leaf subcategories are
    /// the only categories the reconciler will remove.
    pub needs_root_category: Option<String>,
    /// Static leaf set. When non-empty, discovery is skipped.
    pub leaf_categories: Vec<String>,
    pub always_add_nowysiwyg: bool,
    /// Pages in these categories count as sources for every item they link.
    pub source_categories: Vec<String>,
    /// Templates whose parameters name the items a page hands out.
    pub source_templates: Vec<String>,
    /// Template kind → (parameter → category required while it is missing).
    pub requirements: BTreeMap<String, BTreeMap<String, String>>,
    pub policies: BTreeMap<String, CheckPolicy>,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            edit_summary: DEFAULT_EDIT_SUMMARY.to_string(),
            needs_root_category: Some("Needs Information".to_string()),
            leaf_categories: Vec::new(),
            always_add_nowysiwyg: false,
            source_categories: vec!["Events".to_string(), "Crates".to_string()],
            source_templates: vec![
                "Drop Table".to_string(),
                "Mystery Gift".to_string(),
                "Execution Method Bonus".to_string(),
            ],
            requirements: default_requirements(),
            policies: default_policies(),
        }
    }
}

impl BotSection {
    pub fn requirements_for(&self, kind: &str) -> BTreeMap<String, String> {
        self.requirements.get(kind).cloned().unwrap_or_default()
    }

    /// Unconfigured checks only report.
    pub fn policy(&self, check: &str) -> CheckPolicy {
        self.policies
            .get(check)
            .copied()
            .unwrap_or(CheckPolicy::Report)
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_requirements() -> BTreeMap<String, BTreeMap<String, String>> {
    let table: [(&str, &[(&str, &str)]); 7] = [
        (
            "item",
            &[
                ("image", "Items Needing Images"),
                ("from", "Items Needing Sources"),
                ("attack", "Items Needing Stats"),
                ("defense", "Items Needing Stats"),
            ],
        ),
        (
            "lieutenant",
            &[
                ("image", "Lieutenants Needing Images"),
                ("faction", "Lieutenants Needing Factions"),
                ("rank", "Lieutenants Needing Stats"),
                ("faction_points", "Lieutenants Needing Stats"),
            ],
        ),
        (
            "property",
            &[
                ("image", "Properties Needing Images"),
                ("cost", "Properties Needing Stats"),
                ("income", "Properties Needing Stats"),
            ],
        ),
        (
            "class",
            &[
                ("image", "Classes Needing Images"),
                ("description", "Needs Information"),
            ],
        ),
        (
            "execution_method",
            &[
                ("image", "Execution Methods Needing Images"),
                ("bonus", "Execution Methods Needing Stats"),
            ],
        ),
        (
            "district",
            &[
                ("image", "Districts Needing Images"),
                ("unlock", "Districts Needing Stats"),
            ],
        ),
        (
            "tech_lab_recipe",
            &[
                ("result", "Recipes Needing Results"),
                ("time", "Recipes Needing Stats"),
            ],
        ),
    ];

    table
        .into_iter()
        .map(|(kind, pairs)| {
            let map = pairs
                .iter()
                .map(|(param, category)| (param.to_string(), category.to_string()))
                .collect();
            (kind.to_string(), map)
        })
        .collect()
}

fn default_policies() -> BTreeMap<String, CheckPolicy> {
    [
        ("item_sources", CheckPolicy::Fix),
        ("recipe_images", CheckPolicy::Fix),
        ("recipe_result", CheckPolicy::Report),
        ("granting_item", CheckPolicy::Report),
        ("lieutenant_faction", CheckPolicy::Report),
        ("lieutenant_stats", CheckPolicy::Report),
    ]
    .into_iter()
    .map(|(check, policy)| (check.to_string(), policy))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_api_url_and_illustrative_rules() {
        let config = BotConfig::default();
        assert!(config.wiki.api_url.is_none());
        assert_eq!(config.wiki.timeout_ms, 30_000);
        assert_eq!(
            config.bot.requirements_for("item").get("image").map(String::as_str),
            Some("Items Needing Images")
        );
        assert_eq!(config.bot.policy("item_sources"), CheckPolicy::Fix);
        assert_eq!(config.bot.policy("lieutenant_stats"), CheckPolicy::Report);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, BotConfig::default());
    }

    #[test]
    fn load_config_parses_wiki_and_bot_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://example.wiki/api.php"
user_agent = "test-agent/1.0"
rate_limit_write_ms = 50

[bot]
edit_summary = "Bot: tidy"
leaf_categories = ["Items Needing Images"]

[bot.requirements.item]
image = "Items Needing Images"

[bot.policies]
lieutenant_stats = "fix"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.wiki.api_url.as_deref(),
            Some("https://example.wiki/api.php")
        );
        assert_eq!(config.wiki.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.wiki.rate_limit_write_ms, 50);
        assert_eq!(config.wiki.rate_limit_read_ms, 300);
        assert_eq!(config.bot.edit_summary, "Bot: tidy");
        assert_eq!(config.bot.leaf_categories, vec!["Items Needing Images"]);
        assert_eq!(config.bot.requirements.len(), 1);
        assert!(config.bot.requirements_for("lieutenant").is_empty());
        assert_eq!(config.bot.policy("lieutenant_stats"), CheckPolicy::Fix);
        assert_eq!(config.bot.policy("item_sources"), CheckPolicy::Report);
        assert_eq!(config.bot.source_categories, vec!["Events", "Crates"]);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[other]\nkey = \"value\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.wiki.api_url.is_none());
        assert_eq!(config.bot.edit_summary, DEFAULT_EDIT_SUMMARY);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn unknown_policy_value_is_rejected() {
        let parsed = toml::from_str::<BotConfig>("[bot.policies]\nitem_sources = \"maybe\"\n");
        assert!(parsed.is_err());
    }
}
