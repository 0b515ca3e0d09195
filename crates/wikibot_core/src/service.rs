use std::collections::{BTreeSet, VecDeque};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::categories::{is_category_title, normalize_category_name};
use crate::config::WikiSection;
use crate::error::PageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub title: String,
    pub text: String,
    pub categories: BTreeSet<String>,
    /// Edits need sysop rights. Only matters for the page being rewritten.
    pub protected: bool,
}

/// Everything the engine needs from the wiki. Implementations report the
/// expected page states as [`PageError`] values wrapped in `anyhow::Error`.
pub trait WikiContentService {
    fn fetch(&mut self, title: &str) -> Result<FetchedPage>;
    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()>;
    /// Member titles; subcategories come back with their `Category:` prefix.
    fn list_category_members(&mut self, category: &str, recursive: bool) -> Result<Vec<String>>;
    fn find_referencing_pages(
        &mut self,
        title: &str,
        only_template_transclusion: bool,
    ) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MediaWikiClientConfig {
    pub fn from_config(wiki: &WikiSection) -> Result<Self> {
        let api_url = wiki
            .api_url_owned()
            .ok_or_else(|| anyhow::anyhow!("no wiki API URL configured (set WIKI_API_URL)"))?;
        Ok(Self {
            api_url,
            user_agent: wiki.user_agent(),
            timeout_ms: wiki.timeout_ms,
            rate_limit_read_ms: wiki.rate_limit_read_ms,
            rate_limit_write_ms: wiki.rate_limit_write_ms,
            username: wiki.bot_username(),
            password: wiki.bot_password(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Spaces requests by the configured read or write interval.
#[derive(Debug)]
struct Pacer {
    read: Duration,
    write: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn wait(&mut self, access: Access) {
        let interval = match access {
            Access::Read => self.read,
            Access::Write => self.write,
        };
        if let Some(remaining) = self
            .last
            .and_then(|last| interval.checked_sub(last.elapsed()))
        {
            sleep(remaining);
        }
        self.last = Some(Instant::now());
    }
}

/// Blocking MediaWiki Action API client. Requests are paced but never retried.
pub struct MediaWikiClient {
    client: Client,
    api_url: Url,
    config: MediaWikiClientConfig,
    pacer: Pacer,
    csrf_token: Option<String>,
    logged_in: bool,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        let pacer = Pacer {
            read: Duration::from_millis(config.rate_limit_read_ms),
            write: Duration::from_millis(config.rate_limit_write_ms),
            last: None,
        };

        Ok(Self {
            client,
            api_url,
            config,
            pacer,
            csrf_token: None,
            logged_in: false,
        })
    }

    /// Reads go out as GET query strings, writes as POST forms.
    fn call(&mut self, access: Access, params: &[(&str, String)]) -> Result<Value> {
        let pairs = api_pairs(params);
        self.pacer.wait(access);
        let request = match access {
            Access::Read => self.client.get(self.api_url.clone()).query(&pairs),
            Access::Write => self.client.post(self.api_url.clone()).form(&pairs),
        };
        let response = request.send().context("failed to call MediaWiki API")?;
        decode_payload(response)
    }

    /// `query.tokens.<kind>token` from a `meta=tokens` request.
    fn token(&mut self, kind: &str) -> Result<String> {
        let response = self.call(
            Access::Read,
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", kind.to_string()),
            ],
        )?;
        response
            .pointer(&format!("/query/tokens/{kind}token"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki {kind} token"))
    }

    fn login(&mut self) -> Result<()> {
        if self.logged_in {
            return Ok(());
        }
        let (Some(username), Some(password)) =
            (self.config.username.clone(), self.config.password.clone())
        else {
            bail!("saving requires WIKI_BOT_USERNAME and WIKI_BOT_PASSWORD");
        };

        let login_token = self.token("login")?;
        let response = self.call(
            Access::Write,
            &[
                ("action", "login".to_string()),
                ("lgname", username.clone()),
                ("lgpassword", password),
                ("lgtoken", login_token),
            ],
        )?;
        let result = response.pointer("/login/result").and_then(Value::as_str);
        if result != Some("Success") {
            let reason = response
                .pointer("/login/reason")
                .and_then(Value::as_str)
                .or(result)
                .unwrap_or("unknown error");
            bail!("MediaWiki login failed for {username}: {reason}");
        }
        info!(user = %username, "logged in to wiki");
        self.logged_in = true;
        self.csrf_token = None;
        Ok(())
    }

    fn csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let token = self.token("csrf")?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn direct_category_members(&mut self, category: &str) -> Result<Vec<String>> {
        let mut titles = Vec::new();
        let mut continue_token: Option<String> = None;
        let category_title = format!("Category:{}", normalize_category_name(category));

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title.clone()),
                ("cmtype", "page|subcat".to_string()),
                ("cmlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self.call(Access::Read, &params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode categorymembers API response")?;
            titles.extend(parsed.query.categorymembers.into_iter().map(|item| item.title));

            continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(titles)
    }

    fn list_titles(&mut self, list: &str, prefix: &str, title: &str) -> Result<Vec<String>> {
        let mut titles = Vec::new();
        let mut continue_token: Option<String> = None;
        let title_key = format!("{prefix}title");
        let limit_key = format!("{prefix}limit");
        let continue_key = format!("{prefix}continue");

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", list.to_string()),
                (title_key.as_str(), title.to_string()),
                (limit_key.as_str(), "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push((continue_key.as_str(), token.clone()));
            }

            let response = self.call(Access::Read, &params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .with_context(|| format!("failed to decode {list} API response"))?;
            let items = match list {
                "embeddedin" => parsed.query.embeddedin,
                _ => parsed.query.backlinks,
            };
            titles.extend(items.into_iter().map(|item| item.title));

            continue_token = parsed.continuation.and_then(|cont| match list {
                "embeddedin" => cont.eicontinue,
                _ => cont.blcontinue,
            });
            if continue_token.is_none() {
                break;
            }
        }

        Ok(titles)
    }
}

impl WikiContentService for MediaWikiClient {
    fn fetch(&mut self, title: &str) -> Result<FetchedPage> {
        let response = self.call(
            Access::Read,
            &[
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "revisions|info|categories".to_string()),
                ("rvprop", "content".to_string()),
                ("rvslots", "main".to_string()),
                ("inprop", "protection".to_string()),
                ("cllimit", "max".to_string()),
            ],
        )?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;
        let page = parsed
            .query
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| PageError::NotFound(title.to_string()))?;

        if page.missing.unwrap_or(false) {
            return Err(PageError::NotFound(page.title).into());
        }
        if page.redirect.unwrap_or(false) {
            return Err(PageError::RedirectPage(page.title).into());
        }
        let protected = page
            .protection
            .iter()
            .any(|entry| entry.kind == "edit" && entry.level == "sysop");

        let text = page
            .revisions
            .first()
            .and_then(|revision| revision.slots.as_ref())
            .and_then(|slots| slots.main.as_ref())
            .map(|slot| slot.content.clone())
            .ok_or_else(|| PageError::NotFound(page.title.clone()))?;
        let categories = page
            .categories
            .iter()
            .map(|category| normalize_category_name(&category.title))
            .collect();

        Ok(FetchedPage {
            title: page.title,
            text,
            categories,
            protected,
        })
    }

    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()> {
        self.login()?;
        let token = self.csrf_token()?;
        let response = self.call(
            Access::Write,
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", text.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("nocreate", "1".to_string()),
                ("token", token),
            ],
        )?;
        match response.pointer("/edit/result").and_then(Value::as_str) {
            Some("Success") => Ok(()),
            Some(result) => bail!("MediaWiki edit failed for {title}: {result}"),
            None => bail!("missing edit payload in API response for {title}"),
        }
    }

    fn list_category_members(&mut self, category: &str, recursive: bool) -> Result<Vec<String>> {
        if !recursive {
            return self.direct_category_members(category);
        }

        let mut seen_titles = BTreeSet::new();
        let mut titles = Vec::new();
        let mut visited = BTreeSet::from([normalize_category_name(category)]);
        let mut queue = VecDeque::from([normalize_category_name(category)]);
        while let Some(current) = queue.pop_front() {
            for title in self.direct_category_members(&current)? {
                if is_category_title(&title) {
                    let name = normalize_category_name(&title);
                    if visited.insert(name.clone()) {
                        queue.push_back(name);
                    }
                }
                if seen_titles.insert(title.clone()) {
                    titles.push(title);
                }
            }
        }
        debug!(category, count = titles.len(), "listed category members recursively");
        Ok(titles)
    }

    fn find_referencing_pages(
        &mut self,
        title: &str,
        only_template_transclusion: bool,
    ) -> Result<Vec<String>> {
        let mut titles = self.list_titles("embeddedin", "ei", title)?;
        if !only_template_transclusion {
            let backlinks = self.list_titles("backlinks", "bl", title)?;
            let mut seen = titles.iter().cloned().collect::<BTreeSet<_>>();
            for backlink in backlinks {
                if seen.insert(backlink.clone()) {
                    titles.push(backlink);
                }
            }
        }
        Ok(titles)
    }
}

fn api_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn decode_payload(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        bail!("MediaWiki API request failed with HTTP {status}");
    }
    let payload: Value = response
        .json()
        .context("failed to decode MediaWiki API JSON response")?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<TitleQueryItem>,
    #[serde(default)]
    embeddedin: Vec<TitleQueryItem>,
    #[serde(default)]
    backlinks: Vec<TitleQueryItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
    eicontinue: Option<String>,
    blcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    missing: Option<bool>,
    redirect: Option<bool>,
    #[serde(default)]
    protection: Vec<ProtectionItem>,
    #[serde(default)]
    categories: Vec<TitleQueryItem>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct ProtectionItem {
    #[serde(rename = "type")]
    kind: String,
    level: String,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}
