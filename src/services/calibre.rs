use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use url::Url;

use crate::models::DeliverySettings;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_RECIPES_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Calibre not found, is it installed? ({0})")]
    NotInstalled(String),

    #[error("{source_name} failed: {reason}")]
    Failed { source_name: String, reason: String },

    #[error("{source_name} timed out after {secs}s")]
    Timeout { source_name: String, secs: u64 },

    #[error("{0} produced no output file")]
    MissingOutput(String),

    #[error("{0} produced empty file")]
    EmptyOutput(String),

    #[error("Invalid feed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces an EPUB for a subscription's source.
///
/// On success the returned path points at a non-empty file.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_recipe(
        &self,
        recipe: &str,
        output: &Path,
        settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError>;

    async fn fetch_feed(
        &self,
        feed_url: &str,
        title: &str,
        output: &Path,
        settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub name: String,
    pub title: String,
    pub language: Option<String>,
}

/// Drives Calibre's `ebook-convert`.
pub struct CalibreWrapper {
    binary: String,
    timeout: Duration,
    recipe_cache: Mutex<Option<Vec<Recipe>>>,
}

impl CalibreWrapper {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            recipe_cache: Mutex::new(None),
        }
    }

    /// First line of `ebook-convert --version`.
    pub async fn verify_installation(&self) -> Result<String, FetchError> {
        let output = self
            .output_within(vec!["--version".into()], VERSION_TIMEOUT, "Calibre version check")
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.lines().next().unwrap_or_default().trim().to_string();
        tracing::info!("Calibre version: {}", version);
        Ok(version)
    }

    /// Built-in recipes, cached after the first successful listing.
    pub async fn list_builtin_recipes(&self, force_refresh: bool) -> Result<Vec<Recipe>, FetchError> {
        let mut cache = self.recipe_cache.lock().await;
        if let Some(recipes) = cache.as_ref() {
            if !force_refresh {
                return Ok(recipes.clone());
            }
        }

        let output = self
            .output_within(vec!["--list-recipes".into()], LIST_RECIPES_TIMEOUT, "Recipe listing")
            .await?;
        if !output.status.success() {
            return Err(FetchError::Failed {
                source_name: "Recipe listing".to_string(),
                reason: last_error_line(&output.stderr),
            });
        }

        let recipes = parse_recipe_list(&String::from_utf8_lossy(&output.stdout));
        tracing::info!("Loaded {} Calibre recipes", recipes.len());
        *cache = Some(recipes.clone());
        Ok(recipes)
    }

    async fn output_within(
        &self,
        args: Vec<OsString>,
        limit: Duration,
        label: &str,
    ) -> Result<std::process::Output, FetchError> {
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(limit, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotInstalled(self.binary.clone()))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FetchError::Timeout {
                source_name: label.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    /// Run one conversion and check that it left a usable file behind.
    async fn convert(
        &self,
        label: String,
        input: OsString,
        output: &Path,
        mut extra: Vec<OsString>,
    ) -> Result<PathBuf, FetchError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut args = vec![input, output.as_os_str().to_owned()];
        args.append(&mut extra);
        tracing::info!("Running Calibre for {}: {:?}", label, args);

        let result = self.output_within(args, self.timeout, &label).await?;
        if !result.status.success() {
            return Err(FetchError::Failed {
                source_name: label,
                reason: last_error_line(&result.stderr),
            });
        }

        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::MissingOutput(label));
            }
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            tokio::fs::remove_file(output).await.ok();
            return Err(FetchError::EmptyOutput(label));
        }

        tracing::info!("Generated EPUB: {} ({:.1} KB)", output.display(), size as f64 / 1024.0);
        Ok(output.to_path_buf())
    }
}

#[async_trait]
impl ContentFetcher for CalibreWrapper {
    async fn fetch_recipe(
        &self,
        recipe: &str,
        output: &Path,
        settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError> {
        let mut extra: Vec<OsString> = vec![
            format!("--max-articles-per-feed={}", settings.max_articles).into(),
            format!("--oldest-article={}", settings.oldest_days).into(),
            "--output-profile=kindle".into(),
        ];
        if !settings.include_images {
            extra.push("--dont-download-recipe".into());
        }

        self.convert(
            format!("Recipe '{}'", recipe),
            format!("{}.recipe", recipe).into(),
            output,
            extra,
        )
        .await
    }

    async fn fetch_feed(
        &self,
        feed_url: &str,
        title: &str,
        output: &Path,
        settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError> {
        let parsed = Url::parse(feed_url).map_err(|e| FetchError::InvalidUrl {
            url: feed_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: feed_url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let recipe_path = output.with_extension("recipe");
        tokio::fs::write(&recipe_path, feed_recipe(feed_url, title, settings)).await?;
        tracing::debug!("Created temp recipe: {}", recipe_path.display());

        let mut extra: Vec<OsString> = vec!["--output-profile=kindle".into()];
        if !settings.include_images {
            extra.push("--dont-download-recipe".into());
        }

        let result = self
            .convert(
                format!("RSS feed '{}'", title),
                recipe_path.as_os_str().to_owned(),
                output,
                extra,
            )
            .await;

        match tokio::fs::remove_file(&recipe_path).await {
            Ok(()) => tracing::debug!("Cleaned up temp recipe: {}", recipe_path.display()),
            Err(e) => tracing::warn!("Failed to remove {}: {}", recipe_path.display(), e),
        }

        result
    }
}

/// Python source for a one-feed Calibre recipe.
fn feed_recipe(feed_url: &str, title: &str, settings: &DeliverySettings) -> String {
    let title = escape_py(title);
    let url = escape_py(feed_url);
    format!(
        r#"from calibre.web.feeds.news import BasicNewsRecipe

class CustomRSSRecipe(BasicNewsRecipe):
    title = '{title}'
    oldest_article = {oldest}
    max_articles_per_feed = {max}
    auto_cleanup = True
    no_stylesheets = True

    feeds = [
        ('{title}', '{url}'),
    ]
"#,
        oldest = settings.oldest_days,
        max = settings.max_articles,
    )
}

fn escape_py(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', " ")
        .replace('\r', " ")
}

fn last_error_line(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("Unknown error")
        .to_string()
}

fn language_header() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w{2,3})(?:\s|$)").ok()).as_ref()
}

fn recipe_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s*(?:\[(.+?)\])?\s*$").ok()).as_ref()
}

/// Parse `ebook-convert --list-recipes` output.
///
/// Short lines such as `en` or `de` start a language group; every other line
/// is a recipe title, optionally followed by a bracketed description.
fn parse_recipe_list(output: &str) -> Vec<Recipe> {
    let mut recipes = Vec::new();
    let (Some(header_re), Some(recipe_re)) = (language_header(), recipe_line()) else {
        return recipes;
    };
    let mut language: Option<String> = None;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.chars().count() <= 10 {
            if let Some(caps) = header_re.captures(line) {
                language = Some(caps[1].to_lowercase());
                continue;
            }
        }

        let Some(caps) = recipe_re.captures(line) else {
            continue;
        };
        let title = caps[1].trim().to_string();
        let name = title_to_name(&title);
        if !name.is_empty() {
            recipes.push(Recipe {
                name,
                title,
                language: language.clone(),
            });
        }
    }

    recipes
}

fn title_to_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
