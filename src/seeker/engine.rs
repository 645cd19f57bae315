//! HTML-scraping search engine backend.
//!
//! An engine is described entirely by configuration: a query URL
//! prefix, a CSS selector for the result containers, and selectors for
//! the link and title inside each container. The description comes
//! from the target page's meta description when it can be fetched
//! quickly, falling back to the scraped title.

use std::time::Duration;

use anyhow::{anyhow, Result};
use scraper::{Html, Selector};
use tracing::debug;

use crate::config::EngineConfig;
use crate::seeker::SearchProvider;
use crate::types::SearchResult;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const DESCRIPTION_TIMEOUT: Duration = Duration::from_millis(750);

pub struct ScrapedEngine {
    name: String,
    query_url: String,
    result_container_selector: String,
    result_url_selector: String,
    result_title_selector: String,
    user_agent: String,
    agent: ureq::Agent,
    description_agent: ureq::Agent,
}

impl ScrapedEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(QUERY_TIMEOUT))
            .build()
            .into();
        let description_agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(DESCRIPTION_TIMEOUT))
            .build()
            .into();

        ScrapedEngine {
            name: config.name.clone(),
            query_url: config.search_query_url.clone(),
            result_container_selector: config.result_container_selector.clone(),
            result_url_selector: config.result_url_selector.clone(),
            result_title_selector: config.result_title_selector.clone(),
            user_agent: config.user_agent.clone(),
            agent,
            description_agent,
        }
    }

    fn fetch_description(&self, url: &str) -> Option<String> {
        let body = self
            .description_agent
            .get(url)
            .header("User-Agent", self.user_agent.as_str())
            .call()
            .ok()?
            .body_mut()
            .read_to_string()
            .ok()?;

        let document = Html::parse_document(&body);
        let selector = Selector::parse(r#"meta[name="description"]"#).ok()?;
        let content = document.select(&selector).next()?.value().attr("content")?;
        let cleaned = clean_string(content);
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }
}

impl SearchProvider for ScrapedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!("{}{}", self.query_url, query.replace(' ', "+"));
        let body = self
            .agent
            .get(&url)
            .header("User-Agent", self.user_agent.as_str())
            .call()
            .map_err(|e| anyhow!("Failed to query engine '{}': {}", self.name, e))?
            .body_mut()
            .read_to_string()
            .map_err(|e| anyhow!("Failed to read response from '{}': {}", self.name, e))?;

        let document = Html::parse_document(&body);
        let container_selector = parse_selector(&self.result_container_selector, &self.name)?;
        let url_selector = parse_selector(&self.result_url_selector, &self.name)?;
        let title_selector = parse_selector(&self.result_title_selector, &self.name)?;

        let mut results = Vec::new();
        for container in document.select(&container_selector) {
            let Some(link) = container.select(&url_selector).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let href = href.replace(' ', "");
            if !(href.starts_with("http://") || href.starts_with("https://")) {
                continue;
            }

            let title = container
                .select(&title_selector)
                .next()
                .map(|el| clean_string(&el.text().collect::<String>()))
                .unwrap_or_default();
            let description = self
                .fetch_description(&href)
                .unwrap_or_else(|| title.clone());

            results.push(SearchResult::new(&title, &href, &description));
        }

        debug!("Engine '{}' yielded {} results", self.name, results.len());
        Ok(results)
    }
}

fn parse_selector(css: &str, engine: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector '{}' for engine '{}': {}", css, engine, e))
}

/// Scraped text arrives with stray double quotes often enough that the
/// cache would fragment on them; strip them up front.
pub fn clean_string(text: &str) -> String {
    text.replace('"', "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_string() {
        assert_eq!(clean_string(r#" "quoted" title "#), "quoted title");
        assert_eq!(clean_string(""), "");
    }

    #[test]
    fn test_selector_parse_errors_are_reported() {
        assert!(parse_selector("div.result", "stub").is_ok());
        assert!(parse_selector(":::", "stub").is_err());
    }
}
