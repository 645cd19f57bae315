//! Federated search: local cache hits first, engine scrapes as
//! fallback, new results written back to the cache.

pub mod engine;

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::types::SearchResult;

pub use engine::ScrapedEngine;

/// A source of candidate results for a query. Implemented by the
/// scraping engines; stubbed in tests.
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// The result cache the federator reads and writes. Implementations
/// are expected to do their own locking; the federator never holds a
/// lock across a provider call.
pub trait ResultCache {
    fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
    fn sync_from(&self, results: &[SearchResult]) -> Result<usize>;
}

impl ResultCache for crate::db::ResultStore {
    fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        crate::db::ResultStore::search(self, query)
    }

    fn sync_from(&self, results: &[SearchResult]) -> Result<usize> {
        crate::db::ResultStore::sync_from(self, results)
    }
}

/// The search federator.
pub struct Seeker {
    providers: Vec<Box<dyn SearchProvider>>,
    minimum_results_threshold: usize,
}

impl Seeker {
    pub fn new(providers: Vec<Box<dyn SearchProvider>>, minimum_results_threshold: usize) -> Self {
        Seeker {
            providers,
            minimum_results_threshold,
        }
    }

    /// Build the federator with one scraping engine per configured
    /// descriptor.
    pub fn from_config(engines: &[EngineConfig], minimum_results_threshold: usize) -> Self {
        let providers = engines
            .iter()
            .map(|e| Box::new(ScrapedEngine::new(e)) as Box<dyn SearchProvider>)
            .collect();
        Seeker::new(providers, minimum_results_threshold)
    }

    /// Serve a query: cache hits, then engines if the cache was too
    /// thin, then write-back. A failing engine only loses its own
    /// contribution.
    pub fn search(
        &self,
        cache: &dyn ResultCache,
        query: &str,
        filter_content_types: &[String],
    ) -> Result<Vec<SearchResult>> {
        let mut results = cache.search(query)?;
        if results.len() > self.minimum_results_threshold {
            return Ok(Self::filtered(results, filter_content_types));
        }

        let mut seen: HashSet<_> = results.iter().map(|r| r.hash).collect();
        for provider in &self.providers {
            debug!("Searching results from {}", provider.name());
            match provider.search(query) {
                Ok(found) => {
                    for result in found {
                        if seen.insert(result.hash) {
                            results.push(result);
                        }
                    }
                }
                Err(e) => warn!("Engine '{}' failed: {:#}", provider.name(), e),
            }
        }

        cache.sync_from(&results)?;
        Ok(Self::filtered(results, filter_content_types))
    }

    // content-type filtering is reserved; the empty list passes
    // everything through
    fn filtered(results: Vec<SearchResult>, content_types: &[String]) -> Vec<SearchResult> {
        if content_types.is_empty() {
            return results;
        }
        results
            .into_iter()
            .filter(|r| content_types.iter().any(|ct| *ct == r.content_type))
            .collect()
    }
}
