//! Bidirectional Etherpad URL <-> citing page index.
//!
//! Both views are maintained by a single [`EtherpadIndex::insert`], so they
//! stay exact inverses of the same set of citations.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// One observed citation of an Etherpad URL on a wiki page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub etherpad_url: String,
    pub page_title: String,
    pub page_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitingPage {
    pub title: String,
    pub page_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub etherpad_url: String,
    pub pages: Vec<CitingPage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub title: String,
    pub page_url: String,
    pub etherpad_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Raw link instances returned by the API, duplicates included.
    pub total_results: usize,
    pub unique_etherpad_urls: usize,
    pub unique_wiki_pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSource {
    pub api_url: String,
    pub wiki_base_url: String,
    pub wiki_label: String,
    pub query: String,
}

#[derive(Debug, Clone, Default)]
pub struct EtherpadIndex {
    source: IndexSource,
    urls: Vec<UrlEntry>,
    pages: Vec<PageEntry>,
    url_slots: HashMap<String, usize>,
    page_slots: HashMap<String, usize>,
    citations: HashSet<(String, String)>,
    total_results: usize,
}

/// On-disk shape of the index artifact. Arrays keep discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub source: IndexSource,
    pub stats: IndexStats,
    pub url_to_pages: Vec<UrlEntry>,
    pub page_to_urls: Vec<PageEntry>,
}

/// Scheme-agnostic form of a URL, used as its identity.
pub fn url_key(url: &str) -> String {
    let trimmed = url.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let rest = ["https://", "http://", "//"]
        .iter()
        .find(|prefix| lowered.starts_with(**prefix))
        .map(|prefix| &trimmed[prefix.len()..])
        .unwrap_or(trimmed);
    rest.to_string()
}

impl EtherpadIndex {
    pub fn new(source: IndexSource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    /// Fold one citation in. Returns false when `(url, title)` was already
    /// present under either scheme.
    pub fn insert(&mut self, record: &LinkRecord) -> bool {
        self.total_results += 1;
        let key = url_key(&record.etherpad_url);
        if !self
            .citations
            .insert((key.clone(), record.page_title.clone()))
        {
            return false;
        }

        let url_slot = match self.url_slots.get(&key) {
            Some(slot) => *slot,
            None => {
                self.urls.push(UrlEntry {
                    etherpad_url: record.etherpad_url.clone(),
                    pages: Vec::new(),
                });
                self.url_slots.insert(key, self.urls.len() - 1);
                self.urls.len() - 1
            }
        };
        let page_slot = match self.page_slots.get(&record.page_url) {
            Some(slot) => *slot,
            None => {
                self.pages.push(PageEntry {
                    title: record.page_title.clone(),
                    page_url: record.page_url.clone(),
                    etherpad_urls: Vec::new(),
                });
                self.page_slots
                    .insert(record.page_url.clone(), self.pages.len() - 1);
                self.pages.len() - 1
            }
        };

        let display_url = self.urls[url_slot].etherpad_url.clone();
        self.urls[url_slot].pages.push(CitingPage {
            title: record.page_title.clone(),
            page_url: record.page_url.clone(),
        });
        self.pages[page_slot].etherpad_urls.push(display_url);
        true
    }

    pub fn source(&self) -> &IndexSource {
        &self.source
    }

    pub fn url_to_pages(&self) -> &[UrlEntry] {
        &self.urls
    }

    pub fn page_to_urls(&self) -> &[PageEntry] {
        &self.pages
    }

    /// Unique target URLs in discovery order.
    pub fn unique_urls(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(|entry| entry.etherpad_url.as_str())
    }

    pub fn pages_citing(&self, etherpad_url: &str) -> Option<&[CitingPage]> {
        self.url_slots
            .get(&url_key(etherpad_url))
            .map(|slot| self.urls[*slot].pages.as_slice())
    }

    pub fn urls_on_page(&self, page_url: &str) -> Option<&[String]> {
        self.page_slots
            .get(page_url)
            .map(|slot| self.pages[*slot].etherpad_urls.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_results: self.total_results,
            unique_etherpad_urls: self.urls.len(),
            unique_wiki_pages: self.pages.len(),
        }
    }

    pub fn to_document(&self) -> IndexDocument {
        IndexDocument {
            source: self.source.clone(),
            stats: self.stats(),
            url_to_pages: self.urls.clone(),
            page_to_urls: self.pages.clone(),
        }
    }

    /// Rebuild an index from its artifact, rejecting documents whose two
    /// mappings are not exact inverses.
    pub fn from_document(document: IndexDocument) -> Result<Self> {
        let mut index = Self::new(document.source);
        index.total_results = document.stats.total_results;

        for (slot, page) in document.page_to_urls.iter().enumerate() {
            if index.page_slots.insert(page.page_url.clone(), slot).is_some() {
                bail!("duplicate page in page_to_urls: {}", page.page_url);
            }
        }
        for (slot, entry) in document.url_to_pages.iter().enumerate() {
            let key = url_key(&entry.etherpad_url);
            if index.url_slots.insert(key.clone(), slot).is_some() {
                bail!("duplicate URL in url_to_pages: {}", entry.etherpad_url);
            }
            for page in &entry.pages {
                if !index.citations.insert((key.clone(), page.title.clone())) {
                    bail!(
                        "duplicate citation of {} on {}",
                        entry.etherpad_url,
                        page.title
                    );
                }
                let listed = index
                    .page_slots
                    .get(&page.page_url)
                    .map(|slot| &document.page_to_urls[*slot])
                    .is_some_and(|reverse| {
                        reverse.title == page.title
                            && reverse.etherpad_urls.contains(&entry.etherpad_url)
                    });
                if !listed {
                    bail!(
                        "index artifact is inconsistent: {} -> {} has no inverse entry",
                        entry.etherpad_url,
                        page.page_url
                    );
                }
            }
        }

        let forward = index.citations.len();
        let reverse: usize = document
            .page_to_urls
            .iter()
            .map(|page| page.etherpad_urls.len())
            .sum();
        if forward != reverse {
            bail!(
                "index artifact is inconsistent: {forward} citations in url_to_pages, {reverse} in page_to_urls"
            );
        }
        if document.stats.unique_etherpad_urls != document.url_to_pages.len()
            || document.stats.unique_wiki_pages != document.page_to_urls.len()
        {
            bail!("index artifact stats do not match its mappings");
        }

        index.urls = document.url_to_pages;
        index.pages = document.page_to_urls;
        Ok(index)
    }
}

pub fn load_index(path: &Path) -> Result<EtherpadIndex> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let document: IndexDocument = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse index artifact {}", path.display()))?;
    EtherpadIndex::from_document(document)
        .with_context(|| format!("invalid index artifact {}", path.display()))
}
