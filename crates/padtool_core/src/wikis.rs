use anyhow::{Context, Result, bail};
use reqwest::Url;
use serde::Serialize;

pub const WIKI_SHORTCUTS: &[(&str, &str)] = &[
    ("commons", "https://commons.wikimedia.org/w/api.php"),
    ("incubator", "https://incubator.wikimedia.org/w/api.php"),
    ("mediawiki", "https://www.mediawiki.org/w/api.php"),
    ("meta", "https://meta.wikimedia.org/w/api.php"),
    ("outreach", "https://outreach.wikimedia.org/w/api.php"),
    ("species", "https://species.wikimedia.org/w/api.php"),
    ("wikibooks", "https://en.wikibooks.org/w/api.php"),
    ("wikidata", "https://www.wikidata.org/w/api.php"),
    ("wikimania", "https://wikimania.wikimedia.org/w/api.php"),
    ("wikinews", "https://en.wikinews.org/w/api.php"),
    ("wikiquote", "https://en.wikiquote.org/w/api.php"),
    ("wikisource", "https://en.wikisource.org/w/api.php"),
    ("wikitech", "https://wikitech.wikimedia.org/w/api.php"),
    ("wikiversity", "https://en.wikiversity.org/w/api.php"),
    ("wikivoyage", "https://en.wikivoyage.org/w/api.php"),
    ("wiktionary", "https://en.wiktionary.org/w/api.php"),
];

const SISTER_PROJECTS: &[&str] = &[
    "wikipedia",
    "wikibooks",
    "wikisource",
    "wikinews",
    "wikiquote",
    "wikiversity",
    "wikivoyage",
    "wiktionary",
];

/// Where an index comes from: the API endpoint plus the names derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiTarget {
    pub api_url: String,
    pub wiki_base_url: String,
    pub wiki_label: String,
}

impl WikiTarget {
    pub fn from_shortcut(name: &str) -> Result<Self> {
        Self::from_api_url(&resolve_api_url(name)?)
    }

    pub fn from_api_url(api_url: &str) -> Result<Self> {
        let parsed =
            Url::parse(api_url.trim()).with_context(|| format!("invalid API URL: {api_url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("API URL has no host: {api_url}"))?;
        Ok(Self {
            api_url: api_url.trim().to_string(),
            wiki_base_url: wiki_base_url(api_url.trim()),
            wiki_label: wiki_label(host),
        })
    }

    /// Canonical page URL for a title on this wiki.
    pub fn page_url(&self, title: &str) -> String {
        format!("{}{}", self.wiki_base_url, title.trim().replace(' ', "_"))
    }
}

/// Resolve a wiki shortcut (`meta`), a `<lang>.<project>` pattern, or a bare
/// Wikipedia language code to its API URL.
pub fn resolve_api_url(wiki_name: &str) -> Result<String> {
    let name = wiki_name.trim().to_ascii_lowercase();
    if name.is_empty() {
        bail!("wiki name cannot be empty");
    }
    if let Some((_, url)) = WIKI_SHORTCUTS.iter().find(|(key, _)| *key == name) {
        return Ok((*url).to_string());
    }
    if let Some((lang, project)) = name.split_once('.') {
        if SISTER_PROJECTS.contains(&project) {
            return Ok(format!("https://{lang}.{project}.org/w/api.php"));
        }
        if project == "wikimedia" {
            return Ok(format!("https://{lang}.wikimedia.org/w/api.php"));
        }
    }
    Ok(format!("https://{name}.wikipedia.org/w/api.php"))
}

/// `https://meta.wikimedia.org/w/api.php` becomes `https://meta.wikimedia.org/wiki/`.
pub fn wiki_base_url(api_url: &str) -> String {
    if let Some(root) = api_url.strip_suffix("/w/api.php") {
        return format!("{root}/wiki/");
    }
    if let Some(root) = api_url.strip_suffix("/api.php") {
        return format!("{root}/index.php?title=");
    }
    format!("{}/", api_url.trim_end_matches('/'))
}

/// Short file-name label: `meta.wikimedia.org` becomes `meta_wikimedia`.
pub fn wiki_label(host: &str) -> String {
    host.replace(".org", "").replace('.', "_").replace("www_", "")
}
