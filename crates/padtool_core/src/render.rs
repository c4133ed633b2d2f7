//! Output formatters for a finished index, plus atomic file writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::index::{EtherpadIndex, PageEntry};

/// Reserved characters left literal in page URLs, beyond what `urlencoding` keeps.
const URL_SAFE_PUNCTUATION: &str = "/:@!$&'()*+,;=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Wikicode,
    Csv,
    Urls,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [Self::Json, Self::Wikicode, Self::Csv, Self::Urls];

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "wikicode" | "wiki" => Ok(Self::Wikicode),
            "csv" => Ok(Self::Csv),
            "urls" | "txt" => Ok(Self::Urls),
            _ => bail!("unsupported output format: {value} (expected json|wikicode|csv|urls)"),
        }
    }

    pub fn file_name(self, label: &str) -> String {
        let label = if label.trim().is_empty() { "wiki" } else { label };
        match self {
            Self::Json => format!("{label}_etherpad_links.json"),
            Self::Wikicode => format!("{label}_etherpad_wikicode.txt"),
            Self::Csv => format!("{label}_etherpad_links.csv"),
            Self::Urls => format!("{label}_etherpad_urls.txt"),
        }
    }

    pub fn render(self, index: &EtherpadIndex) -> Result<String> {
        match self {
            Self::Json => render_json(index),
            Self::Wikicode => Ok(render_wikicode(index)),
            Self::Csv => Ok(render_csv(index)),
            Self::Urls => Ok(render_url_list(index)),
        }
    }
}

/// Render each requested format into `output_dir`. Returns the written paths.
pub fn write_outputs(
    index: &EtherpadIndex,
    output_dir: &Path,
    formats: &[OutputFormat],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let mut written = Vec::with_capacity(formats.len());
    for format in formats {
        let path = output_dir.join(format.file_name(&index.source().wiki_label));
        write_atomic(&path, format.render(index)?.as_bytes())?;
        written.push(path);
    }
    Ok(written)
}

/// Write the index artifact consumed by `download`.
pub fn write_json(index: &EtherpadIndex, path: &Path) -> Result<()> {
    write_atomic(path, render_json(index)?.as_bytes())
}

pub fn write_json_value<S: Serialize>(value: &S, path: &Path) -> Result<()> {
    let mut rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    rendered.push('\n');
    write_atomic(path, rendered.as_bytes())
}

/// Write through a sibling temp file and rename, so readers never see a
/// partial file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".partial");
    let temp_path = path.with_file_name(temp_name);
    fs::write(&temp_path, content)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

pub fn render_json(index: &EtherpadIndex) -> Result<String> {
    let mut rendered = serde_json::to_string_pretty(&index.to_document())
        .context("failed to serialize index artifact")?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn render_url_list(index: &EtherpadIndex) -> String {
    let mut urls = index.unique_urls().collect::<Vec<_>>();
    urls.sort_unstable();
    let mut output = String::new();
    for url in urls {
        output.push_str(url);
        output.push('\n');
    }
    output
}

/// One row per citation, pages by title and URLs sorted within a page.
pub fn render_csv(index: &EtherpadIndex) -> String {
    let mut output = String::from("Etherpad URL,Wiki Page,Wiki Page URL\r\n");
    for page in pages_by_title(index) {
        let mut urls = page.etherpad_urls.iter().collect::<Vec<_>>();
        urls.sort();
        for url in urls {
            output.push_str(&format!(
                "{},{},{}\r\n",
                csv_field(url),
                csv_field(&page.title),
                csv_field(&page.page_url)
            ));
        }
    }
    output
}

pub fn render_wikicode(index: &EtherpadIndex) -> String {
    let source = index.source();
    let stats = index.stats();
    let pages = pages_by_title(index);
    let label = if source.wiki_label.is_empty() {
        "wiki"
    } else {
        source.wiki_label.as_str()
    };

    let year_prefixed = pages.iter().filter(|page| has_year_prefix(&page.title)).count() * 2
        > pages.len();
    let mut groups: BTreeMap<String, Vec<&PageEntry>> = BTreeMap::new();
    for page in &pages {
        groups
            .entry(group_key(&page.title, year_prefixed))
            .or_default()
            .push(page);
    }
    let section_title = |group: &str| {
        if year_prefixed && group.chars().all(|ch| ch.is_ascii_digit()) {
            format!("Wikimania {group}")
        } else {
            group.to_string()
        }
    };
    let is_meta = source.wiki_base_url.contains("meta.wikimedia.org");

    let mut out = String::new();
    out.push_str(&format!("= Etherpad Links on {label} =\n\n"));
    out.push_str(&format!(
        "This page catalogs all external links to <code>{}</code> found on [{} {label}]. \
         Wikimedia Foundation is phasing out Etherpad; this inventory is intended to \
         facilitate archiving before the service is discontinued.\n\n",
        if source.query.is_empty() {
            "etherpad.wikimedia.org"
        } else {
            source.query.as_str()
        },
        source.wiki_base_url
    ));

    out.push_str("{| class=\"wikitable\"\n|-\n! Statistic !! Count\n");
    out.push_str(&format!(
        "|-\n| Unique Etherpad URLs || '''{}'''\n",
        group_thousands(stats.unique_etherpad_urls)
    ));
    out.push_str(&format!(
        "|-\n| Wiki pages with Etherpad links || '''{}'''\n",
        group_thousands(stats.unique_wiki_pages)
    ));
    out.push_str(&format!(
        "|-\n| Total link instances (incl. duplicates) || '''{}'''\n",
        group_thousands(stats.total_results)
    ));
    out.push_str("|}\n\n");

    let nav = groups
        .keys()
        .map(|group| {
            let title = section_title(group);
            format!("[[#{}|{title}]]", title.replace(' ', "_"))
        })
        .collect::<Vec<_>>()
        .join(" '''·''' ");
    out.push_str(
        "<div style=\"text-align:center; background:#f8f9fa; border:1px solid #a2a9b1; \
         padding:8px; margin:10px 0; font-size:120%;\">\n",
    );
    out.push_str(&format!("'''Navigate:''' {nav}\n</div>\n\n"));
    out.push_str("__TOC__\n\n");

    for (group, members) in &groups {
        let link_count: usize = members.iter().map(|page| page.etherpad_urls.len()).sum();
        out.push_str(&format!("\n== {} ==\n", section_title(group)));
        out.push_str(&format!(
            "'''{}''' pages, '''{link_count}''' Etherpad links\n\n",
            members.len()
        ));
        for page in members {
            if is_meta {
                out.push_str(&format!("=== [[{}]] ===\n", page.title));
            } else {
                out.push_str(&format!(
                    "=== [{} {}] ===\n",
                    external_page_url(&source.wiki_base_url, page),
                    page.title
                ));
            }
            let mut urls = page.etherpad_urls.iter().collect::<Vec<_>>();
            urls.sort();
            for url in urls {
                out.push_str(&format!("* [{url} {url}]\n"));
            }
            out.push('\n');
        }
    }
    out
}

fn pages_by_title(index: &EtherpadIndex) -> Vec<&PageEntry> {
    let mut pages = index.page_to_urls().iter().collect::<Vec<_>>();
    pages.sort_by(|left, right| left.title.cmp(&right.title));
    pages
}

fn has_year_prefix(title: &str) -> bool {
    title.len() >= 4 && title.as_bytes()[..4].iter().all(u8::is_ascii_digit)
}

fn group_key(title: &str, year_prefixed: bool) -> String {
    if year_prefixed {
        if has_year_prefix(title) {
            return title[..4].to_string();
        }
        return match title.split_once(':') {
            Some((namespace, _)) => namespace.to_string(),
            None => "Other".to_string(),
        };
    }
    title
        .chars()
        .next()
        .map(|first| first.to_uppercase().collect())
        .unwrap_or_else(|| "?".to_string())
}

fn external_page_url(wiki_base_url: &str, page: &PageEntry) -> String {
    if wiki_base_url.is_empty() {
        return page.page_url.clone();
    }
    format!(
        "{wiki_base_url}{}",
        percent_encode_title(&page.title.replace(' ', "_"))
    )
}

fn percent_encode_title(title: &str) -> String {
    let mut output = String::with_capacity(title.len());
    let mut buffer = [0u8; 4];
    for ch in title.chars() {
        if URL_SAFE_PUNCTUATION.contains(ch) {
            output.push(ch);
        } else {
            output.push_str(&urlencoding::encode(ch.encode_utf8(&mut buffer)));
        }
    }
    output
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn group_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut output = String::with_capacity(digits.len() + digits.len() / 3);
    for (position, ch) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            output.push(',');
        }
        output.push(ch);
    }
    output
}
