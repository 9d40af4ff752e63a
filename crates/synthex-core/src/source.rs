//! Where documents come from: the arXiv search API and local PDF files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

use crate::Paper;

pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("XML parse error: {0}")]
    Xml(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata for a document found by a search, before it is downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub stable_identifier: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub pdf_url: Option<String>,
}

impl DocumentMeta {
    pub fn to_paper(&self) -> Paper {
        Paper {
            stable_identifier: self.stable_identifier.clone(),
            title: Some(self.title.clone()).filter(|t| !t.is_empty()),
            authors: self.authors.clone(),
            abstract_text: self.abstract_text.clone(),
        }
    }
}

/// Client for the arXiv Atom API.
pub struct ArxivSource {
    client: reqwest::Client,
    api_url: String,
}

impl Default for ArxivSource {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ArxivSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: ARXIV_API_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Search arXiv by relevance.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<DocumentMeta>, SourceError> {
        let url = format!(
            "{}?search_query=all:{}&start=0&max_results={}&sortBy=relevance",
            self.api_url,
            urlencoding::encode(query),
            max_results
        );
        tracing::info!(query, max_results, "searching arXiv");

        let resp = self
            .client
            .get(&url)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        let entries = parse_atom_feed(&body)?;
        tracing::info!(found = entries.len(), "arXiv search complete");
        Ok(entries)
    }

    /// Fetch a PDF into `dir`, named after `title`. An existing file of the
    /// same name is reused without downloading.
    pub async fn download_pdf(
        &self,
        url: &str,
        dir: &Path,
        title: &str,
    ) -> Result<PathBuf, SourceError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(pdf_file_name(url, title));

        if path.exists() {
            tracing::debug!(path = %path.display(), "PDF already downloaded");
            return Ok(path);
        }

        tracing::info!(url, path = %path.display(), "downloading PDF");
        let resp = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }
}

/// Paper identity for a PDF on disk. Without an explicit identifier the
/// canonical absolute path is used as `file://<path>`, so equally named files
/// in different folders stay distinct.
pub fn local_document(path: &Path, identifier: Option<&str>, title: Option<&str>) -> Paper {
    let stable_identifier = match identifier.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let resolved = std::fs::canonicalize(path)
                .or_else(|_| std::path::absolute(path))
                .unwrap_or_else(|_| path.to_path_buf());
            format!("file://{}", resolved.display())
        }
    };

    let title = title
        .map(str::to_string)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()));

    Paper {
        stable_identifier,
        title,
        authors: Vec::new(),
        abstract_text: None,
    }
}

/// Title-derived file name (alphanumerics and spaces, spaces as `_`),
/// falling back to the URL's last segment.
fn pdf_file_name(url: &str, title: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect();
    let safe = safe.trim().replace(' ', "_");
    if !safe.is_empty() {
        return format!("{}.pdf", safe);
    }

    let last = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    if last.ends_with(".pdf") {
        last.to_string()
    } else {
        format!("{}.pdf", last)
    }
}

/// `http://arxiv.org/abs/2301.01234v2` → `arXiv:2301.01234`.
fn arxiv_identifier(entry_id: &str) -> String {
    let id = entry_id
        .trim()
        .split("/abs/")
        .nth(1)
        .unwrap_or(entry_id.trim());
    let id = match id.rsplit_once('v') {
        Some((base, version))
            if !base.is_empty()
                && !version.is_empty()
                && version.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => id,
    };
    format!("arXiv:{}", id)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an arXiv Atom feed into document metadata, in feed order.
pub fn parse_atom_feed(xml: &str) -> Result<Vec<DocumentMeta>, SourceError> {
    let mut reader = Reader::from_str(xml);

    let mut in_entry = false;
    let mut in_author = false;
    let mut field: Option<&'static str> = None;

    let mut id = String::new();
    let mut title = String::new();
    let mut summary = String::new();
    let mut name = String::new();
    let mut authors: Vec<String> = Vec::new();
    let mut pdf_url: Option<String> = None;

    let mut entries = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"entry" => {
                    in_entry = true;
                    id.clear();
                    title.clear();
                    summary.clear();
                    authors.clear();
                    pdf_url = None;
                }
                b"id" if in_entry && !in_author => field = Some("id"),
                b"title" if in_entry => field = Some("title"),
                b"summary" if in_entry => field = Some("summary"),
                b"author" if in_entry => {
                    in_author = true;
                    name.clear();
                }
                b"name" if in_author => field = Some("name"),
                b"link" if in_entry => pdf_url = pdf_url.or_else(|| pdf_link(e)),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if in_entry && e.local_name().as_ref() == b"link" {
                    pdf_url = pdf_url.or_else(|| pdf_link(e));
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                match field {
                    Some("id") => id.push_str(&text),
                    Some("title") => title.push_str(&text),
                    Some("summary") => summary.push_str(&text),
                    Some("name") => name.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"entry" => {
                    if !id.trim().is_empty() {
                        let summary = collapse_whitespace(&summary);
                        entries.push(DocumentMeta {
                            stable_identifier: arxiv_identifier(&id),
                            title: collapse_whitespace(&title),
                            authors: std::mem::take(&mut authors),
                            abstract_text: Some(summary).filter(|s| !s.is_empty()),
                            pdf_url: pdf_url.take(),
                        });
                    }
                    in_entry = false;
                }
                b"author" => {
                    let trimmed = name.trim();
                    if !trimmed.is_empty() {
                        authors.push(trimmed.to_string());
                    }
                    in_author = false;
                }
                b"id" | b"title" | b"summary" | b"name" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn pdf_link(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut is_pdf = false;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"href" => href = Some(String::from_utf8_lossy(&attr.value).to_string()),
            b"title" if attr.value.as_ref() == b"pdf" => is_pdf = true,
            b"type" if attr.value.as_ref() == b"application/pdf" => is_pdf = true,
            _ => {}
        }
    }
    href.filter(|_| is_pdf)
}
