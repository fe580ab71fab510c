//! Extraction of structured data from wikidot's HTML.
//!
//! Wikidot has no public read API, so identifiers, metadata and revision
//! tables are scraped from markup meant for browsers. Each extraction lives
//! behind [`MarkupScraper`] so that the textual contract can be swapped or
//! tested without networking.

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::Serialize;

/// Class prefix used by the list-query template markers.
pub const MARKER_PREFIX: &str = "wdsync";

/// ListPages body used when a page hides its toolbar (private sites).
pub const LIST_QUERY_TEMPLATE: &str = "[[div class=\"wdsync-meta\"]]\n\
[[span class=\"wdsync-title\"]]%%title%%[[/span]]\n\
[[span class=\"wdsync-parent\"]]%%parent_fullname%%[[/span]]\n\
[[span class=\"wdsync-tags\"]]%%tags%%[[/span]]\n\
[[span class=\"wdsync-revision\"]]%%revisions%%[[/span]]\n\
[[/div]]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedMetadata {
    pub title: Option<String>,
    pub parent: Option<String>,
    pub tags: Vec<String>,
    pub revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionEntry {
    pub revision_id: u64,
    pub number: u64,
    pub author: Option<String>,
    pub date: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub name: Option<String>,
    pub id: Option<u64>,
}

pub trait MarkupScraper {
    /// Numeric page id embedded in the page's request-info script.
    fn page_id(&self, html: &str) -> Option<u64>;
    /// Title, tags, parent and revision from the standard page toolbar.
    fn toolbar_metadata(&self, html: &str) -> ScrapedMetadata;
    /// Metadata from a rendered [`LIST_QUERY_TEMPLATE`]; `None` when no marker is present.
    fn list_query_metadata(&self, html: &str) -> Option<ScrapedMetadata>;
    fn revision_list(&self, html: &str) -> Vec<RevisionEntry>;
    fn page_source(&self, html: &str) -> Option<String>;
    fn user_profile(&self, html: &str) -> UserProfile;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlScraper;

impl MarkupScraper for HtmlScraper {
    fn page_id(&self, html: &str) -> Option<u64> {
        let document = Html::parse_document(html);
        let scripts = selector("head script")?;
        let pattern = Regex::new(r"WIKIREQUEST\.info\.pageId\s*=\s*(\d+)\s*;").ok()?;
        document
            .select(&scripts)
            .map(|script| script.text().collect::<String>())
            .filter(|text| text.contains("WIKIREQUEST"))
            .find_map(|text| capture_number(&pattern, &text))
    }

    fn toolbar_metadata(&self, html: &str) -> ScrapedMetadata {
        let document = Html::parse_document(html);
        let mut meta = ScrapedMetadata {
            title: first_text(&document, "#page-title"),
            ..ScrapedMetadata::default()
        };

        if let Some(tag_links) = selector("div.page-tags span > a") {
            meta.tags = document
                .select(&tag_links)
                .map(element_text)
                .filter(|tag| !tag.is_empty())
                .collect();
        }

        if let Some(crumbs) = selector("#breadcrumbs > a") {
            meta.parent = document
                .select(&crumbs)
                .last()
                .and_then(|link| link.value().attr("href"))
                .map(|href| href.trim_start_matches('/').to_string())
                .filter(|href| !href.is_empty());
        }

        if let Some(info) = selector("#page-info")
            && let Some(element) = document.select(&info).next()
        {
            // Only the element's own text: child spans hold the edit date.
            let own_text: String = element
                .children()
                .filter_map(|child| match child.value() {
                    Node::Text(text) => Some(&**text),
                    _ => None,
                })
                .collect();
            meta.revision = first_number(&own_text);
        }
        meta
    }

    fn list_query_metadata(&self, html: &str) -> Option<ScrapedMetadata> {
        let document = Html::parse_fragment(html);
        let marker = |name: &str| first_text(&document, &format!("span.{MARKER_PREFIX}-{name}"));
        let revision_marker = selector(&format!("span.{MARKER_PREFIX}-revision"))?;
        if document.select(&revision_marker).next().is_none() {
            return None;
        }
        Some(ScrapedMetadata {
            title: marker("title"),
            parent: marker("parent"),
            tags: marker("tags")
                .map(|tags| tags.split_whitespace().map(ToString::to_string).collect())
                .unwrap_or_default(),
            revision: marker("revision").and_then(|value| first_number(&value)),
        })
    }

    fn revision_list(&self, html: &str) -> Vec<RevisionEntry> {
        let document = Html::parse_fragment(html);
        let (Some(rows), Some(cells), Some(author), Some(date)) = (
            selector("tr[id^=\"revision-row-\"]"),
            selector("td"),
            selector("span.printuser"),
            selector("span.odate"),
        ) else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        for row in document.select(&rows) {
            let Some(revision_id) = row
                .value()
                .id()
                .and_then(|id| id.strip_prefix("revision-row-"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            let columns: Vec<ElementRef<'_>> = row.select(&cells).collect();
            let Some(number) = columns
                .first()
                .and_then(|cell| first_number(&element_text(*cell)))
            else {
                continue;
            };
            let comment = if columns.len() > 1 {
                columns
                    .last()
                    .map(|cell| element_text(*cell))
                    .filter(|text| !text.is_empty())
            } else {
                None
            };
            entries.push(RevisionEntry {
                revision_id,
                number,
                author: row
                    .select(&author)
                    .next()
                    .map(element_text)
                    .filter(|text| !text.is_empty()),
                date: row
                    .select(&date)
                    .next()
                    .map(element_text)
                    .filter(|text| !text.is_empty()),
                comment,
            });
        }
        entries
    }

    fn page_source(&self, html: &str) -> Option<String> {
        let document = Html::parse_fragment(html);
        let source = selector("div.page-source")?;
        let element = document.select(&source).next()?;
        let mut output = String::new();
        let mut after_break = false;
        for node in element.descendants() {
            match node.value() {
                Node::Text(text) => {
                    // Markup newlines after <br> are formatting, not content.
                    let text: &str = text;
                    let text = if after_break {
                        text.strip_prefix('\n').unwrap_or(text)
                    } else {
                        text
                    };
                    output.push_str(text);
                    after_break = false;
                }
                Node::Element(element) if element.name() == "br" => {
                    output.push('\n');
                    after_break = true;
                }
                _ => {}
            }
        }
        let output = output.replace('\u{a0}', " ");
        Some(output.trim_matches('\n').to_string())
    }

    fn user_profile(&self, html: &str) -> UserProfile {
        let document = Html::parse_document(html);
        let name = first_text(&document, "h1.profile-title")
            .map(|name| name.replace('\n', "").trim().to_string())
            .filter(|name| !name.is_empty());
        let id = Regex::new(r"USERINFO\.userId\s*=\s*(\d+)\s*;")
            .ok()
            .and_then(|pattern| capture_number(&pattern, html));
        UserProfile { name, id }
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    document
        .select(&selector)
        .next()
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn capture_number(pattern: &Regex, text: &str) -> Option<u64> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse::<u64>().ok())
}

fn first_number(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u64>().ok()
}
