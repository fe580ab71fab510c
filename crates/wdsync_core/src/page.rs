use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WikidotError};
use crate::names::{site_base_url, unix_name, url_join};
use crate::scrape::{HtmlScraper, LIST_QUERY_TEMPLATE, MarkupScraper, RevisionEntry};
use crate::transport::{Connector, Transport};

pub const TEMPLATE_SOURCE_MODULE: &str = "edit/TemplateSourceModule";
pub const REVISION_LIST_MODULE: &str = "history/PageRevisionListModule";
pub const PAGE_SOURCE_MODULE: &str = "history/PageSourceModule";
pub const LIST_PAGES_MODULE: &str = "list/ListPagesModule";
pub const PREVIEW_MODULE: &str = "edit/PagePreviewModule";
/// Page size used when the whole revision list is needed.
pub const FULL_HISTORY: usize = 10_000;

/// Metadata of a page at one revision. Built fresh on every resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_tags",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(skip)]
    pub exists: Option<bool>,
}

/// Tags may be written as a YAML list or as one space-separated string.
fn deserialize_tags<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagsField {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Option::<TagsField>::deserialize(deserializer)? {
        Some(TagsField::List(tags)) => tags,
        Some(TagsField::Text(text)) => text.split_whitespace().map(ToString::to_string).collect(),
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRef {
    Name(String),
    Id(u64),
}

impl PageRef {
    pub fn label(&self) -> String {
        match self {
            Self::Name(name) => unix_name(name),
            Self::Id(id) => id.to_string(),
        }
    }
}

impl From<&str> for PageRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// How to derive page existence from the HTTP status of the rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistenceCheck {
    #[default]
    Skip,
    /// Exists unless the status is 404.
    NotFoundStatus,
    /// Exists only for a 2xx status.
    OkRange,
}

#[derive(Debug, Clone, Copy)]
pub struct PageQuery<'a> {
    pub site: &'a str,
    pub page: &'a str,
    pub session: Option<&'a str>,
    pub existence: ExistenceCheck,
}

#[derive(Debug, Clone)]
pub struct FetchedHtml {
    pub html: String,
    pub status: u16,
    pub exists: Option<bool>,
}

pub fn page_url(site: &str, page: &str) -> String {
    url_join(&site_base_url(site), &[&unix_name(page), "norender/true"])
}

pub struct PageResolver<'t, C: Connector> {
    transport: &'t Transport<C>,
    scraper: Box<dyn MarkupScraper + 't>,
}

impl<'t, C: Connector> PageResolver<'t, C> {
    pub fn new(transport: &'t Transport<C>) -> Self {
        Self {
            transport,
            scraper: Box::new(HtmlScraper),
        }
    }

    pub fn with_scraper(mut self, scraper: impl MarkupScraper + 't) -> Self {
        self.scraper = Box::new(scraper);
        self
    }

    pub fn transport(&self) -> &Transport<C> {
        self.transport
    }

    pub fn fetch_html(
        &self,
        site: &str,
        page: &str,
        session: Option<&str>,
        existence: ExistenceCheck,
    ) -> Result<FetchedHtml> {
        let url = page_url(site, page);
        let reply = self.transport.get_page(&url, session)?;
        if reply.status >= 500 {
            return Err(WikidotError::Transport {
                url,
                status: Some(reply.status),
                message: format!("HTTP {}", reply.status),
            });
        }
        let exists = match existence {
            ExistenceCheck::Skip => None,
            ExistenceCheck::NotFoundStatus => Some(reply.status != 404),
            ExistenceCheck::OkRange => Some(reply.is_success()),
        };
        Ok(FetchedHtml {
            html: reply.body,
            status: reply.status,
            exists,
        })
    }

    pub fn resolve_id(&self, site: &str, page: &PageRef, session: Option<&str>) -> Result<u64> {
        let name = match page {
            PageRef::Id(id) => return Ok(*id),
            PageRef::Name(name) => name,
        };
        let fetched = self.fetch_html(site, name, session, ExistenceCheck::Skip)?;
        self.scraper
            .page_id(&fetched.html)
            .ok_or_else(|| WikidotError::NotFound {
                site: site.to_string(),
                page: unix_name(name),
            })
    }

    pub fn get_metadata(&self, query: &PageQuery<'_>) -> Result<PageMetadata> {
        let page = unix_name(query.page);
        let fetched = self.fetch_html(query.site, &page, query.session, query.existence)?;
        let scraped = self.scraper.toolbar_metadata(&fetched.html);
        let mut meta = PageMetadata {
            site: query.site.to_string(),
            page,
            title: scraped.title,
            parent: scraped.parent,
            tags: scraped.tags,
            revision: scraped.revision,
            exists: fetched.exists,
        };

        if meta.revision.is_none() && meta.exists == Some(true) {
            info!(site = query.site, page = %meta.page, "page toolbar missing, using list query");
            if let Some(fallback) = self.list_query_metadata(query.site, &meta.page, query.session)? {
                meta.title = meta.title.or(fallback.title);
                meta.parent = meta.parent.or(fallback.parent);
                if meta.tags.is_empty() {
                    meta.tags = fallback.tags;
                }
                meta.revision = fallback.revision;
            }
        }
        Ok(meta)
    }

    fn list_query_metadata(
        &self,
        site: &str,
        page: &str,
        session: Option<&str>,
    ) -> Result<Option<crate::scrape::ScrapedMetadata>> {
        let response = self.transport.send_module(
            site,
            session,
            LIST_PAGES_MODULE,
            &[
                ("fullname", page.to_string()),
                ("perPage", "1".to_string()),
                ("separate", "no".to_string()),
                ("module_body", LIST_QUERY_TEMPLATE.to_string()),
            ],
        )?;
        Ok(response
            .body_text()
            .and_then(|body| self.scraper.list_query_metadata(body)))
    }

    /// Current source of a page as shown in its edit box.
    pub fn get_source(&self, site: &str, page: &PageRef, session: Option<&str>) -> Result<String> {
        let page_id = self.resolve_id(site, page, session)?;
        let response = self.transport.send_module(
            site,
            session,
            TEMPLATE_SOURCE_MODULE,
            &[("page_id", page_id.to_string())],
        )?;
        let body = response.body_text().ok_or_else(|| {
            WikidotError::Document(format!("{TEMPLATE_SOURCE_MODULE} returned no body"))
        })?;
        Ok(self
            .scraper
            .page_source(body)
            .unwrap_or_else(|| body.to_string()))
    }

    /// Revision rows, newest first.
    pub fn get_history(
        &self,
        site: &str,
        page: &PageRef,
        session: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RevisionEntry>> {
        let page_id = self.resolve_id(site, page, session)?;
        let response = self.transport.send_module(
            site,
            session,
            REVISION_LIST_MODULE,
            &[
                ("page_id", page_id.to_string()),
                ("page", "1".to_string()),
                ("perpage", limit.max(1).to_string()),
                ("options", "{\"all\":true}".to_string()),
            ],
        )?;
        let rows = response
            .body_text()
            .map(|body| self.scraper.revision_list(body))
            .unwrap_or_default();
        debug!(site, page = %page.label(), rows = rows.len(), "revision list");
        Ok(rows)
    }

    pub fn latest_revision_number(
        &self,
        site: &str,
        page: &PageRef,
        session: Option<&str>,
    ) -> Result<Option<u64>> {
        Ok(self
            .get_history(site, page, session, 1)?
            .first()
            .map(|row| row.number))
    }

    /// Source text of a specific historical revision.
    pub fn get_revision_source(
        &self,
        site: &str,
        revision_id: u64,
        session: Option<&str>,
    ) -> Result<String> {
        let response = self.transport.send_module(
            site,
            session,
            PAGE_SOURCE_MODULE,
            &[("revision_id", revision_id.to_string())],
        )?;
        response
            .body_text()
            .and_then(|body| self.scraper.page_source(body))
            .ok_or_else(|| WikidotError::NotFound {
                site: site.to_string(),
                page: format!("revision {revision_id}"),
            })
    }

    pub fn revision_id_for_number(
        &self,
        site: &str,
        page: &PageRef,
        number: u64,
        session: Option<&str>,
    ) -> Result<u64> {
        let rows = self.get_history(site, page, session, FULL_HISTORY)?;
        rows.iter()
            .find(|row| row.number == number)
            .map(|row| row.revision_id)
            .ok_or_else(|| WikidotError::NotFound {
                site: site.to_string(),
                page: format!("{} revision {number}", page.label()),
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{MockConnector, html_reply, json_reply};

    const SITE: &str = "sandbox";
    const PAGE_URL: &str = "http://sandbox.wikidot.com/scp-173/norender/true";

    const PAGE_HTML: &str = r#"<html><head><script>WIKIREQUEST.info.pageId = 777;</script></head><body>
<div id="page-title">SCP-173</div>
<div id="page-info">page revision: 5, last edited: <span class="odate">x</span></div>
</body></html>"#;

    #[test]
    fn page_url_normalizes_name() {
        assert_eq!(page_url(SITE, "SCP 173"), "http://sandbox.wikidot.com/scp-173/norender/true");
    }

    #[test]
    fn existence_follows_requested_interpretation() {
        let connector = MockConnector::default();
        connector.set_get(PAGE_URL, html_reply(404, "<html></html>"));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        let not_found = resolver
            .fetch_html(SITE, "scp-173", None, ExistenceCheck::NotFoundStatus)
            .expect("fetch");
        assert_eq!(not_found.exists, Some(false));

        transport
            .connector()
            .set_get(PAGE_URL, html_reply(302, "<html></html>"));
        let redirect_default = resolver
            .fetch_html(SITE, "scp-173", None, ExistenceCheck::NotFoundStatus)
            .expect("fetch");
        assert_eq!(redirect_default.exists, Some(true));
        let redirect_ok_range = resolver
            .fetch_html(SITE, "scp-173", None, ExistenceCheck::OkRange)
            .expect("fetch");
        assert_eq!(redirect_ok_range.exists, Some(false));
        let skipped = resolver
            .fetch_html(SITE, "scp-173", None, ExistenceCheck::Skip)
            .expect("fetch");
        assert_eq!(skipped.exists, None);
    }

    #[test]
    fn resolve_id_scrapes_or_reports_not_found() {
        let connector = MockConnector::default();
        connector.set_get(PAGE_URL, html_reply(200, PAGE_HTML));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        assert_eq!(
            resolver
                .resolve_id(SITE, &PageRef::from("SCP-173"), None)
                .expect("id"),
            777
        );
        assert_eq!(
            resolver.resolve_id(SITE, &PageRef::Id(5), None).expect("id"),
            5
        );

        let missing = resolver
            .resolve_id(SITE, &PageRef::from("nope"), None)
            .expect_err("must fail");
        assert!(matches!(missing, WikidotError::NotFound { ref page, .. } if page == "nope"));
    }

    #[test]
    fn metadata_from_toolbar_does_not_query_list() {
        let connector = MockConnector::default();
        connector.set_get(PAGE_URL, html_reply(200, PAGE_HTML));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        let meta = resolver
            .get_metadata(&PageQuery {
                site: SITE,
                page: "SCP-173",
                session: None,
                existence: ExistenceCheck::NotFoundStatus,
            })
            .expect("metadata");
        assert_eq!(meta.page, "scp-173");
        assert_eq!(meta.title.as_deref(), Some("SCP-173"));
        assert_eq!(meta.revision, Some(5));
        assert_eq!(meta.exists, Some(true));
        assert!(transport.connector().posts().is_empty());
    }

    #[test]
    fn metadata_falls_back_to_list_query_for_private_pages() {
        let connector = MockConnector::default();
        connector.set_get(
            PAGE_URL,
            html_reply(200, "<html><body><p>private</p></body></html>"),
        );
        connector.push_post(json_reply(json!({
            "status": "ok",
            "body": "<div class=\"wdsync-meta\"><span class=\"wdsync-title\">Secret</span>\
<span class=\"wdsync-parent\">hub</span><span class=\"wdsync-tags\">a b</span>\
<span class=\"wdsync-revision\">9</span></div>"
        })));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        let meta = resolver
            .get_metadata(&PageQuery {
                site: SITE,
                page: "scp-173",
                session: Some("WIKIDOT_SESSION_ID=s"),
                existence: ExistenceCheck::NotFoundStatus,
            })
            .expect("metadata");
        assert_eq!(meta.title.as_deref(), Some("Secret"));
        assert_eq!(meta.parent.as_deref(), Some("hub"));
        assert_eq!(meta.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(meta.revision, Some(9));

        let posts = transport.connector().posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].field("moduleName"), Some(LIST_PAGES_MODULE));
        assert_eq!(posts[0].field("fullname"), Some("scp-173"));
        assert!(posts[0].cookie.contains("WIKIDOT_SESSION_ID=s"));
        let gets = transport.connector().gets();
        assert_eq!(gets[0].1.as_deref(), Some("WIKIDOT_SESSION_ID=s"));
    }

    #[test]
    fn missing_page_skips_fallback() {
        let connector = MockConnector::default();
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);
        let meta = resolver
            .get_metadata(&PageQuery {
                site: SITE,
                page: "scp-173",
                session: None,
                existence: ExistenceCheck::NotFoundStatus,
            })
            .expect("metadata");
        assert_eq!(meta.exists, Some(false));
        assert_eq!(meta.revision, None);
        assert!(transport.connector().posts().is_empty());
    }

    #[test]
    fn source_and_history_use_resolved_id() {
        let connector = MockConnector::default();
        connector.set_get(PAGE_URL, html_reply(200, PAGE_HTML));
        connector.push_post(json_reply(json!({"status": "ok", "body": "raw **source**"})));
        connector.push_post(json_reply(json!({
            "status": "ok",
            "body": "<table><tr id=\"revision-row-55\"><td>5.</td><td>x</td></tr>\
<tr id=\"revision-row-44\"><td>4.</td><td>y</td></tr></table>"
        })));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        let source = resolver
            .get_source(SITE, &PageRef::from("scp-173"), None)
            .expect("source");
        assert_eq!(source, "raw **source**");
        let latest = resolver
            .latest_revision_number(SITE, &PageRef::from("scp-173"), None)
            .expect("latest");
        assert_eq!(latest, Some(5));

        let posts = transport.connector().posts();
        assert_eq!(posts[0].field("moduleName"), Some(TEMPLATE_SOURCE_MODULE));
        assert_eq!(posts[0].field("page_id"), Some("777"));
        assert_eq!(posts[1].field("moduleName"), Some(REVISION_LIST_MODULE));
        assert_eq!(posts[1].field("page_id"), Some("777"));
    }

    #[test]
    fn source_of_unknown_page_is_not_found() {
        let transport = Transport::new(MockConnector::default());
        let resolver = PageResolver::new(&transport);
        let error = resolver
            .get_source(SITE, &PageRef::from("ghost"), None)
            .expect_err("must fail");
        assert!(matches!(error, WikidotError::NotFound { .. }));
        assert!(transport.connector().posts().is_empty());
    }

    #[test]
    fn tags_accept_string_or_list() {
        let from_text: PageMetadata =
            serde_yaml::from_str("site: s\npage: p\ntags: a b  c\n").expect("yaml");
        assert_eq!(from_text.tags, vec!["a", "b", "c"]);
        let from_list: PageMetadata =
            serde_yaml::from_str("site: s\npage: p\ntags: [x, y]\n").expect("yaml");
        assert_eq!(from_list.tags, vec!["x", "y"]);
    }

    /// Answers from fixed values regardless of the markup it is given.
    struct FixedScraper;

    impl MarkupScraper for FixedScraper {
        fn page_id(&self, _html: &str) -> Option<u64> {
            Some(4242)
        }

        fn toolbar_metadata(&self, _html: &str) -> crate::scrape::ScrapedMetadata {
            crate::scrape::ScrapedMetadata {
                title: Some("Fixed".to_string()),
                parent: None,
                tags: vec!["stub".to_string()],
                revision: Some(12),
            }
        }

        fn list_query_metadata(&self, _html: &str) -> Option<crate::scrape::ScrapedMetadata> {
            None
        }

        fn revision_list(&self, _html: &str) -> Vec<RevisionEntry> {
            Vec::new()
        }

        fn page_source(&self, _html: &str) -> Option<String> {
            None
        }

        fn user_profile(&self, _html: &str) -> crate::scrape::UserProfile {
            crate::scrape::UserProfile::default()
        }
    }

    #[test]
    fn injected_scraper_replaces_html_parsing() {
        let connector = MockConnector::default();
        connector.set_get(PAGE_URL, html_reply(200, "plain text, no markup"));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport).with_scraper(FixedScraper);

        assert_eq!(
            resolver
                .resolve_id(SITE, &PageRef::from("scp-173"), None)
                .expect("id"),
            4242
        );
        let meta = resolver
            .get_metadata(&PageQuery {
                site: SITE,
                page: "scp-173",
                session: None,
                existence: ExistenceCheck::NotFoundStatus,
            })
            .expect("metadata");
        assert_eq!(meta.title.as_deref(), Some("Fixed"));
        assert_eq!(meta.tags, vec!["stub".to_string()]);
        assert_eq!(meta.revision, Some(12));
        assert!(transport.connector().posts().is_empty());
    }
}
