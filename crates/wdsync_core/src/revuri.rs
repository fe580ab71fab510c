//! `wikidot-rev://` addresses of read-only revision documents.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WikidotError};
use crate::frontmatter::{PageData, render};
use crate::names::{site_authority, site_from_authority, unix_name};
use crate::page::{ExistenceCheck, FULL_HISTORY, PageQuery, PageRef, PageResolver};
use crate::transport::Connector;

pub const REV_SCHEME: &str = "wikidot-rev";
const DOCUMENT_EXTENSION: &str = ".wd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevisionSelector {
    #[default]
    Current,
    /// Revision counter as shown in the page history.
    Number(u64),
    /// Internal revision id.
    Id(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevUri {
    pub authority: String,
    pub page: String,
    pub selector: RevisionSelector,
}

impl RevUri {
    pub fn new(site: &str, page: &str, selector: RevisionSelector) -> Self {
        Self {
            authority: site_authority(site),
            page: unix_name(page),
            selector,
        }
    }

    pub fn site(&self) -> String {
        site_from_authority(&self.authority)
    }
}

impl fmt::Display for RevUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{REV_SCHEME}://{}/{}{DOCUMENT_EXTENSION}",
            self.authority, self.page
        )?;
        match self.selector {
            RevisionSelector::Current => Ok(()),
            RevisionSelector::Number(number) => write!(f, "?revision={number}"),
            RevisionSelector::Id(id) => write!(f, "?revisionId={id}"),
        }
    }
}

impl FromStr for RevUri {
    type Err = WikidotError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = |reason: &str| WikidotError::Document(format!("invalid revision URI `{value}`: {reason}"));
        let rest = value
            .strip_prefix(REV_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| invalid("wrong scheme"))?;
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = location
            .split_once('/')
            .ok_or_else(|| invalid("missing page"))?;
        let page = path.strip_suffix(DOCUMENT_EXTENSION).unwrap_or(path);
        if authority.is_empty() || page.is_empty() {
            return Err(invalid("missing site or page"));
        }

        let mut selector = RevisionSelector::Current;
        for pair in query.unwrap_or_default().split('&').filter(|pair| !pair.is_empty()) {
            let (key, raw) = pair.split_once('=').ok_or_else(|| invalid("malformed query"))?;
            let number = raw
                .parse::<u64>()
                .map_err(|_| invalid("revision is not a number"))?;
            selector = match key {
                "revision" => RevisionSelector::Number(number),
                "revisionId" => RevisionSelector::Id(number),
                _ => continue,
            };
        }

        Ok(Self {
            authority: authority.to_ascii_lowercase(),
            page: unix_name(page),
            selector,
        })
    }
}

/// Front-matter text of the page revision `uri` points at.
pub fn provide_rev_document<C: Connector>(
    resolver: &PageResolver<'_, C>,
    uri: &RevUri,
    session: Option<&str>,
) -> Result<String> {
    let site = uri.site();
    let page_ref = PageRef::Name(uri.page.clone());
    let mut meta = resolver.get_metadata(&PageQuery {
        site: &site,
        page: &uri.page,
        session,
        existence: ExistenceCheck::NotFoundStatus,
    })?;
    if meta.exists == Some(false) {
        return Err(WikidotError::NotFound {
            site,
            page: uri.page.clone(),
        });
    }

    let source = match uri.selector {
        RevisionSelector::Current => resolver.get_source(&site, &page_ref, session)?,
        RevisionSelector::Number(number) => {
            let revision_id = resolver.revision_id_for_number(&site, &page_ref, number, session)?;
            meta.revision = Some(number);
            resolver.get_revision_source(&site, revision_id, session)?
        }
        RevisionSelector::Id(revision_id) => {
            meta.revision = resolver
                .get_history(&site, &page_ref, session, FULL_HISTORY)?
                .iter()
                .find(|row| row.revision_id == revision_id)
                .map(|row| row.number);
            resolver.get_revision_source(&site, revision_id, session)?
        }
    };

    render(&PageData {
        meta,
        source,
        ..PageData::default()
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::frontmatter::parse;
    use crate::testing::{MockConnector, html_reply, json_reply};
    use crate::transport::Transport;

    #[test]
    fn formats_and_parses_each_selector() {
        let current = RevUri::new("scp-wiki", "SCP 173", RevisionSelector::Current);
        assert_eq!(current.to_string(), "wikidot-rev://scp-wiki.wikidot.com/scp-173.wd");
        let numbered = RevUri::new("scp-wiki", "scp-173", RevisionSelector::Number(4));
        assert_eq!(
            numbered.to_string(),
            "wikidot-rev://scp-wiki.wikidot.com/scp-173.wd?revision=4"
        );

        let parsed: RevUri = "wikidot-rev://scp-wiki.wikidot.com/scp-173.wd?revisionId=991"
            .parse()
            .expect("parse");
        assert_eq!(parsed.selector, RevisionSelector::Id(991));
        assert_eq!(parsed.site(), "scp-wiki");
        assert_eq!(parsed.page, "scp-173");
        assert_eq!(parsed.to_string().parse::<RevUri>().expect("reparse"), parsed);
    }

    #[test]
    fn rejects_malformed_uris() {
        for bad in [
            "http://x/y.wd",
            "wikidot-rev://host-only",
            "wikidot-rev://h/p.wd?revision=abc",
            "wikidot-rev:///p.wd",
        ] {
            assert!(bad.parse::<RevUri>().is_err(), "{bad}");
        }
    }

    #[test]
    fn historical_document_uses_revision_source() {
        let connector = MockConnector::default();
        connector.set_get(
            "http://sandbox.wikidot.com/scp-173/norender/true",
            html_reply(
                200,
                r#"<html><head><script>WIKIREQUEST.info.pageId = 5;</script></head><body>
<div id="page-title">SCP-173</div><div id="page-info">page revision: 3</div></body></html>"#,
            ),
        );
        connector.push_post(json_reply(json!({
            "status": "ok",
            "body": "<table><tr id=\"revision-row-300\"><td>3.</td></tr>\
<tr id=\"revision-row-200\"><td>2.</td></tr></table>"
        })));
        connector.push_post(json_reply(json!({
            "status": "ok",
            "body": "<div class=\"page-source\">old text</div>"
        })));
        let transport = Transport::new(connector);
        let resolver = PageResolver::new(&transport);

        let uri = RevUri::new("sandbox", "scp-173", RevisionSelector::Number(2));
        let text = provide_rev_document(&resolver, &uri, None).expect("document");
        let data = parse(&text).expect("front matter");
        assert_eq!(data.meta.revision, Some(2));
        assert_eq!(data.meta.title.as_deref(), Some("SCP-173"));
        assert_eq!(data.source, "old text");
        let posts = transport.connector().posts();
        assert_eq!(posts[1].field("revision_id"), Some("200"));
    }

    #[test]
    fn missing_page_is_not_found() {
        let transport = Transport::new(MockConnector::default());
        let resolver = PageResolver::new(&transport);
        let uri = RevUri::new("sandbox", "ghost", RevisionSelector::Current);
        assert!(matches!(
            provide_rev_document(&resolver, &uri, None),
            Err(WikidotError::NotFound { .. })
        ));
    }
}
