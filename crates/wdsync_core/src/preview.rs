use tracing::debug;

use crate::error::Result;
use crate::host::{RenderOutput, Renderer};
use crate::names::unix_name;
use crate::page::PREVIEW_MODULE;
use crate::transport::{Connector, Transport};

/// Renders markup with the site's own preview module.
pub struct WikidotRenderer<'t, C: Connector> {
    transport: &'t Transport<C>,
    site: String,
    page: String,
    session: Option<String>,
}

impl<'t, C: Connector> WikidotRenderer<'t, C> {
    pub fn new(transport: &'t Transport<C>, site: &str, page: &str, session: Option<String>) -> Self {
        Self {
            transport,
            site: site.to_string(),
            page: unix_name(page),
            session,
        }
    }
}

impl<C: Connector> Renderer for WikidotRenderer<'_, C> {
    fn render(&self, source: &str) -> Result<RenderOutput> {
        debug!(site = %self.site, page = %self.page, bytes = source.len(), "rendering preview");
        let response = self.transport.send_module(
            &self.site,
            self.session.as_deref(),
            PREVIEW_MODULE,
            &[
                ("mode", "page".to_string()),
                ("page_unix_name", self.page.clone()),
                ("source", source.to_string()),
            ],
        )?;
        Ok(RenderOutput {
            html: response.body_text().unwrap_or_default().to_string(),
            styles: Vec::new(),
        })
    }
}
