//! `---` delimited YAML front matter carrying page metadata.

use serde_yaml::{Mapping, Value};

use crate::edit::EditPayload;
use crate::error::{Result, WikidotError};
use crate::page::PageMetadata;

const DELIMITER: &str = "---";
const KNOWN_KEYS: &[&str] = &["site", "page", "title", "parent", "tags", "revision", "comments"];

/// A page as held in a local buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageData {
    pub meta: PageMetadata,
    pub comments: Option<String>,
    /// Front-matter keys this tool does not interpret, kept verbatim.
    pub extra: Mapping,
    pub source: String,
}

impl PageData {
    pub fn edit_payload(&self) -> EditPayload {
        EditPayload {
            title: self.meta.title.clone(),
            parent: self.meta.parent.clone(),
            tags: self.meta.tags.clone(),
            source: self.source.clone(),
            comments: self.comments.clone(),
        }
    }

    /// Replace the metadata with a fresh remote view, keeping local-only keys.
    pub fn refresh_meta(&mut self, remote: PageMetadata) {
        self.meta = remote;
    }

    pub fn has_front_matter(&self) -> bool {
        !self.meta.site.is_empty() || !self.meta.page.is_empty() || !self.extra.is_empty()
    }
}

/// Split `text` into front matter and body. Text without an opening
/// delimiter line is all body.
pub fn parse(text: &str) -> Result<PageData> {
    let text = text.replace("\r\n", "\n");
    let Some(rest) = text.strip_prefix("---\n") else {
        return Ok(PageData {
            source: text,
            ..PageData::default()
        });
    };

    let (yaml, source) = if let Some(body) = rest.strip_prefix("---\n") {
        ("", body)
    } else if let Some(index) = rest.find("\n---\n") {
        (&rest[..index + 1], &rest[index + 5..])
    } else if let Some(yaml) = rest.strip_suffix("\n---") {
        (yaml, "")
    } else {
        return Err(WikidotError::Document(
            "front matter has no closing `---` line".to_string(),
        ));
    };

    let mapping = match serde_yaml::from_str::<Value>(yaml) {
        Ok(Value::Mapping(mapping)) => mapping,
        Ok(Value::Null) => Mapping::new(),
        Ok(_) => {
            return Err(WikidotError::Document(
                "front matter must be a mapping".to_string(),
            ));
        }
        Err(error) => {
            return Err(WikidotError::Document(format!(
                "front matter is not valid YAML: {error}"
            )));
        }
    };

    let meta: PageMetadata = serde_yaml::from_value(Value::Mapping(mapping.clone()))
        .map_err(|error| WikidotError::Document(format!("invalid page metadata: {error}")))?;
    let comments = mapping
        .get("comments")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let mut extra = mapping;
    for key in KNOWN_KEYS {
        extra.remove(*key);
    }

    Ok(PageData {
        meta,
        comments,
        extra,
        source: source.to_string(),
    })
}

pub fn render(data: &PageData) -> Result<String> {
    let encode_error =
        |error: serde_yaml::Error| WikidotError::Document(format!("failed to encode front matter: {error}"));
    let mut mapping = match serde_yaml::to_value(&data.meta).map_err(encode_error)? {
        Value::Mapping(mapping) => mapping,
        _ => Mapping::new(),
    };
    if let Some(comments) = &data.comments {
        mapping.insert(Value::from("comments"), Value::from(comments.as_str()));
    }
    for (key, value) in &data.extra {
        if !mapping.contains_key(key) {
            mapping.insert(key.clone(), value.clone());
        }
    }
    let yaml = serde_yaml::to_string(&Value::Mapping(mapping)).map_err(encode_error)?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{}", data.source))
}
