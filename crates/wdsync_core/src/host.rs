//! Interfaces to the program embedding the engine: prompts, storage, text
//! buffers and the markup renderer.

use crate::error::Result;
use crate::merge::{MergeSelection, TextEdit, apply_edits};

#[derive(Debug, Clone, Default)]
pub struct InputRequest<'a> {
    pub title: &'a str,
    pub prompt: &'a str,
    pub placeholder: Option<&'a str>,
    pub value: Option<&'a str>,
    pub secret: bool,
}

/// Modal interaction with the user. `None` always means dismissal.
pub trait Prompter {
    fn input(&self, request: &InputRequest<'_>) -> Option<String>;
    fn choose(&self, message: &str, options: &[&str]) -> Option<usize>;
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
}

/// Persistent secret storage holding one opaque blob per key.
pub trait SecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>>;
    fn set_secret(&self, key: &str, value: &str) -> Result<()>;
}

pub trait KeyValueStore {
    fn get_value(&self, key: &str) -> Result<Option<String>>;
    /// `None` deletes the key.
    fn set_value(&self, key: &str, value: Option<&str>) -> Result<()>;
}

pub trait TextBuffer {
    /// Identifier shown in messages, usually a path.
    fn name(&self) -> String;
    fn text(&self) -> Result<String>;
    fn replace_all(&mut self, text: &str) -> Result<()>;
    /// Line ranges the user selected, when the buffer shows a revision.
    fn selections(&self) -> Vec<MergeSelection>;

    /// Apply line edits computed against the current text in one step.
    fn apply_edits(&mut self, edits: &[TextEdit]) -> Result<()> {
        let edited = apply_edits(&self.text()?, edits)?;
        self.replace_all(&edited)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOutput {
    pub html: String,
    pub styles: Vec<String>,
}

pub trait Renderer {
    fn render(&self, source: &str) -> Result<RenderOutput>;
}
