//! Scripted collaborators shared by unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::error::{Result, WikidotError};
use crate::host::{InputRequest, KeyValueStore, Prompter, SecretStore, TextBuffer};
use crate::merge::MergeSelection;
use crate::transport::{Connector, FormRequest, HttpReply};

pub fn json_reply(value: Value) -> HttpReply {
    HttpReply {
        status: 200,
        body: value.to_string(),
        set_cookies: Vec::new(),
    }
}

pub fn html_reply(status: u16, body: &str) -> HttpReply {
    HttpReply {
        status,
        body: body.to_string(),
        set_cookies: Vec::new(),
    }
}

/// POST replies are consumed in order. GET replies are keyed by URL: queued
/// one-shot replies first, then the sticky reply, then an empty 404.
#[derive(Default)]
pub struct MockConnector {
    post_replies: RefCell<VecDeque<HttpReply>>,
    get_queue: RefCell<HashMap<String, VecDeque<HttpReply>>>,
    get_replies: RefCell<HashMap<String, HttpReply>>,
    sent_posts: RefCell<Vec<FormRequest>>,
    sent_gets: RefCell<Vec<(String, Option<String>)>>,
}

impl MockConnector {
    pub fn push_post(&self, reply: HttpReply) {
        self.post_replies.borrow_mut().push_back(reply);
    }

    pub fn set_get(&self, url: &str, reply: HttpReply) {
        self.get_replies.borrow_mut().insert(url.to_string(), reply);
    }

    pub fn push_get(&self, url: &str, reply: HttpReply) {
        self.get_queue
            .borrow_mut()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn posts(&self) -> Vec<FormRequest> {
        self.sent_posts.borrow().clone()
    }

    pub fn gets(&self) -> Vec<(String, Option<String>)> {
        self.sent_gets.borrow().clone()
    }

    pub fn pending_posts(&self) -> usize {
        self.post_replies.borrow().len()
    }
}

impl Connector for MockConnector {
    fn post_form(&self, request: &FormRequest) -> Result<HttpReply> {
        self.sent_posts.borrow_mut().push(request.clone());
        self.post_replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| WikidotError::Transport {
                url: request.url.clone(),
                status: None,
                message: "no scripted reply".to_string(),
            })
    }

    fn get(&self, url: &str, cookie: Option<&str>) -> Result<HttpReply> {
        self.sent_gets
            .borrow_mut()
            .push((url.to_string(), cookie.map(ToString::to_string)));
        if let Some(reply) = self
            .get_queue
            .borrow_mut()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
        {
            return Ok(reply);
        }
        Ok(self
            .get_replies
            .borrow()
            .get(url)
            .cloned()
            .unwrap_or_else(|| html_reply(404, "")))
    }
}

/// Answers prompts from queues; an exhausted queue dismisses the prompt.
#[derive(Default)]
pub struct ScriptedPrompter {
    inputs: RefCell<VecDeque<Option<String>>>,
    choices: RefCell<VecDeque<Option<usize>>>,
    input_prompts: RefCell<Vec<String>>,
    choice_prompts: RefCell<Vec<String>>,
    messages: RefCell<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn push_input(&self, value: Option<&str>) {
        self.inputs
            .borrow_mut()
            .push_back(value.map(ToString::to_string));
    }

    pub fn push_choice(&self, choice: Option<usize>) {
        self.choices.borrow_mut().push_back(choice);
    }

    pub fn input_prompts(&self) -> Vec<String> {
        self.input_prompts.borrow().clone()
    }

    pub fn choice_prompts(&self) -> Vec<String> {
        self.choice_prompts.borrow().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn input(&self, request: &InputRequest<'_>) -> Option<String> {
        self.input_prompts
            .borrow_mut()
            .push(request.prompt.to_string());
        self.inputs.borrow_mut().pop_front().flatten()
    }

    fn choose(&self, message: &str, _options: &[&str]) -> Option<usize> {
        self.choice_prompts.borrow_mut().push(message.to_string());
        self.choices.borrow_mut().pop_front().flatten()
    }

    fn info(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, String>>,
    writes: Cell<usize>,
}

impl MemoryStore {
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }
}

impl SecretStore for MemoryStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        self.writes.set(self.writes.get() + 1);
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    fn set_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBuffer {
    pub text: String,
    pub selections: Vec<MergeSelection>,
    pub replacements: usize,
}

impl MemoryBuffer {
    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }
}

impl TextBuffer for MemoryBuffer {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn text(&self) -> Result<String> {
        Ok(self.text.clone())
    }

    fn replace_all(&mut self, text: &str) -> Result<()> {
        self.replacements += 1;
        self.text = text.to_string();
        Ok(())
    }

    fn selections(&self) -> Vec<MergeSelection> {
        self.selections.clone()
    }
}
