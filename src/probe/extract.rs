//! Tolerant response-text extraction.
//!
//! Providers place the answer in one of several containers: a top-level
//! text field, a list of output blocks (possibly with nested content
//! blocks), or a list of chat choices whose message content is a string
//! or a list of parts. Matchers run in a fixed priority order and the
//! first non-empty fragment wins; finding none is inconclusive, not a
//! failure.

use serde::Deserialize;

/// Typed, loss-tolerant view of a probe response body. Every container
/// is optional; unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ProbeReply {
    pub text: Option<String>,
    pub output: Option<Vec<OutputBlock>>,
    pub choices: Option<Vec<Choice>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputBlock {
    pub text: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentBlock {
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Choice {
    pub message: Option<ChoiceMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChoiceMessage {
    pub content: Option<ChoiceContent>,
}

/// Chat message content: a bare string or a list of parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChoiceContent {
    Text(String),
    Parts(Vec<ContentBlock>),
}

type Matcher = fn(&ProbeReply) -> Option<String>;

/// Priority order: top-level text, output blocks, chat choices.
const MATCHERS: &[Matcher] = &[top_level_text, output_blocks, chat_choices];

/// First non-empty text fragment from any recognized container.
pub fn extract_text(reply: &ProbeReply) -> Option<String> {
    MATCHERS.iter().find_map(|matcher| matcher(reply))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn top_level_text(reply: &ProbeReply) -> Option<String> {
    reply.text.as_deref().and_then(non_empty)
}

fn output_blocks(reply: &ProbeReply) -> Option<String> {
    reply.output.as_ref()?.iter().find_map(|block| {
        block
            .text
            .as_deref()
            .and_then(non_empty)
            .or_else(|| nested_content(block.content.as_deref()))
    })
}

fn nested_content(blocks: Option<&[ContentBlock]>) -> Option<String> {
    blocks?
        .iter()
        .find_map(|b| b.text.as_deref().and_then(non_empty))
}

fn chat_choices(reply: &ProbeReply) -> Option<String> {
    reply.choices.as_ref()?.iter().find_map(|choice| {
        match choice.message.as_ref()?.content.as_ref()? {
            ChoiceContent::Text(s) => non_empty(s),
            ChoiceContent::Parts(parts) => nested_content(Some(parts)),
        }
    })
}
