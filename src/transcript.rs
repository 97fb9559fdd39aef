use crate::error::GenerationError;
use crate::llm::{Message, ProviderMessage, WireToolCall};

#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Instructions(String),
    Prompt(String),
    Response(Message),
    ToolResult {
        call_id: String,
        tool_name: String,
        output: String,
    },
    /// Diagnostic only; never sent to the provider.
    Error(GenerationError),
}

/// Append-only conversation history owned by a single session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &GenerationError> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Error(err) => Some(err),
            _ => None,
        })
    }

    /// Projects the history onto provider chat messages.
    pub fn render(&self) -> Vec<ProviderMessage> {
        let mut messages = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            match entry {
                Entry::Instructions(content) => messages.push(ProviderMessage::System {
                    content: content.clone(),
                }),
                Entry::Prompt(content) => messages.push(ProviderMessage::User {
                    content: content.clone(),
                }),
                Entry::Response(message) => {
                    let content = message
                        .content
                        .as_ref()
                        .filter(|text| !text.is_empty())
                        .cloned();
                    let tool_calls = message
                        .tool_calls
                        .iter()
                        .map(WireToolCall::from)
                        .collect::<Vec<_>>();

                    // An assistant turn with neither text nor calls is rejected by providers.
                    if content.is_none() && tool_calls.is_empty() {
                        continue;
                    }

                    messages.push(ProviderMessage::Assistant {
                        content,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                    });
                }
                Entry::ToolResult {
                    call_id, output, ..
                } => messages.push(ProviderMessage::Tool {
                    tool_call_id: call_id.clone(),
                    content: output.clone(),
                }),
                Entry::Error(_) => {}
            }
        }

        messages
    }
}
