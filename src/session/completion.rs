use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{GenerationError, ToolError, TransportError};
use crate::llm::{
    GenerationOptions, Message, ProviderMessage, ProviderRequest, ResponseFormat, ToolCall,
    Transport,
};
use crate::schema::Schema;
use crate::tools::{
    Invocation, TOOL_USAGE_CLOSE, TOOL_USAGE_OPEN, ToolRegistry, failure_output, skipped_output,
};
use crate::transcript::{Entry, Transcript};

pub const MAX_ITERATIONS: u32 = 10;

static TOOL_USAGE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?s)\s*{}.*?{}",
        regex::escape(TOOL_USAGE_OPEN),
        regex::escape(TOOL_USAGE_CLOSE)
    ))
    .expect("tool usage pattern is valid")
});

/// Capability flags for one `run`. Each transition returns a new value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: u32,
    pub tools_completed: bool,
    pub tools_disabled: bool,
    pub response_format_disabled: bool,
}

impl LoopState {
    pub fn next_iteration(self) -> Self {
        Self {
            iteration: self.iteration + 1,
            ..self
        }
    }

    pub fn offers_tools(self, tools: &ToolRegistry) -> bool {
        !(self.tools_completed || self.tools_disabled || tools.is_empty())
    }

    /// Providers reject forced JSON mode combined with tool calling.
    pub fn response_format(
        self,
        requested: Option<ResponseFormat>,
        tools_offered: bool,
    ) -> Option<ResponseFormat> {
        if tools_offered || self.response_format_disabled {
            None
        } else {
            requested
        }
    }

    pub fn complete_tools(self) -> Self {
        Self {
            tools_completed: true,
            ..self
        }
    }

    pub fn disable_tools(self) -> Self {
        Self {
            tools_disabled: true,
            ..self
        }
    }

    pub fn disable_response_format(self) -> Self {
        Self {
            response_format_disabled: true,
            ..self
        }
    }

    /// Decides how to react to a rejected request. Each feature is dropped at
    /// most once; `None` means the rejection is fatal.
    pub fn degrade(self, format_sent: bool, tools_sent: bool) -> Option<Self> {
        if format_sent && !self.response_format_disabled {
            Some(self.disable_response_format())
        } else if tools_sent && !self.tools_disabled {
            Some(self.disable_tools())
        } else {
            None
        }
    }
}

/// One adaptive completion over a transcript.
pub(crate) struct CompletionLoop<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) tools: &'a ToolRegistry,
    pub(crate) options: &'a GenerationOptions,
    pub(crate) schema: Option<&'a Schema>,
    pub(crate) max_iterations: u32,
}

impl CompletionLoop<'_> {
    /// Fatal errors are recorded in the transcript before being returned.
    pub(crate) async fn run(&self, transcript: &mut Transcript) -> Result<Message, GenerationError> {
        match self.drive(transcript).await {
            Ok(message) => Ok(message),
            Err(err) => {
                warn!(error = %err, "completion failed");
                transcript.append(Entry::Error(err.clone()));
                Err(err)
            }
        }
    }

    async fn drive(&self, transcript: &mut Transcript) -> Result<Message, GenerationError> {
        let requested_format = self.schema.map(|_| ResponseFormat::JsonObject);
        let mut state = LoopState::default();

        while state.iteration < self.max_iterations {
            state = state.next_iteration();

            let tools_offered = state.offers_tools(self.tools);
            let response_format = state.response_format(requested_format, tools_offered);
            let request = self.build_request(transcript, tools_offered, response_format);

            debug!(
                iteration = state.iteration,
                tools_offered,
                json_mode = response_format.is_some(),
                messages = request.messages.len(),
                "dispatching completion request"
            );

            let response = match self.transport.send(&request).await {
                Ok(response) => response,
                Err(err @ TransportError::RejectedRequest(_)) => {
                    let Some(degraded) = state.degrade(response_format.is_some(), tools_offered)
                    else {
                        return Err(err.into());
                    };
                    warn!(
                        iteration = state.iteration,
                        error = %err,
                        response_format_disabled = degraded.response_format_disabled,
                        tools_disabled = degraded.tools_disabled,
                        "provider rejected request, retrying without feature"
                    );
                    state = degraded;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let choice = response.choices.into_iter().next().ok_or_else(|| {
                GenerationError::UnexpectedResponse(format!(
                    "provider returned no choices at iteration {}",
                    state.iteration
                ))
            })?;
            let finish_reason = choice.finish_reason.unwrap_or_else(|| "unknown".to_string());
            let message = choice.message.map(Message::from).unwrap_or_default();

            if !message.tool_calls.is_empty() {
                transcript.append(Entry::Response(message.clone()));
                for (index, call) in message.tool_calls.iter().enumerate() {
                    if let Err(err) = self.resolve_tool_call(transcript, call).await {
                        close_unresolved(transcript, &message.tool_calls[index..], &err);
                        return Err(err.into());
                    }
                }
                state = state.complete_tools();
                continue;
            }

            if message.usable_content().is_some() {
                transcript.append(Entry::Response(message.clone()));
                return Ok(message);
            }

            if tools_offered {
                return Err(GenerationError::UnexpectedResponse(format!(
                    "provider returned neither content nor a tool call while tools were offered \
                     (finish_reason: {finish_reason}); the selected model likely does not support tool calling"
                )));
            }

            return Err(GenerationError::UnexpectedResponse(format!(
                "provider returned an empty message at iteration {} \
                 (tools_completed: {}, tools_disabled: {}, response_format_disabled: {}, finish_reason: {finish_reason})",
                state.iteration,
                state.tools_completed,
                state.tools_disabled,
                state.response_format_disabled,
            )));
        }

        Err(GenerationError::MaxIterationsExceeded {
            max_iterations: self.max_iterations,
        })
    }

    async fn resolve_tool_call(
        &self,
        transcript: &mut Transcript,
        call: &ToolCall,
    ) -> Result<(), ToolError> {
        let output = match self.tools.invoke(call).await? {
            Invocation::Completed { output } => output,
            Invocation::Recovered { output, error } => {
                transcript.append(Entry::Error(error.into()));
                output
            }
        };

        transcript.append(Entry::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output,
        });
        Ok(())
    }

    fn build_request(
        &self,
        transcript: &Transcript,
        tools_offered: bool,
        response_format: Option<ResponseFormat>,
    ) -> ProviderRequest {
        ProviderRequest {
            model: self.options.model_override.clone(),
            messages: self.render_messages(transcript, tools_offered),
            tools: tools_offered.then(|| self.tools.definitions()),
            tool_choice: tools_offered.then(|| "auto".to_string()),
            response_format,
            temperature: self.options.temperature,
            max_tokens: self.options.max_output_tokens,
        }
    }

    fn render_messages(&self, transcript: &Transcript, tools_offered: bool) -> Vec<ProviderMessage> {
        let mut messages = transcript.render();
        let Some(schema) = self.schema else {
            return messages;
        };

        let directive = schema_directive(schema);
        let system = messages
            .iter()
            .position(|message| matches!(message, ProviderMessage::System { .. }));

        match system.map(|index| &mut messages[index]) {
            Some(ProviderMessage::System { content }) => {
                let mut merged = if tools_offered {
                    content.clone()
                } else {
                    strip_tool_usage(content)
                };
                if !merged.is_empty() {
                    merged.push_str("\n\n");
                }
                merged.push_str(&directive);
                *content = merged;
            }
            _ => messages.insert(0, ProviderMessage::System { content: directive }),
        }

        messages
    }
}

/// Answers the failed call and every call after it so the transcript never
/// holds an assistant tool call without a matching tool result.
fn close_unresolved(transcript: &mut Transcript, calls: &[ToolCall], cause: &ToolError) {
    for (position, call) in calls.iter().enumerate() {
        let output = if position == 0 {
            failure_output(&call.name, cause)
        } else {
            skipped_output(&call.name)
        };
        transcript.append(Entry::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output,
        });
    }
}

fn schema_directive(schema: &Schema) -> String {
    format!(
        "Respond only with a JSON value that conforms to this JSON Schema:\n{:#}\nDo not add prose or code fences around the JSON.",
        schema.to_json()
    )
}

fn strip_tool_usage(content: &str) -> String {
    TOOL_USAGE_BLOCK.replace_all(content, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;

    #[test]
    fn response_format_is_suppressed_while_tools_are_offered() {
        let state = LoopState::default();
        let format = Some(ResponseFormat::JsonObject);

        assert_eq!(state.response_format(format, true), None);
        assert_eq!(state.response_format(format, false), format);
        assert_eq!(
            state.disable_response_format().response_format(format, false),
            None
        );
        assert_eq!(state.response_format(None, false), None);
    }

    #[test]
    fn tools_are_offered_until_completed_or_disabled() {
        let tools = ToolRegistry::new(vec![ToolSpec::new("noop", "does nothing")])
            .expect("registry builds");
        let state = LoopState::default();

        assert!(state.offers_tools(&tools));
        assert!(!state.complete_tools().offers_tools(&tools));
        assert!(!state.disable_tools().offers_tools(&tools));
        assert!(!state.offers_tools(&ToolRegistry::default()));
    }

    #[test]
    fn each_feature_degrades_once() {
        let state = LoopState::default();

        let without_format = state.degrade(true, false).expect("format can be dropped");
        assert!(without_format.response_format_disabled);
        assert_eq!(without_format.degrade(true, false), None);

        let without_tools = state.degrade(false, true).expect("tools can be dropped");
        assert!(without_tools.tools_disabled);
        assert_eq!(without_tools.degrade(false, true), None);

        assert_eq!(state.degrade(false, false), None);
    }

    #[test]
    fn transitions_keep_other_flags() {
        let state = LoopState::default()
            .next_iteration()
            .disable_response_format()
            .next_iteration()
            .complete_tools();

        assert_eq!(
            state,
            LoopState {
                iteration: 2,
                tools_completed: true,
                tools_disabled: false,
                response_format_disabled: true,
            }
        );
    }

    #[test]
    fn tool_usage_block_is_stripped() {
        let content = format!(
            "Be precise.\n\n{TOOL_USAGE_OPEN}\n- add: add numbers\n{TOOL_USAGE_CLOSE}"
        );
        assert_eq!(strip_tool_usage(&content), "Be precise.");
        assert_eq!(strip_tool_usage("no tools here"), "no tools here");
    }
}
