mod completion;

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::GenerationError;
use crate::llm::{GenerationOptions, Message, Transport};
use crate::schema::{self, Schema};
use crate::tools::{ToolRegistry, ToolSpec};
use crate::transcript::{Entry, Transcript};

use completion::CompletionLoop;
pub use completion::{LoopState, MAX_ITERATIONS};

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*(.*?)\s*```\s*$")
        .expect("fenced json pattern is valid")
});

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_iterations: u32,
    pub instructions: Option<String>,
    /// Defaults for fields a per-call [`GenerationOptions`] leaves unset.
    pub options: GenerationOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            instructions: None,
            options: GenerationOptions::default(),
        }
    }
}

#[derive(Default)]
pub struct SessionBuilder {
    transport: Option<Arc<dyn Transport>>,
    tools: Vec<ToolSpec>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn options(mut self, options: GenerationOptions) -> Self {
        self.config.options = options;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<Session, GenerationError> {
        let Some(transport) = self.transport else {
            return Err(GenerationError::Config(
                "session transport must be configured via SessionBuilder::transport(...)"
                    .to_string(),
            ));
        };

        if self.config.max_iterations == 0 {
            return Err(GenerationError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let tools = ToolRegistry::new(self.tools)?;
        let mut transcript = Transcript::new();
        if let Some(instructions) = system_instructions(self.config.instructions.as_deref(), &tools)
        {
            transcript.append(Entry::Instructions(instructions));
        }

        Ok(Session {
            transport,
            tools,
            config: self.config,
            transcript,
        })
    }
}

/// A single conversation with a provider.
///
/// `respond*` take `&mut self`: a session serves one caller at a time and
/// its transcript is never shared.
pub struct Session {
    transport: Arc<dyn Transport>,
    tools: ToolRegistry,
    config: SessionConfig,
    transcript: Transcript,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn respond(&mut self, prompt: impl Into<String>) -> Result<String, GenerationError> {
        self.respond_with(prompt, &GenerationOptions::default())
            .await
    }

    pub async fn respond_with(
        &mut self,
        prompt: impl Into<String>,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        self.transcript.append(Entry::Prompt(prompt.into()));
        let message = self.complete(options, None).await?;
        Ok(message.content.unwrap_or_default())
    }

    /// Asks for a value of `T`, inferring its schema from its serde impls.
    pub async fn respond_as<T>(&mut self, prompt: impl Into<String>) -> Result<T, GenerationError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.respond_as_with(prompt, &GenerationOptions::default())
            .await
    }

    pub async fn respond_as_with<T>(
        &mut self,
        prompt: impl Into<String>,
        options: &GenerationOptions,
    ) -> Result<T, GenerationError>
    where
        T: Serialize + DeserializeOwned,
    {
        let schema = match schema::infer::<T>() {
            Ok(schema) => schema,
            Err(err) => return Err(self.record(err.into())),
        };
        debug!(schema = %schema.to_json(), "inferred structured output schema");

        self.transcript.append(Entry::Prompt(prompt.into()));
        let message = self.complete(options, Some(&schema)).await?;
        let raw = message.content.unwrap_or_default();

        serde_json::from_str::<T>(strip_code_fence(&raw)).map_err(|err| {
            self.record(GenerationError::SchemaDecodeFailed {
                message: err.to_string(),
                raw,
            })
        })
    }

    async fn complete(
        &mut self,
        options: &GenerationOptions,
        schema: Option<&Schema>,
    ) -> Result<Message, GenerationError> {
        let options = merge_options(options, &self.config.options);
        info!(
            entries = self.transcript.len(),
            tools = self.tools.len(),
            structured = schema.is_some(),
            "starting completion"
        );

        CompletionLoop {
            transport: self.transport.as_ref(),
            tools: &self.tools,
            options: &options,
            schema,
            max_iterations: self.config.max_iterations,
        }
        .run(&mut self.transcript)
        .await
    }

    fn record(&mut self, err: GenerationError) -> GenerationError {
        self.transcript.append(Entry::Error(err.clone()));
        err
    }
}

/// Session instructions followed by the tool usage block, seeded once at build.
fn system_instructions(instructions: Option<&str>, tools: &ToolRegistry) -> Option<String> {
    let parts = [instructions.map(str::to_string), tools.usage_instructions()]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn merge_options(call: &GenerationOptions, defaults: &GenerationOptions) -> GenerationOptions {
    GenerationOptions {
        temperature: call.temperature.or(defaults.temperature),
        max_output_tokens: call.max_output_tokens.or(defaults.max_output_tokens),
        model_override: call
            .model_override
            .clone()
            .or_else(|| defaults.model_override.clone()),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    match FENCED_JSON.captures(raw).and_then(|captures| captures.get(1)) {
        Some(body) => body.as_str(),
        None => raw.trim(),
    }
}

#[cfg(test)]
mod tests;
