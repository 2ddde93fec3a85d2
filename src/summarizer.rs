use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DaybriefError, Result};

/// Closed set of knobs for the external generation call.
#[derive(Debug, Clone)]
pub struct SummaryOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_input_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutput {
    pub text: String,
    pub key_topics: Vec<String>,
}

/// Boundary to the external text-generation service. One call, no retries;
/// retry policy belongs to the caller.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, payload: &str, day_key: &str) -> Result<SummaryOutput>;
}

pub struct OpenAiSummarizer {
    client: Client<OpenAIConfig>,
    opts: SummaryOptions,
}

impl OpenAiSummarizer {
    pub fn new(config: &Config) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(&config.openai_api_key);
        if let Some(base) = &config.openai_api_base {
            openai_config = openai_config.with_api_base(base);
        }
        Self {
            client: Client::with_config(openai_config),
            opts: config.summary_options(),
        }
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, payload: &str, day_key: &str) -> Result<SummaryOutput> {
        let payload = truncate_chars(payload, self.opts.max_input_chars);
        let prompt = build_prompt(&payload, day_key);

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.opts.model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content("You are a professional financial news analyst.")
                    .build()
                    .map_err(|e| DaybriefError::Generation(e.to_string()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()
                    .map_err(|e| DaybriefError::Generation(e.to_string()))?
                    .into(),
            ])
            .max_tokens(self.opts.max_tokens)
            .temperature(self.opts.temperature)
            .build()
            .map_err(|e| DaybriefError::Generation(e.to_string()))?;

        info!("Calling summarizer for {} ({} chars)", day_key, payload.len());
        let chat = self.client.chat();
        let call = chat.create(request);
        let response = tokio::time::timeout(self.opts.timeout, call)
            .await
            .map_err(|_| {
                DaybriefError::Generation(format!(
                    "summarizer call timed out after {}s",
                    self.opts.timeout.as_secs()
                ))
            })?
            .map_err(|e| DaybriefError::Generation(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DaybriefError::Generation("empty response from model".into()))?;

        Ok(parse_model_output(&content))
    }
}

fn build_prompt(payload: &str, day_key: &str) -> String {
    format!(
        "Today is {day_key}.\n\n\
         Give me a brief digest of the following messages from a financial \
         markets news channel. Cover only the major market and policy news: \
         global market moves, central bank decisions, economic indicators, \
         corporate earnings, and geopolitical events with market impact. \
         Skip memes, minor local news, and content-free speculation.\n\n\
         Here are all the messages:\n\"\n{payload}\n\"\n\n\
         Answer in JSON:\n\
         {{\"summary\": \"one-paragraph overview of the most important events\", \
         \"key_topics\": [\"numbered list of headlines, most important first\"]}}"
    )
}

/// Model answers are requested as `{summary, key_topics}` JSON, but the
/// model does not always comply; a non-JSON answer is used verbatim.
fn parse_model_output(content: &str) -> SummaryOutput {
    match serde_json::from_str::<serde_json::Value>(content.trim()) {
        Ok(value) => {
            let text = value
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or(content)
                .to_string();
            let key_topics = value
                .get("key_topics")
                .and_then(|t| t.as_array())
                .map(|arr| {
                    arr.iter()
                        .map(|v| match v.as_str() {
                            Some(s) => s.to_string(),
                            None => v.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            SummaryOutput { text, key_topics }
        }
        Err(_) => {
            warn!("Model answer was not JSON, using raw text");
            SummaryOutput {
                text: content.trim().to_string(),
                key_topics: vec![],
            }
        }
    }
}

/// Byte-slice truncation would panic inside multi-byte characters, so cut on
/// a char boundary and mark the cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
