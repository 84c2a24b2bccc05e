//! # Chat Completion Client
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint with
//! `stream: true` and assembles the server-sent deltas into one reply.
//!
//! ## Stream Format:
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```

use super::{ChatCompletion, ChatTurn, Speaker};
use crate::config::ChatConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Result of feeding one SSE line to the parser.
#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

/// Splits a byte stream into complete lines.
///
/// Network chunks can end in the middle of a UTF-8 sequence, so bytes are held
/// until a newline arrives and only whole lines are decoded.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left once the stream has ended.
    fn remainder(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .map(SseLine::Content)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable stream chunk");
            SseLine::Skip
        }
    }
}

fn role_name(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "user",
        Speaker::Assistant => "assistant",
    }
}

/// OpenAI-compatible streaming chat client.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    config: ChatConfig,
}

impl OpenAiChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build chat HTTP client")?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    fn build_messages<'a>(&'a self, history: &'a [ChatTurn], user_text: &'a str) -> Vec<RequestMessage<'a>> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(RequestMessage {
                role: "system",
                content: &self.config.system_prompt,
            });
        }
        messages.extend(history.iter().map(|turn| RequestMessage {
            role: role_name(turn.role),
            content: &turn.content,
        }));
        messages.push(RequestMessage {
            role: "user",
            content: user_text,
        });
        messages
    }
}

#[async_trait]
impl ChatCompletion for OpenAiChat {
    async fn reply(&self, history: &[ChatTurn], user_text: &str) -> Result<String> {
        let started = Instant::now();
        let request = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(history, user_text),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        };

        let mut builder = self.client.post(self.chat_url()).json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await.context("Chat request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Chat endpoint returned HTTP {}: {}", status, body));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut reply = String::new();
        let mut first_token_ms = None;
        let mut finished = false;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Chat stream interrupted")?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                match parse_sse_line(&line) {
                    SseLine::Content(text) => {
                        first_token_ms.get_or_insert_with(|| started.elapsed().as_millis() as u64);
                        reply.push_str(&text);
                    }
                    SseLine::Done => {
                        finished = true;
                        break 'read;
                    }
                    SseLine::Skip => {}
                }
            }
        }

        // A final line without a trailing newline
        if !finished {
            if let SseLine::Content(text) = parse_sse_line(&lines.remainder()) {
                reply.push_str(&text);
            }
        }

        tracing::info!(
            model = %self.config.model,
            history = history.len(),
            first_token_ms = first_token_ms.unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = reply.len(),
            "Chat completion finished"
        );
        Ok(reply.trim().to_string())
    }
}
