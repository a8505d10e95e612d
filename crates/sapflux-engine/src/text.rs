use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use sapflux_contracts::decomposition::{
    read_request_prompts, render_response_block, synthesize_fallback, BatchPayload,
    FallbackPolicy,
};
use serde_json::{json, Value};

use crate::config::TextBackendConfig;

pub const DRYRUN_TEXT_BACKEND: &str = "dryrun";
pub const OPENAI_TEXT_BACKEND: &str = "openai";

/// One blocking round trip: a rendered batch in, raw model text out.
pub trait TextBackend: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn complete(&self, payload: &BatchPayload) -> Result<String>;
}

pub fn text_backend_by_name(
    name: &str,
    config: TextBackendConfig,
    policy: FallbackPolicy,
) -> Result<Box<dyn TextBackend>> {
    match name.trim().to_ascii_lowercase().as_str() {
        DRYRUN_TEXT_BACKEND => Ok(Box::new(DryrunTextBackend::new(policy))),
        OPENAI_TEXT_BACKEND => Ok(Box::new(OpenAiChatBackend::new(config))),
        other => bail!("unknown text backend '{other}' (expected openai or dryrun)"),
    }
}

/// Offline backend: answers every sentinel block of the request with a
/// well-formed response built from the local fallback heuristic.
#[derive(Debug, Clone, Default)]
pub struct DryrunTextBackend {
    policy: FallbackPolicy,
}

impl DryrunTextBackend {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }
}

impl TextBackend for DryrunTextBackend {
    fn name(&self) -> &str {
        DRYRUN_TEXT_BACKEND
    }

    fn model(&self) -> &str {
        "dryrun-text-1"
    }

    fn complete(&self, payload: &BatchPayload) -> Result<String> {
        let prompts = read_request_prompts(&payload.user, payload.prompt_count);
        Ok(prompts
            .iter()
            .enumerate()
            .map(|(idx, prompt)| {
                render_response_block(idx + 1, prompt, &synthesize_fallback(prompt, &self.policy))
            })
            .collect::<Vec<String>>()
            .join("\n\n"))
    }
}

pub struct OpenAiChatBackend {
    config: TextBackendConfig,
    http: HttpClient,
}

impl OpenAiChatBackend {
    pub fn new(config: TextBackendConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base)
    }

    fn post_with_retries(&self, api_key: &str, payload: &Value) -> Result<HttpResponse> {
        let endpoint = self.endpoint();
        let timeout = Duration::try_from_secs_f64(self.config.timeout_s)
            .with_context(|| format!("invalid request timeout {}s", self.config.timeout_s))?;
        let mut attempt = 0usize;
        loop {
            let response = self
                .http
                .post(&endpoint)
                .bearer_auth(api_key)
                .timeout(timeout)
                .json(payload)
                .send();
            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("OpenAI request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= self.config.max_retries
                    {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        "OpenAI transport retry after transient request failure"
                    );
                    let delay_s = self.config.retry_backoff_s * attempt as f64;
                    thread::sleep(Duration::try_from_secs_f64(delay_s).unwrap_or_default());
                }
            }
        }
    }
}

impl TextBackend for OpenAiChatBackend {
    fn name(&self) -> &str {
        OPENAI_TEXT_BACKEND
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn complete(&self, payload: &BatchPayload) -> Result<String> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            bail!("OPENAI_API_KEY is not set");
        };
        let request = chat_request_body(&self.config.model, payload);
        let response = self.post_with_retries(api_key, &request)?;
        let parsed = response_json_or_error("OpenAI", response)?;
        extract_chat_text(&parsed)
    }
}

pub fn chat_request_body(model: &str, payload: &BatchPayload) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": payload.system},
            {"role": "user", "content": payload.user},
        ],
    })
}

/// `choices[0].message.content`; anything else is a backend failure.
pub fn extract_chat_text(response: &Value) -> Result<String> {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("OpenAI response has no choices[0].message.content")
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use sapflux_contracts::decomposition::{
        parse_batched_response, BatchRequest, FallbackPolicy, PromptTemplates,
    };
    use serde_json::json;

    use super::{
        chat_request_body, extract_chat_text, text_backend_by_name, truncate_text,
        DryrunTextBackend, OpenAiChatBackend, TextBackend,
    };
    use crate::config::TextBackendConfig;

    fn prompts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn dryrun_answers_every_prompt_with_parseable_block() {
        let input = prompts(&[
            "A grand castle and a stormy sky",
            "A small dog runs fast today",
            "A red ball",
        ]);
        let templates = PromptTemplates::default();
        let payload = BatchRequest::new(&input, &templates).render();
        let raw = DryrunTextBackend::default().complete(&payload).unwrap();

        let parsed = parse_batched_response(&raw, input.len(), Some(50));
        assert_eq!(parsed.len(), 3);
        let records = parsed
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records[0].switch_steps(), [25]);
        assert_eq!(records[1].stages()[0], "A small dog");
        assert_eq!(records[2].stages(), ["A red ball"]);
    }

    #[test]
    fn chat_body_and_response_shape() {
        let input = prompts(&["Shrek is blue"]);
        let templates = PromptTemplates::default();
        let payload = BatchRequest::new(&input, &templates).render();
        let body = chat_request_body("gpt-4o", &payload);
        assert_eq!(body["model"], json!("gpt-4o"));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1]["content"], json!(payload.user));

        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(extract_chat_text(&ok).unwrap(), "hi");
        assert!(extract_chat_text(&json!({"choices": []})).is_err());
        assert!(extract_chat_text(&json!({"error": {"message": "bad key"}})).is_err());
    }

    #[test]
    fn missing_api_key_fails_before_any_request() {
        let backend = OpenAiChatBackend::new(TextBackendConfig::default());
        let input = prompts(&["A red ball"]);
        let templates = PromptTemplates::default();
        let err = backend
            .complete(&BatchRequest::new(&input, &templates).render())
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn oversized_timeout_is_an_error_not_a_panic() {
        let backend = OpenAiChatBackend::new(TextBackendConfig {
            api_key: Some("sk-test".to_string()),
            timeout_s: 1e300,
            ..TextBackendConfig::default()
        });
        let input = prompts(&["A red ball"]);
        let templates = PromptTemplates::default();
        let err = backend
            .complete(&BatchRequest::new(&input, &templates).render())
            .unwrap_err();
        assert!(err.to_string().contains("invalid request timeout"));
    }

    #[test]
    fn backend_lookup_by_name() {
        let config = TextBackendConfig::default();
        let policy = FallbackPolicy::default();
        assert_eq!(
            text_backend_by_name("DryRun", config.clone(), policy)
                .unwrap()
                .name(),
            "dryrun"
        );
        assert_eq!(
            text_backend_by_name("openai", config.clone(), policy)
                .unwrap()
                .model(),
            "gpt-4o"
        );
        assert!(text_backend_by_name("zephyr", config, policy).is_err());
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }
}
