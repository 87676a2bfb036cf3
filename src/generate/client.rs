use super::parse::parse_suggestion;
use super::{GenerationRequest, ImplementationGenerator, ImplementationSuggestion};
use crate::config::Config;
use crate::error::{PatchError, Result};
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenRouter direct API base (BYOK mode)
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const MAX_TOKENS: u32 = 8192;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// API usage information from OpenRouter
#[derive(Deserialize, Clone, Debug, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default, alias = "total_cost")]
    cost: Option<f64>,
}

/// Generator backed by an OpenRouter chat model.
///
/// Calls block the interpreter thread on a private current-thread runtime,
/// bounded by `timeout`.
pub struct OpenRouterGenerator {
    api_key: String,
    model: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl OpenRouterGenerator {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PatchError::GeneratorUnavailable(format!("failed to start async runtime: {}", e)))?;
        Ok(Self {
            api_key,
            model,
            endpoint: chat_endpoint(OPENROUTER_BASE_URL),
            timeout,
            client: reqwest::Client::new(),
            runtime,
        })
    }

    /// Point at another OpenAI-compatible base URL.
    /// Loopback endpoints bypass any configured proxy.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.endpoint = chat_endpoint(base_url);
        if is_loopback(base_url) {
            match reqwest::Client::builder().no_proxy().build() {
                Ok(client) => self.client = client,
                Err(err) => tracing::debug!("keeping default HTTP client: {}", err),
            }
        }
        self
    }

    /// Build from settings; `None` when no key is configured.
    pub fn from_config(config: &mut Config) -> Option<Self> {
        let key = config.get_api_key()?;
        let timeout = Duration::from_secs(config.generator_timeout_secs.max(1));
        match Self::new(key, config.model.clone(), timeout) {
            Ok(generator) => Some(generator),
            Err(err) => {
                tracing::warn!("generator disabled: {}", err);
                None
            }
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(&self, request: &GenerationRequest) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system_instructions.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.description.clone(),
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }
}

impl ImplementationGenerator for OpenRouterGenerator {
    fn suggest(&self, request: &GenerationRequest) -> Result<ImplementationSuggestion> {
        let body = self.chat_request(request);
        tracing::debug!(model = %self.model, function = %request.target.qualname, "requesting implementation");

        let call = tokio::time::timeout(self.timeout, call_chat(&self.client, &self.endpoint, &self.api_key, &body));
        let content = match self.runtime.block_on(call) {
            Ok(Ok(content)) => content,
            Ok(Err(err)) => return Err(PatchError::GeneratorUnavailable(err.to_string())),
            Err(_) => {
                return Err(PatchError::GeneratorUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        parse_suggestion(&content)
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn is_loopback(base_url: &str) -> bool {
    let rest = base_url
        .strip_prefix("http://")
        .or_else(|| base_url.strip_prefix("https://"))
        .unwrap_or(base_url);
    rest.starts_with("127.0.0.1") || rest.starts_with("localhost") || rest.starts_with("[::1]")
}

/// Extract retry-after hint from OpenRouter response (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>().ok())
        .find(|secs| *secs > 0 && *secs < 300)
}

/// Send one chat completion, retrying on rate limits with exponential backoff
async fn call_chat(client: &reqwest::Client, endpoint: &str, api_key: &str, request: &ChatRequest) -> anyhow::Result<String> {
    let mut retry_count = 0;

    loop {
        let response = client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("X-Title", "jitter")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                anyhow::anyhow!("failed to parse OpenRouter response: {}: {}", e, truncate(&text, 200))
            })?;
            if let Some(usage) = &parsed.usage {
                tracing::debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    cost = usage.cost.unwrap_or(0.0),
                    "generator usage"
                );
            }
            return parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| anyhow::anyhow!("OpenRouter returned no choices"));
        }

        if status.as_u16() == 429 && retry_count < MAX_RETRIES {
            retry_count += 1;
            let retry_after = parse_retry_after(&text)
                .unwrap_or_else(|| (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000);
            tracing::warn!(
                "OpenRouter rate limited, retrying in {}s (attempt {}/{})",
                retry_after,
                retry_count,
                MAX_RETRIES
            );
            tokio::time::sleep(Duration::from_secs(retry_after)).await;
            continue;
        }

        let message = match status.as_u16() {
            401 => "invalid API key; run `jitter setup` to update it".to_string(),
            429 => format!("rate limited by OpenRouter after {} retries", retry_count),
            500..=599 => format!("OpenRouter server error ({})", status),
            _ => format!("API error {}: {}", status, truncate(&text, 200)),
        };
        return Err(anyhow::anyhow!(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::build_request;
    use crate::inspect::describe;
    use crate::script::{Interpreter, OutputSink};
    use std::net::TcpListener;

    /// Accepts connections and never answers.
    fn silent_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_chat_endpoint_joins_base() {
        assert_eq!(chat_endpoint("http://h/v1/"), "http://h/v1/chat/completions");
        assert_eq!(chat_endpoint(OPENROUTER_BASE_URL), "https://openrouter.ai/api/v1/chat/completions");
        assert!(is_loopback("http://127.0.0.1:8080/v1"));
        assert!(!is_loopback(OPENROUTER_BASE_URL));
    }

    #[test]
    fn test_unresponsive_endpoint_times_out() {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp
            .load_source("slow", "def f(x):\n    raise NotImplementedError\n")
            .unwrap();
        let target = describe(&module.get("f").unwrap()).unwrap();
        let request = build_request(&target, &[]);

        let generator = OpenRouterGenerator::new("sk-test".into(), "m".into(), Duration::from_secs(1))
            .unwrap()
            .with_base_url(&silent_endpoint());
        match generator.suggest(&request) {
            Err(PatchError::GeneratorUnavailable(message)) => assert_eq!(message, "timed out after 1s"),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("Rate limit hit. Retry after 12 seconds."), Some(12));
        assert_eq!(parse_retry_after("please retry in 900 seconds"), None);
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn test_request_uses_json_mode() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            max_tokens: MAX_TOKENS,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_usage_accepts_total_cost_alias() {
        let usage: Usage = serde_json::from_str(r#"{"prompt_tokens": 5, "total_cost": 0.25}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.cost, Some(0.25));
    }
}
