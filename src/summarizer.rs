//! Root-cause summaries of failing deployment logs

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::classify::{tail, tail_chars};
use crate::error::DeployError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes error logs.";

const INSTRUCTIONS: &str = "\
Summarize the following deployment log and give the root cause of the failure as concisely as possible.
Report only the most specific cause that explains why the build or deployment is failing; leave out warnings and incidental noise.
If several distinct errors are each causing the failure, give the root cause of each one separately, numbered.
Do not comment on the deployment script that ran the commands, only on the project output.
Ignore docker and container tooling output, it is not the root cause.
Answer in plain text: no markdown, no emojis. It is delivered as a chat message to an experienced programmer.";

/// Turns a bounded log excerpt into a short natural-language explanation
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, log_excerpt: &str) -> Result<String, DeployError>;
}

/// Builds the user message sent to the model
pub fn build_prompt(log_excerpt: &str) -> String {
    format!("{}\n\nThis is the log:\n{}", INSTRUCTIONS, log_excerpt)
}

/// Bounds applied to logs before they leave the process
#[derive(Debug, Clone, Copy)]
pub struct ExcerptLimits {
    /// Characters sent to the summarizer, counted from the end
    pub max_input_chars: usize,
    /// Lines sent in place of a summary
    pub fallback_lines: usize,
}

/// Summary of `log` when the summarizer answers, otherwise the raw tail.
pub async fn summarize_or_raw(
    summarizer: Option<&dyn Summarizer>,
    log: &str,
    limits: ExcerptLimits,
) -> String {
    let raw = || format!("Log tail:\n{}", tail(log, limits.fallback_lines));

    let Some(summarizer) = summarizer else {
        return raw();
    };
    let excerpt = tail_chars(log, limits.max_input_chars);
    match summarizer.summarize(excerpt).await {
        Ok(summary) => format!("Root cause:\n{}", summary.trim()),
        Err(e) => {
            warn!("Falling back to raw log excerpt: {}", e);
            raw()
        }
    }
}

/// Chat-completions backed [`Summarizer`]
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_input_chars: usize,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl OpenAiSummarizer {
    pub fn new(
        api_url: &str,
        api_key: &str,
        model: &str,
        max_input_chars: usize,
    ) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeployError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_input_chars,
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, log_excerpt: &str) -> Result<String, DeployError> {
        let excerpt = tail_chars(log_excerpt, self.max_input_chars);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(excerpt),
                },
            ],
        };

        debug!(
            "Requesting summary of {} chars from model {}",
            excerpt.len(),
            self.model
        );
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeployError::Summarization(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ApiError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_default();
            let reason = match status {
                StatusCode::TOO_MANY_REQUESTS => "rate limited or quota exhausted",
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "API key rejected",
                _ => "request failed",
            };
            return Err(DeployError::Summarization(format!(
                "{} (HTTP {}): {}",
                reason,
                status.as_u16(),
                detail
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| DeployError::Summarization(format!("unreadable response: {}", e)))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DeployError::Summarization("empty completion".to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{CannedSummarizer, FailingSummarizer};
    use super::*;

    const LIMITS: ExcerptLimits = ExcerptLimits {
        max_input_chars: 50,
        fallback_lines: 2,
    };

    #[tokio::test]
    async fn uses_summary_when_available() {
        let summarizer = CannedSummarizer::new("  Missing DATABASE_URL.\n");
        let text = summarize_or_raw(Some(&summarizer), "boom\nfailed", LIMITS).await;
        assert_eq!(text, "Root cause:\nMissing DATABASE_URL.");
    }

    #[tokio::test]
    async fn input_is_tail_truncated() {
        let summarizer = CannedSummarizer::new("ok");
        let log = format!("{}{}", "a".repeat(200), "the real error at the end");
        summarize_or_raw(Some(&summarizer), &log, LIMITS).await;
        let inputs = summarizer.inputs.lock().unwrap();
        assert_eq!(inputs[0].chars().count(), 50);
        assert!(inputs[0].ends_with("the real error at the end"));
    }

    #[tokio::test]
    async fn falls_back_to_raw_tail_on_error() {
        let text = summarize_or_raw(Some(&FailingSummarizer), "one\ntwo\nthree", LIMITS).await;
        assert_eq!(text, "Log tail:\ntwo\nthree");
    }

    #[tokio::test]
    async fn falls_back_to_raw_tail_without_summarizer() {
        let text = summarize_or_raw(None, "one\ntwo\nthree", LIMITS).await;
        assert_eq!(text, "Log tail:\ntwo\nthree");
    }

    #[test]
    fn prompt_embeds_log_and_plain_text_rules() {
        let prompt = build_prompt("npm ERR! missing script: build");
        assert!(prompt.ends_with("npm ERR! missing script: build"));
        assert!(prompt.contains("no markdown"));
        assert!(prompt.contains("docker"));
        assert!(prompt.contains("each one separately"));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_summarization_error() {
        // Port 9 (discard) on localhost is closed in test environments
        let summarizer = OpenAiSummarizer::new("http://127.0.0.1:9", "key", "gpt-4o", 100).unwrap();
        let err = summarizer.summarize("error").await.unwrap_err();
        assert!(matches!(err, DeployError::Summarization(_)));
    }

    mod openai {
        use super::*;
        use axum::http::{HeaderMap, StatusCode};
        use serde_json::{Value, json};
        use std::sync::{Arc, Mutex};

        /// Fake chat-completions endpoint answering with `status` and `reply`,
        /// recording the authorization header and request body.
        async fn fake_openai(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Vec<(String, Value)>>>) {
            let received = Arc::new(Mutex::new(Vec::new()));
            let store = Arc::clone(&received);
            let router = axum::Router::new().route(
                "/chat/completions",
                axum::routing::post(move |headers: HeaderMap, axum::Json(body): axum::Json<Value>| {
                    let store = Arc::clone(&store);
                    let reply = reply.clone();
                    async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        store.lock().unwrap().push((auth, body));
                        (status, axum::Json(reply))
                    }
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
            (format!("http://{}", address), received)
        }

        fn completion(content: &str) -> Value {
            json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
        }

        #[tokio::test]
        async fn returns_first_choice_content() {
            let (url, received) = fake_openai(StatusCode::OK, completion("Port 8080 already in use.")).await;
            let summarizer = OpenAiSummarizer::new(&url, "sk-test", "gpt-4o-mini", 10).unwrap();

            let summary = summarizer.summarize("0123456789error: port in use").await.unwrap();
            assert_eq!(summary, "Port 8080 already in use.");

            let received = received.lock().unwrap();
            let (auth, body) = &received[0];
            assert_eq!(auth, "Bearer sk-test");
            assert_eq!(body["model"], "gpt-4o-mini");
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["messages"][1]["role"], "user");
            let prompt = body["messages"][1]["content"].as_str().unwrap();
            assert!(prompt.ends_with("This is the log:\nort in use"), "{}", prompt);
        }

        #[tokio::test]
        async fn rate_limit_and_rejected_key_are_named() {
            let quota = json!({ "error": { "message": "You exceeded your current quota" } });
            let (url, _) = fake_openai(StatusCode::TOO_MANY_REQUESTS, quota).await;
            let summarizer = OpenAiSummarizer::new(&url, "sk-test", "gpt-4o", 100).unwrap();
            let err = summarizer.summarize("error").await.unwrap_err().to_string();
            assert!(err.contains("rate limited"), "{}", err);
            assert!(err.contains("HTTP 429"), "{}", err);
            assert!(err.contains("exceeded your current quota"), "{}", err);

            let invalid = json!({ "error": { "message": "Incorrect API key provided" } });
            let (url, _) = fake_openai(StatusCode::UNAUTHORIZED, invalid).await;
            let summarizer = OpenAiSummarizer::new(&url, "sk-bad", "gpt-4o", 100).unwrap();
            match summarizer.summarize("error").await {
                Err(DeployError::Summarization(reason)) => {
                    assert!(reason.contains("API key rejected"), "{}", reason);
                    assert!(reason.contains("HTTP 401"), "{}", reason);
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[tokio::test]
        async fn empty_completion_is_an_error() {
            for reply in [json!({ "choices": [] }), completion("   ")] {
                let (url, _) = fake_openai(StatusCode::OK, reply).await;
                let summarizer = OpenAiSummarizer::new(&url, "sk-test", "gpt-4o", 100).unwrap();
                let err = summarizer.summarize("error").await.unwrap_err();
                assert!(err.to_string().contains("empty completion"), "{}", err);
            }
        }

        #[tokio::test]
        async fn failed_request_falls_back_to_log_tail() {
            let (url, _) = fake_openai(StatusCode::INTERNAL_SERVER_ERROR, json!({})).await;
            let summarizer = OpenAiSummarizer::new(&url, "sk-test", "gpt-4o", 100).unwrap();
            let text = summarize_or_raw(Some(&summarizer), "one\ntwo\nthree", LIMITS).await;
            assert_eq!(text, "Log tail:\ntwo\nthree");
        }
    }
}
