//! xAI chat API client.
//!
//! The orchestrator only sees the [`ChatClient`] trait: a single `chat`
//! call taking the assembled prompt plus per-turn feature flags and
//! returning content, tool invocations, and citations. Every transport,
//! auth, or malformed-response condition is one [`LlmError`].

use crate::error::LlmError;
use crate::{ChatMessage, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-turn options for a chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub user_id: Option<String>,
    pub enable_web_search: bool,
    pub enable_x_search: bool,
    pub enable_code_execution: bool,
    pub web_search_allowed_domains: Vec<String>,
    pub web_search_excluded_domains: Vec<String>,
    pub web_search_country: Option<String>,
    pub image_urls: Vec<String>,
}

/// Result of a chat call. `tool_calls` entries are already rendered as
/// `name(arguments)` strings for the reply footer.
#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub content: String,
    pub tool_calls: Vec<String>,
    pub citations: Vec<String>,
}

/// The LLM boundary.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatResult, LlmError>;
}

/// reqwest-backed client for the xAI chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct XaiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
}

impl XaiClient {
    pub fn new(
        api_key: impl Into<String>,
        api_host: &str,
        model: impl Into<String>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: format!("https://{api_host}/v1/chat/completions"),
            model: model.into(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl ChatClient for XaiClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatResult, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: build_request_messages(messages, &options.image_urls),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            user: options.user_id.as_deref(),
            search_parameters: build_search_parameters(&options),
            tools: build_tools(&options),
        };
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            user_id = ?options.user_id,
            "chat request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;

        let search_enabled = options.enable_web_search || options.enable_x_search;
        let result = parse_response(body, search_enabled)?;
        tracing::debug!(
            content_len = result.content.len(),
            tool_calls = result.tool_calls.len(),
            citations = result.citations.len(),
            "chat response"
        );
        Ok(result)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_parameters: Option<SearchParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSpec>>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: Role,
    content: RequestContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Serialize)]
struct SearchParameters {
    mode: &'static str,
    return_citations: bool,
    sources: Vec<SearchSource>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SearchSource {
    Web {
        #[serde(skip_serializing_if = "Option::is_none")]
        allowed_websites: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        excluded_websites: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        country: Option<String>,
    },
    X,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolSpec {
    CodeExecution,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Image parts attach to the final user message; everything else goes out as
/// plain text.
fn build_request_messages(messages: &[ChatMessage], image_urls: &[String]) -> Vec<RequestMessage> {
    let attach_to_last = !image_urls.is_empty()
        && messages.last().is_some_and(|message| message.role == Role::User);

    let mut request_messages = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        let is_target = attach_to_last && index == messages.len() - 1;
        let content = if is_target {
            let mut parts = vec![ContentPart::Text { text: message.content.clone() }];
            parts.extend(image_urls.iter().map(|url| ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.clone(), detail: "auto" },
            }));
            RequestContent::Parts(parts)
        } else {
            RequestContent::Text(message.content.clone())
        };
        request_messages.push(RequestMessage { role: message.role, content });
    }
    request_messages
}

fn build_search_parameters(options: &ChatOptions) -> Option<SearchParameters> {
    if !options.enable_web_search && !options.enable_x_search {
        return None;
    }
    let mut sources = Vec::new();
    if options.enable_web_search {
        let allowed = non_empty(&options.web_search_allowed_domains);
        let mut excluded = non_empty(&options.web_search_excluded_domains);
        if allowed.is_some() && excluded.is_some() {
            tracing::warn!("both allowed and excluded search domains set; using allowed only");
            excluded = None;
        }
        sources.push(SearchSource::Web {
            allowed_websites: allowed,
            excluded_websites: excluded,
            country: options.web_search_country.clone(),
        });
    }
    if options.enable_x_search {
        sources.push(SearchSource::X);
    }
    Some(SearchParameters { mode: "auto", return_citations: true, sources })
}

fn build_tools(options: &ChatOptions) -> Option<Vec<ToolSpec>> {
    options
        .enable_code_execution
        .then(|| vec![ToolSpec::CodeExecution])
}

fn non_empty(domains: &[String]) -> Option<Vec<String>> {
    if domains.is_empty() { None } else { Some(domains.to_vec()) }
}

fn parse_response(body: ChatResponse, search_enabled: bool) -> Result<ChatResult, LlmError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("response carried no choices".into()))?;
    let content = choice
        .message
        .content
        .ok_or_else(|| LlmError::InvalidResponse("response carried no content".into()))?;

    let tool_calls: Vec<String> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| format!("{}({})", call.function.name, call.function.arguments))
        .collect();

    let content = append_citations(&content, &body.citations, search_enabled);
    Ok(ChatResult { content, tool_calls, citations: body.citations })
}

/// When search was enabled and the response carried citations, append them
/// as a deduplicated source list.
fn append_citations(content: &str, citations: &[String], search_enabled: bool) -> String {
    if !search_enabled || citations.is_empty() {
        return content.trim().to_string();
    }
    let mut unique = Vec::new();
    for citation in citations {
        if !unique.contains(citation) {
            unique.push(citation.clone());
        }
    }
    let sources: Vec<String> = unique.iter().map(|c| format!("- {c}")).collect();
    format!("{content}\n\n出典:\n{}", sources.join("\n"))
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(content: &str, citations: &[&str]) -> ChatResponse {
        ChatResponse {
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    content: Some(content.to_string()),
                    tool_calls: vec![
                        ResponseToolCall {
                            function: ResponseFunction {
                                name: "web_search".into(),
                                arguments: "{\"q\":\"x\"}".into(),
                            },
                        },
                    ],
                },
            }],
            citations: citations.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn parse_formats_tool_calls() {
        let result = parse_response(response_with("ok", &[]), false).unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(result.tool_calls, vec!["web_search({\"q\":\"x\"})"]);
    }

    #[test]
    fn citations_appended_only_when_search_enabled() {
        let result = parse_response(
            response_with("回答です。", &["https://a.example", "https://a.example"]),
            true,
        )
        .unwrap();
        assert_eq!(result.content, "回答です。\n\n出典:\n- https://a.example");

        let without = parse_response(response_with("回答です。", &["https://a.example"]), false)
            .unwrap();
        assert_eq!(without.content, "回答です。");
    }

    #[test]
    fn empty_choices_is_invalid_response() {
        let body = ChatResponse { choices: vec![], citations: vec![] };
        assert!(matches!(
            parse_response(body, false),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn images_attach_to_final_user_message() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("look at this"),
        ];
        let urls = vec!["https://cdn.example/a.png".to_string()];
        let built = build_request_messages(&messages, &urls);
        assert!(matches!(built[0].content, RequestContent::Text(_)));
        match &built[1].content {
            RequestContent::Parts(parts) => assert_eq!(parts.len(), 2),
            RequestContent::Text(_) => panic!("expected image parts"),
        }
    }

    #[test]
    fn images_ignored_when_last_message_is_not_user() {
        let messages = vec![ChatMessage::assistant("done")];
        let urls = vec!["https://cdn.example/a.png".to_string()];
        let built = build_request_messages(&messages, &urls);
        assert!(matches!(built[0].content, RequestContent::Text(_)));
    }

    #[test]
    fn allowed_domains_win_over_excluded() {
        let options = ChatOptions {
            enable_web_search: true,
            web_search_allowed_domains: vec!["a.example".into()],
            web_search_excluded_domains: vec!["b.example".into()],
            ..Default::default()
        };
        let params = build_search_parameters(&options).unwrap();
        match &params.sources[0] {
            SearchSource::Web { allowed_websites, excluded_websites, .. } => {
                assert!(allowed_websites.is_some());
                assert!(excluded_websites.is_none());
            }
            SearchSource::X => panic!("expected web source"),
        }
    }

    #[test]
    fn search_parameters_absent_without_search_flags() {
        let options = ChatOptions { enable_code_execution: true, ..Default::default() };
        assert!(build_search_parameters(&options).is_none());
        assert_eq!(build_tools(&options).map(|tools| tools.len()), Some(1));
        assert!(build_tools(&ChatOptions::default()).is_none());
    }
}
