//! Focus analysis through a hosted generative model.
//!
//! The captured image is sent inline (base64) with a fixed instruction asking
//! for strict JSON, and the first text part of the first candidate is parsed
//! as an [`Analysis`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Instruction sent alongside every image.
pub const FOCUS_PROMPT: &str = "\
You are an assistant that evaluates study focus from a webcam-like image. Your POV is from the side of the person's desk/workspace. If they are looking straight ahead or down a little bit, they are likely focused.
If they have a phone in front of them, they are likely not focused, Ipad or tablet however may be part of homework.
Return ONLY strict JSON matching this schema with sensible values:
{\"is_focused\": boolean, \"focus_level\": number, \"is_away\": boolean, \"text_summary\": string}
- is_focused: true if person appears engaged with screen/books.
- focus_level: 0.0..1.0 confidence of focus, make sure to use the full range of focus values.
- is_away: true if no person or clearly not at desk, ignore far away persons in the background.
- text_summary: one short sentence.";

/// Judgement extracted from one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub is_focused: bool,
    /// Confidence of focus in `[0, 1]`
    pub focus_level: f64,
    pub is_away: bool,
    #[serde(rename = "text_summary")]
    pub summary: String,
}

/// Anything that can turn a captured image into an [`Analysis`].
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, image: &Path) -> Result<Analysis, InferenceError>;
}

/// Inference client error types.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("missing API key: set GEMINI_API_KEY or GOOGLE_API_KEY")]
    AuthMissing,

    #[error("failed to read image {path}: {source}")]
    ImageRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("inference request failed: {0}")]
    Transport(String),

    #[error("inference service error ({status}): {body}")]
    BadResponse { status: u16, body: String },

    #[error("no content from model")]
    NoContent,

    #[error("unable to parse model JSON: {reason}; raw: {raw}")]
    Unparsable { reason: String, raw: String },
}

/// Inference service configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Service base URL, without a trailing slash
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// API key; calls fail with [`InferenceError::AuthMissing`] when unset
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_secs(30),
        }
    }

    /// Settings from the monitor config, with the key taken from the environment.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.inference_endpoint.as_str(),
            config.model.as_str(),
            crate::config::api_key_from_env(),
        )
        .with_timeout(config.inference_timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the content generation URL (the key travels as a query parameter).
    pub fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        )
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    InlineData { inline_data: InlineData },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

/// Client for the generateContent endpoint.
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new inference client.
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    /// Send raw JPEG bytes for analysis.
    pub async fn analyze_bytes(&self, image: &[u8]) -> Result<Analysis, InferenceError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(InferenceError::AuthMissing)?;

        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/jpeg",
                            data: BASE64.encode(image),
                        },
                    },
                    Part::Text { text: FOCUS_PROMPT },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
            },
        };

        let response = self
            .client
            .post(self.config.generate_url())
            .query(&[("key", key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(InferenceError::BadResponse {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        let generated: GenerateResponse =
            serde_json::from_str(&body).map_err(|_| InferenceError::BadResponse {
                status: status.as_u16(),
                body,
            })?;

        let text = generated
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or(InferenceError::NoContent)?;

        tracing::debug!("Model raw response: {}", text);
        parse_analysis(&text)
    }
}

#[async_trait]
impl Analyzer for GeminiClient {
    async fn analyze(&self, image: &Path) -> Result<Analysis, InferenceError> {
        // Fail on a missing key before touching the disk or the network.
        if self.config.api_key.is_none() {
            return Err(InferenceError::AuthMissing);
        }
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|source| InferenceError::ImageRead {
                path: image.display().to_string(),
                source,
            })?;
        self.analyze_bytes(&bytes).await
    }
}

/// Parse model output as an [`Analysis`], tolerating a Markdown code fence.
pub fn parse_analysis(text: &str) -> Result<Analysis, InferenceError> {
    let parsed = serde_json::from_str::<Analysis>(text).or_else(|_| {
        serde_json::from_str::<Analysis>(strip_code_fence(text)).map_err(|e| {
            InferenceError::Unparsable {
                reason: e.to_string(),
                raw: text.to_string(),
            }
        })
    })?;

    Ok(Analysis {
        focus_level: if parsed.focus_level.is_nan() {
            0.0
        } else {
            parsed.focus_level.clamp(0.0, 1.0)
        },
        ..parsed
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::StatusCode, routing::post, Json, Router};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn mock_service(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    fn client_for(addr: SocketAddr, key: Option<&str>) -> GeminiClient {
        GeminiClient::new(GeminiConfig::new(
            format!("http://{addr}"),
            "gemini-2.5-flash",
            key.map(str::to_string),
        ))
    }

    #[test]
    fn test_generate_url() {
        let config = GeminiConfig::new("https://example.test/", "gemini-2.5-flash", None);
        assert_eq!(
            config.generate_url(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let config = GeminiConfig::new("https://example.test", "m", Some("  ".to_string()));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_parse_plain_json() {
        let a = parse_analysis(
            r#"{"is_focused": true, "focus_level": 0.8, "is_away": false, "text_summary": "Reading."}"#,
        )
        .unwrap();
        assert!(a.is_focused);
        assert_eq!(a.focus_level, 0.8);
        assert_eq!(a.summary, "Reading.");
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "```json\n{\"is_focused\": false, \"focus_level\": 0.1, \"is_away\": true, \"text_summary\": \"Empty desk.\"}\n```";
        let a = parse_analysis(text).unwrap();
        assert!(a.is_away);
        assert_eq!(a.summary, "Empty desk.");
    }

    #[test]
    fn test_parse_clamps_focus_level() {
        let a = parse_analysis(
            r#"{"is_focused": true, "focus_level": 1.7, "is_away": false, "text_summary": ""}"#,
        )
        .unwrap();
        assert_eq!(a.focus_level, 1.0);
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_analysis("the person looks focused").unwrap_err();
        assert!(matches!(err, InferenceError::Unparsable { .. }));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens here; a request would be a transport error instead.
        let client = GeminiClient::new(GeminiConfig::new("http://127.0.0.1:9", "m", None));
        let err = client.analyze(&dir.path().join("absent.jpg")).await.unwrap_err();
        assert!(matches!(err, InferenceError::AuthMissing), "{err}");
    }

    #[tokio::test]
    async fn test_round_trip_against_mock_service() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(
                |Query(query): Query<HashMap<String, String>>,
                 Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(query.get("key").map(String::as_str), Some("secret"));
                    let parts = &body["contents"][0]["parts"];
                    assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
                    assert_eq!(parts[0]["inline_data"]["data"], "anBlZw==");
                    assert_eq!(body["generation_config"]["response_mime_type"], "application/json");
                    Json(serde_json::json!({
                        "candidates": [{
                            "content": {"parts": [{"text": "```json\n{\"is_focused\": true, \"focus_level\": 0.9, \"is_away\": false, \"text_summary\": \"Typing.\"}\n```"}]}
                        }]
                    }))
                },
            ),
        );
        let addr = mock_service(router).await;

        let analysis = client_for(addr, Some("secret"))
            .analyze_bytes(b"jpeg")
            .await
            .unwrap();
        assert_eq!(analysis.focus_level, 0.9);
        assert_eq!(analysis.summary, "Typing.");
    }

    #[tokio::test]
    async fn test_error_status_is_bad_response() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|| async { (StatusCode::FORBIDDEN, "API key not valid") }),
        );
        let addr = mock_service(router).await;

        let err = client_for(addr, Some("bad"))
            .analyze_bytes(b"jpeg")
            .await
            .unwrap_err();
        match err {
            InferenceError::BadResponse { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("not valid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_success_status_with_foreign_body_is_bad_response() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|| async { "<html>captive portal</html>" }),
        );
        let addr = mock_service(router).await;

        let err = client_for(addr, Some("k"))
            .analyze_bytes(b"jpeg")
            .await
            .unwrap_err();
        match err {
            InferenceError::BadResponse { status, body } => {
                assert_eq!(status, 200);
                assert!(body.contains("captive portal"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates_is_no_content() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|| async { Json(serde_json::json!({"candidates": []})) }),
        );
        let addr = mock_service(router).await;

        let err = client_for(addr, Some("k"))
            .analyze_bytes(b"jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::NoContent), "{err}");
    }
}
