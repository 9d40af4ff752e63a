//! Ollama HTTP backend and scoped server lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{InferenceBackend, InferenceError, InferenceRequest};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llava";
pub const DEFAULT_NUM_CTX: u32 = 2048;
/// Keep the model resident between documents; it is unloaded explicitly at shutdown.
pub const DEFAULT_KEEP_ALIVE: i64 = -1;

/// How long [`OllamaServer::acquire`] waits for a freshly spawned server.
const STARTUP_POLLS: u32 = 30;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
    stream: bool,
    format: &'static str,
    keep_alive: i64,
    options: GenerateOptions,
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_ctx: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Talks to an Ollama server's `/api/generate` endpoint.
pub struct OllamaBackend {
    base_url: String,
    model: String,
    label: String,
    num_ctx: u32,
    keep_alive: i64,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = normalize_base_url(&base_url.into());
        let model = model.into();
        Self {
            label: format!("ollama:{}", model),
            base_url,
            model,
            num_ctx: DEFAULT_NUM_CTX,
            keep_alive: DEFAULT_KEEP_ALIVE,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_num_ctx(mut self, num_ctx: u32) -> Self {
        self.num_ctx = num_ctx;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: i64) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Ask the server to evict the model from memory (`keep_alive: 0`).
    pub async fn unload(&self) -> Result<(), InferenceError> {
        let body = serde_json::json!({ "model": self.model, "keep_alive": 0 });
        let resp = self
            .client
            .post(self.generate_url())
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| InferenceError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(InferenceError::Backend {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        tracing::info!(model = %self.model, "model unloaded");
        Ok(())
    }
}

impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn infer<'a>(
        &'a self,
        request: &'a InferenceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>> {
        Box::pin(async move {
            let body = GenerateRequest {
                model: &self.model,
                system: &request.system_prompt,
                prompt: &request.user_prompt,
                images: &request.images,
                stream: false,
                format: "json",
                keep_alive: self.keep_alive,
                options: GenerateOptions {
                    num_ctx: self.num_ctx,
                    temperature: 0.0,
                },
            };

            tracing::debug!(
                model = %self.model,
                images = request.images.len(),
                "sending generate request"
            );

            let resp = self
                .client
                .post(self.generate_url())
                .json(&body)
                .send()
                .await
                .map_err(|e| InferenceError::Unreachable(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(InferenceError::Backend {
                    status: status.as_u16(),
                    message: resp.text().await.unwrap_or_default(),
                });
            }

            let parsed: GenerateResponse = resp
                .json()
                .await
                .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

            if let Some(error) = parsed.error {
                return Err(InferenceError::Backend {
                    status: status.as_u16(),
                    message: error,
                });
            }
            parsed.response.ok_or_else(|| {
                InferenceError::InvalidResponse("missing 'response' field".into())
            })
        })
    }
}

/// Server root without trailing slash. Accepts a full `/api/generate` URL.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix("/api/generate")
        .unwrap_or(url)
        .trim_end_matches('/')
        .to_string()
}

/// Returns true if an Ollama server answers at `base_url`.
pub async fn is_reachable(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    matches!(
        client.get(&url).timeout(REACHABILITY_TIMEOUT).send().await,
        Ok(resp) if resp.status().is_success()
    )
}

/// Scoped handle on the inference server.
///
/// If a server is already listening it is used as-is and left running.
/// Otherwise, when `autostart` is set, `ollama serve` is spawned and the
/// guard kills it again on [`shutdown`](Self::shutdown) or drop, so every
/// exit path releases it.
pub struct OllamaServer {
    base_url: String,
    child: Option<Child>,
}

impl OllamaServer {
    pub async fn acquire(base_url: &str, autostart: bool) -> Result<Self, InferenceError> {
        let client = reqwest::Client::new();
        let base_url = normalize_base_url(base_url);

        if is_reachable(&client, &base_url).await {
            tracing::info!(url = %base_url, "inference server already running");
            return Ok(Self {
                base_url,
                child: None,
            });
        }

        if !autostart {
            return Err(InferenceError::Unreachable(format!(
                "no inference server at {}",
                base_url
            )));
        }

        tracing::info!(url = %base_url, "starting ollama serve");
        let child = Command::new("ollama")
            .arg("serve")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| InferenceError::Startup(e.to_string()))?;

        let mut server = Self {
            base_url,
            child: Some(child),
        };

        for _ in 0..STARTUP_POLLS {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            if is_reachable(&client, &server.base_url).await {
                tracing::info!(url = %server.base_url, "inference server ready");
                return Ok(server);
            }
        }

        server.shutdown();
        Err(InferenceError::Startup(format!(
            "server did not answer within {}s",
            STARTUP_POLLS as u64 * STARTUP_POLL_INTERVAL.as_secs()
        )))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop the server if this guard started it. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::info!(url = %self.base_url, "inference server stopped");
        }
    }
}

impl Drop for OllamaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_serializes_ollama_fields() {
        let images = vec!["aW1n".to_string()];
        let body = GenerateRequest {
            model: "llava",
            system: "sys",
            prompt: "user",
            images: &images,
            stream: false,
            format: "json",
            keep_alive: -1,
            options: GenerateOptions {
                num_ctx: 2048,
                temperature: 0.0,
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "llava");
        assert_eq!(value["system"], "sys");
        assert_eq!(value["images"][0], "aW1n");
        assert_eq!(value["stream"], false);
        assert_eq!(value["format"], "json");
        assert_eq!(value["options"]["num_ctx"], 2048);
    }

    #[test]
    fn empty_images_are_omitted() {
        let body = GenerateRequest {
            model: "llava",
            system: "",
            prompt: "",
            images: &[],
            stream: false,
            format: "json",
            keep_alive: 0,
            options: GenerateOptions {
                num_ctx: 1024,
                temperature: 0.0,
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("images").is_none());
    }

    #[test]
    fn backend_label_and_url_are_normalized() {
        let backend = OllamaBackend::new("http://localhost:11434/", "llava:13b");
        assert_eq!(backend.name(), "ollama:llava:13b");
        assert_eq!(backend.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn generate_endpoint_is_reduced_to_server_root() {
        assert_eq!(
            normalize_base_url("http://localhost:11434/api/generate"),
            "http://localhost:11434"
        );
        assert_eq!(normalize_base_url("http://gpu-box:11434/"), "http://gpu-box:11434");
    }

    #[tokio::test]
    async fn acquire_without_autostart_fails_when_unreachable() {
        // Port 9 (discard) is never an Ollama server.
        let result = OllamaServer::acquire("http://127.0.0.1:9", false).await;
        assert!(matches!(result, Err(InferenceError::Unreachable(_))));
    }
}
