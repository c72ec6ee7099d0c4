//! JSON-lines request session
//!
//! One request object per input line, one response object per output line.
//! Lets an external front end (a web form, an editor plugin) drive the
//! harness over a pipe. Requests look like:
//!
//! ```json
//! {"id": 1, "prompt": "Fix the auth check", "variant": "base", "max_tokens": 300}
//! {"id": 2, "prompt": "Fix the auth check", "compare": true, "temperature": 0.0}
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HarnessError;
use crate::generation::{ComparisonOrchestrator, ComparisonResult, GenerationRequest, GenerationResult};
use crate::registry::ModelVariant;

/// Inbound request line
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Echoed back on the response
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub prompt: String,
    /// Variant selector; fine-tuned when omitted
    #[serde(default)]
    pub variant: Option<String>,
    /// Run both variants instead of one
    #[serde(default)]
    pub compare: bool,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Outbound response line
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Response {
    Single {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        variant: String,
        result: GenerationResult,
    },
    Compare {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        comparison: ComparisonResult,
    },
    /// The line could not be parsed as a request
    Rejected { result: GenerationResult },
}

/// Serves requests against an orchestrator with per-session defaults
pub struct Session {
    orchestrator: ComparisonOrchestrator,
    default_max_tokens: usize,
    default_temperature: f32,
}

impl Session {
    pub fn new(
        orchestrator: ComparisonOrchestrator,
        default_max_tokens: usize,
        default_temperature: f32,
    ) -> Self {
        Self {
            orchestrator,
            default_max_tokens,
            default_temperature,
        }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let max_tokens = request.max_tokens.unwrap_or(self.default_max_tokens);
        let temperature = request.temperature.unwrap_or(self.default_temperature);

        if request.compare {
            let comparison = self
                .orchestrator
                .compare(&request.prompt, max_tokens, temperature)
                .await;
            return Response::Compare {
                id: request.id,
                comparison,
            };
        }

        let selector = request
            .variant
            .unwrap_or_else(|| ModelVariant::FineTuned.to_string());
        let result = match selector.parse::<ModelVariant>() {
            Ok(variant) => {
                let request = GenerationRequest::new(request.prompt, variant, max_tokens, temperature);
                self.orchestrator.handler().handle(request).await
            }
            Err(err) => err.into(),
        };

        Response::Single {
            id: request.id,
            variant: selector,
            result,
        }
    }

    /// Handle one raw input line
    pub async fn dispatch_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Response::Rejected {
                result: HarnessError::InvalidRequest(format!("malformed request: {}", e)).into(),
            },
        }
    }

    /// Read requests until EOF, writing one response per non-blank line
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut served = 0;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch_line(&line).await;
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            served += 1;
        }

        tracing::info!("Session closed after {} requests", served);
        Ok(served)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockGenerator, SamplingParams};
    use crate::generation::GenerationHandler;
    use crate::registry::{ModelHandle, ModelRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> Session {
        let registry = ModelRegistry::from_handles(
            ModelHandle::new(
                ModelVariant::Base,
                Arc::new(MockGenerator::new("base")),
                SamplingParams::default(),
            ),
            ModelHandle::new(
                ModelVariant::FineTuned,
                Arc::new(MockGenerator::new("ft")),
                SamplingParams::default(),
            ),
        );
        let handler = GenerationHandler::new(Arc::new(registry), Duration::from_secs(5));
        Session::new(ComparisonOrchestrator::new(handler), 16, 0.0)
    }

    async fn roundtrip(input: &str) -> Vec<serde_json::Value> {
        let mut output = Vec::new();
        session()
            .run(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_single_defaults_to_fine_tuned() {
        let responses = roundtrip(r#"{"id": 7, "prompt": "Add a toggle"}"#).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["mode"], "single");
        assert_eq!(responses[0]["id"], 7);
        assert_eq!(responses[0]["variant"], "fine-tuned");
        assert_eq!(responses[0]["result"]["status"], "success");
    }

    #[tokio::test]
    async fn test_compare_and_blank_lines() {
        let input = "\n{\"prompt\": \"Fix auth\", \"compare\": true}\n\n";
        let responses = roundtrip(input).await;
        assert_eq!(responses.len(), 1);
        let comparison = &responses[0]["comparison"];
        assert_eq!(comparison["base"]["status"], "success");
        assert_eq!(comparison["fine_tuned"]["status"], "success");
        assert_eq!(comparison["max_tokens"], 16);
    }

    #[tokio::test]
    async fn test_bad_lines_do_not_end_session() {
        let input = "not json\n{\"prompt\": \"p\", \"variant\": \"large\"}\n{\"prompt\": \"p\", \"variant\": \"base\"}\n";
        let responses = roundtrip(input).await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["mode"], "rejected");
        assert_eq!(responses[0]["result"]["kind"], "invalid_request");
        assert_eq!(responses[1]["result"]["kind"], "invalid_request");
        assert_eq!(responses[2]["result"]["status"], "success");
    }
}
