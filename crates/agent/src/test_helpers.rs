//! Shared test helpers.

use std::collections::VecDeque;
use std::sync::Mutex;

use agentry_core::error::ProviderError;
use agentry_core::message::Message;
use agentry_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use tokio::sync::mpsc;

/// One scripted completion.
#[derive(Debug, Clone)]
pub struct Script {
    chunks: Vec<String>,
    hang: bool,
    panic: bool,
    error: Option<ProviderError>,
}

impl Script {
    /// A completion streamed as the given deltas.
    pub fn chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            hang: false,
            panic: false,
            error: None,
        }
    }

    /// A completion streamed in one delta.
    pub fn text(text: &str) -> Self {
        Self::chunks(&[text])
    }

    /// A completion that fails before streaming.
    pub fn fail(error: ProviderError) -> Self {
        Self {
            chunks: vec![],
            hang: false,
            panic: false,
            error: Some(error),
        }
    }

    /// A completion whose call panics.
    pub fn panic() -> Self {
        Self {
            panic: true,
            ..Self::chunks(&[])
        }
    }

    /// After the deltas, keep the stream open until the receiver goes away.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// A mock provider that plays back a sequence of scripted completions.
///
/// Each call to `stream` consumes the next script. Once the scripts run out
/// every call fails with an API error.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Provider that answers every call in order with the given texts.
    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Script::text(t)).collect())
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: ProviderRequest) -> Result<Script, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().ok_or(ProviderError::ApiError {
            status_code: 500,
            message: "no more scripted responses".into(),
        })?;
        if script.panic {
            panic!("scripted provider panicked");
        }
        match script.error {
            Some(e) => Err(e),
            None => Ok(script),
        }
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        let script = self.next(request)?;
        Ok(ProviderResponse {
            message: Message::assistant(script.chunks.concat()),
            usage: Some(usage()),
            model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let script = self.next(request)?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for chunk in script.chunks {
                let chunk = StreamChunk {
                    content: Some(chunk),
                    done: false,
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if script.hang {
                tx.closed().await;
                return;
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    content: None,
                    done: true,
                    usage: Some(usage()),
                }))
                .await;
        });

        Ok(rx)
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}
