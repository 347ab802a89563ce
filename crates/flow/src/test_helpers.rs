//! Shared test helpers for runner and engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use superego_core::error::ProviderError;
use superego_core::message::{Message, MessageToolCall};
use superego_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk,
};
use superego_providers::ProviderRouter;
use tokio::sync::mpsc;

/// One scripted provider reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    ToolCalls(String, Vec<MessageToolCall>),
    Fail(ProviderError),
    /// Never answers; used to exercise cancellation and timeouts
    Hang,
}

/// A provider that plays back replies in order, streaming text in small
/// chunks. Running out of replies is a provider error, not a panic, so an
/// engine test that over-calls shows up as a failed node.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl ScriptedProvider {
    pub const CHUNK_CHARS: usize = 7;

    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn then_text(self, text: &str) -> Self {
        self.push(Reply::Text(text.into()))
    }

    pub fn then_tool_calls(self, text: &str, calls: Vec<MessageToolCall>) -> Self {
        self.push(Reply::ToolCalls(text.into(), calls))
    }

    pub fn then_error(self, error: ProviderError) -> Self {
        self.push(Reply::Fail(error))
    }

    pub fn then_hang(self) -> Self {
        self.push(Reply::Hang)
    }

    fn push(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    /// Shared handle on every request seen so far.
    pub fn requests(&self) -> Arc<Mutex<Vec<ProviderRequest>>> {
        self.requests.clone()
    }

    /// A router whose default provider is `provider`.
    pub fn router(provider: ScriptedProvider) -> ProviderRouter {
        let mut router = ProviderRouter::new("scripted");
        router.register("scripted", Arc::new(provider));
        router
    }

    fn next_reply(&self, request: ProviderRequest) -> Reply {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Reply::Fail(ProviderError::StreamInterrupted("script exhausted".into()))
            })
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_reply(request) {
            Reply::Text(text) => Ok(response(Message::assistant(text))),
            Reply::ToolCalls(text, calls) => {
                Ok(response(Message::assistant_with_tools(text, calls)))
            }
            Reply::Fail(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let (text, calls) = match self.next_reply(request) {
            Reply::Text(text) => (text, Vec::new()),
            Reply::ToolCalls(text, calls) => (text, calls),
            Reply::Fail(e) => return Err(e),
            Reply::Hang => std::future::pending().await,
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let chars: Vec<char> = text.chars().collect();
            for piece in chars.chunks(Self::CHUNK_CHARS) {
                let chunk = StreamChunk {
                    content: Some(piece.iter().collect()),
                    tool_calls: vec![],
                    done: false,
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    content: None,
                    tool_calls: calls,
                    done: true,
                    usage: None,
                }))
                .await;
        });
        Ok(rx)
    }
}

fn response(message: Message) -> ProviderResponse {
    ProviderResponse {
        message,
        usage: None,
        model: "mock-model".into(),
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}
