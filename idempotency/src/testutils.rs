use crate::engine::{AcquireReply, Completion, ScriptEngine, StoreError};
use crate::errors::GatewayError;
use async_trait::async_trait;
use hyper::body::{Body, Bytes, Frame};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Engine whose store is unreachable.
pub struct FailingEngine;

fn unreachable_store() -> StoreError {
    StoreError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl ScriptEngine for FailingEngine {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn acquire(
        &self,
        _slot_key: &str,
        _processing: &str,
        _fingerprint: &str,
        _ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        Err(unreachable_store())
    }

    async fn complete(
        &self,
        _slot_key: &str,
        _completion: Completion<'_>,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(unreachable_store())
    }

    async fn delete(&self, _slot_key: &str) -> Result<(), StoreError> {
        Err(unreachable_store())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(unreachable_store())
    }
}

/// Engine whose calls never return.
pub struct StallingEngine;

#[async_trait]
impl ScriptEngine for StallingEngine {
    fn name(&self) -> &'static str {
        "stalling"
    }

    async fn acquire(
        &self,
        _slot_key: &str,
        _processing: &str,
        _fingerprint: &str,
        _ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        std::future::pending().await
    }

    async fn complete(
        &self,
        _slot_key: &str,
        _completion: Completion<'_>,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        std::future::pending().await
    }

    async fn delete(&self, _slot_key: &str) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

/// Body that yields each chunk as its own data frame.
pub struct ChunkedBody {
    chunks: VecDeque<Result<Bytes, GatewayError>>,
}

impl ChunkedBody {
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'static str>,
    {
        ChunkedBody {
            chunks: chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect(),
        }
    }

    pub fn from_results(chunks: Vec<Result<Bytes, GatewayError>>) -> Self {
        ChunkedBody {
            chunks: chunks.into(),
        }
    }
}

impl Body for ChunkedBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, GatewayError>>> {
        Poll::Ready(self.get_mut().chunks.pop_front().map(|c| c.map(Frame::data)))
    }
}

/// Body fed from a channel; ends when the sender is dropped.
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    pub fn new() -> (mpsc::Sender<Bytes>, ChannelBody) {
        let (tx, rx) = mpsc::channel(8);
        (tx, ChannelBody { rx })
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, GatewayError>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

/// Yields to spawned tasks until `condition` holds.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
