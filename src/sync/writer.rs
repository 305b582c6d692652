use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::debug;

use crate::core::{SyncError, SyncResult, WsFrame};

/// Owns the write half of one push-channel connection and serializes writes.
///
/// A fresh writer is spawned per connection; the shutdown flag makes writes queued behind a
/// teardown fail instead of reaching a socket that is being closed.
pub struct FrameWriter<W>
where
    W: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
    frames_written: u64,
}

impl<W> FrameWriter<W>
where
    W: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static,
{
    pub fn new(writer: W, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            shutdown_rx,
            frames_written: 0,
        }
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *self.shutdown_rx.borrow() {
            return Err(SyncError::InvalidState("writer stopped".to_string()));
        }
        Ok(())
    }
}

impl<W> Actor for FrameWriter<W>
where
    W: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static,
{
    type Args = Self;
    type Error = SyncError;

    fn name() -> &'static str {
        "FrameWriter"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: kameo::actor::WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> Result<(), Self::Error> {
        if let Err(err) = self.writer.close().await {
            debug!(error = %err, frames = self.frames_written, "push channel writer close failed");
        }
        Ok(())
    }
}

pub struct WriteFrame {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriteFrame> for FrameWriter<W>
where
    W: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.ensure_open()?;
        self.writer.send(msg.frame).await?;
        self.frames_written = self.frames_written.saturating_add(1);
        Ok(())
    }
}

/// Several frames flushed together (room re-joins after a reconnect).
pub struct WriteBatch {
    pub frames: Vec<WsFrame>,
}

impl<W> KameoMessage<WriteBatch> for FrameWriter<W>
where
    W: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: WriteBatch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.ensure_open()?;
        let count = msg.frames.len() as u64;
        for frame in msg.frames {
            self.writer.feed(frame).await?;
        }
        self.writer.flush().await?;
        self.frames_written = self.frames_written.saturating_add(count);
        Ok(())
    }
}
