use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{SyncError, SyncResult, WebSocketBufferConfig, WsFrame};

pub mod tungstenite;

pub type ConnectFuture<R, W> = Pin<Box<dyn Future<Output = SyncResult<(R, W)>> + Send>>;

/// Transport boundary for the push channel.
///
/// The connection actor owns lifecycle and policy; a transport only opens a socket and hands
/// back its read and write halves. Tests swap in `testing::MockTransport`.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = SyncResult<WsFrame>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = SyncError> + Send + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> ConnectFuture<Self::Reader, Self::Writer>;
}
