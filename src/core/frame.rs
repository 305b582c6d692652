use bytes::Bytes;

/// Transport-neutral websocket frame.
///
/// Transports convert their native frame representation into/from `WsFrame`; the sync layer
/// only ever reads text/binary payloads and treats everything else as liveness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsFrame {
    /// Wrap an already-serialized JSON document as a text frame.
    #[inline]
    pub fn json(payload: impl Into<Bytes>) -> Self {
        Self::Text(payload.into())
    }

    #[inline]
    pub fn close(code: u16, reason: Bytes) -> Self {
        Self::Close(Some(WsCloseFrame { code, reason }))
    }

    /// Payload carrying application data, if any.
    #[inline]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => None,
        }
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, WsFrame::Close(_))
    }
}

/// Borrow the underlying bytes from frames without allocation.
#[inline]
pub fn frame_bytes(frame: &WsFrame) -> Option<&[u8]> {
    match frame {
        WsFrame::Text(bytes) => Some(bytes.as_ref()),
        WsFrame::Binary(bytes) => Some(bytes.as_ref()),
        WsFrame::Ping(bytes) => Some(bytes.as_ref()),
        WsFrame::Pong(bytes) => Some(bytes.as_ref()),
        WsFrame::Close(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_text_and_binary_carry_data() {
        assert_eq!(WsFrame::json("{}").data(), Some(&b"{}"[..]));
        assert_eq!(WsFrame::Binary(Bytes::from_static(b"x")).data(), Some(&b"x"[..]));
        assert_eq!(WsFrame::Ping(Bytes::from_static(b"p")).data(), None);
        assert!(WsFrame::close(1000, Bytes::new()).is_close());
        assert_eq!(frame_bytes(&WsFrame::Pong(Bytes::from_static(b"p"))), Some(&b"p"[..]));
    }
}
