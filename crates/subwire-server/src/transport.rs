//! Adapters between WebSocket library messages and session [`Frame`]s.
//!
//! Text frames carry protocol messages and close frames carry the close code.
//! Binary frames are read as (lossy) UTF-8 text so a malformed payload fails
//! the session the same way bad text does. Control frames are answered by the
//! WebSocket library and never reach the session.

use axum::extract::ws::{self, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use subwire_core::{CloseCode, Frame, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame as WsCloseFrame};

// ── axum (responder) ────────────────────────────────────────────────────────

fn from_axum(message: Result<ws::Message, axum::Error>) -> Option<Result<Frame, TransportError>> {
    match message {
        Ok(ws::Message::Text(text)) => Some(Ok(Frame::text(text.as_str()))),
        Ok(ws::Message::Binary(bytes)) => Some(Ok(Frame::text(String::from_utf8_lossy(&bytes)))),
        Ok(ws::Message::Close(Some(close))) => Some(Ok(Frame::close(
            CloseCode(close.code),
            close.reason.as_str(),
        ))),
        Ok(ws::Message::Close(None)) => Some(Ok(Frame::Close(None))),
        Ok(ws::Message::Ping(_) | ws::Message::Pong(_)) => None,
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}

fn to_axum(frame: Frame) -> ws::Message {
    match frame {
        Frame::Text(text) => ws::Message::Text(text.into()),
        Frame::Close(Some(close)) => ws::Message::Close(Some(ws::CloseFrame {
            code: close.code.as_u16(),
            reason: close.reason.into(),
        })),
        Frame::Close(None) => ws::Message::Close(None),
    }
}

/// Split an upgraded axum socket into session halves.
pub fn axum_frames(
    socket: WebSocket,
) -> (
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
    impl Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let stream = stream.filter_map(|message| future::ready(from_axum(message)));
    let sink = sink
        .sink_map_err(|e| TransportError::Io(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_axum(frame))));
    (stream, sink)
}

// ── tokio-tungstenite (initiator) ───────────────────────────────────────────

fn from_tungstenite(
    message: Result<tungstenite::Message, tungstenite::Error>,
) -> Option<Result<Frame, TransportError>> {
    match message {
        Ok(tungstenite::Message::Text(text)) => Some(Ok(Frame::text(text.as_str()))),
        Ok(tungstenite::Message::Binary(bytes)) => {
            Some(Ok(Frame::text(String::from_utf8_lossy(&bytes))))
        }
        Ok(tungstenite::Message::Close(Some(close))) => Some(Ok(Frame::close(
            CloseCode(u16::from(close.code)),
            close.reason.as_str(),
        ))),
        Ok(tungstenite::Message::Close(None)) => Some(Ok(Frame::Close(None))),
        Ok(
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_),
        ) => None,
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
            Some(Err(TransportError::Closed))
        }
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}

fn to_tungstenite(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Close(Some(close)) => tungstenite::Message::Close(Some(WsCloseFrame {
            code: close.code.as_u16().into(),
            reason: close.reason.into(),
        })),
        Frame::Close(None) => tungstenite::Message::Close(None),
    }
}

fn sink_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        e => TransportError::Io(e.to_string()),
    }
}

/// Split a client WebSocket into session halves.
pub fn tungstenite_frames<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
    impl Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = socket.split();
    let stream = stream.filter_map(|message| future::ready(from_tungstenite(message)));
    let sink = sink
        .sink_map_err(sink_error)
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_tungstenite(frame))));
    (stream, sink)
}
