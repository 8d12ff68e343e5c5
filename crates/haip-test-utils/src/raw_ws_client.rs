use futures_util::{SinkExt, StreamExt};
use haip_protocol::{Envelope, codec};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One frame as the peer sees it.
#[derive(Debug)]
pub enum RawFrame {
    Envelope(Envelope),
    Binary(Vec<u8>),
}

/// Thin WebSocket wrapper for protocol tests.  Unlike the client crate it
/// never answers HAIP pings or validates anything, so tests can exercise the
/// engine's error paths with arbitrary text.
pub struct RawWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl RawWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn connect_with_token(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Self::connect(&format!("{url}?token={token}")).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn send_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_text(&codec::encode_envelope(envelope)).await
    }

    pub async fn send_binary(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Binary(bytes.to_vec().into()))
            .await?;
        Ok(())
    }

    /// Next protocol frame, skipping transport ping/pong.
    pub async fn recv_frame(&mut self) -> Result<RawFrame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(RawFrame::Envelope(codec::parse_envelope(text.as_str())?));
                }
                Some(Ok(Message::Binary(bytes))) => return Ok(RawFrame::Binary(bytes.to_vec())),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Next envelope, skipping binary frames.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            if let RawFrame::Envelope(envelope) = self.recv_frame().await? {
                return Ok(envelope);
            }
        }
    }

    pub async fn recv_envelope_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        tokio::time::timeout(timeout, self.recv_envelope())
            .await
            .map_err(|_| "timed out waiting for envelope")?
    }

    /// Receives until `matches` accepts an envelope, discarding everything
    /// else (server heartbeats included).  Errors out at the deadline.
    pub async fn recv_until<F>(
        &mut self,
        timeout: Duration,
        mut matches: F,
    ) -> Result<Envelope, Box<dyn std::error::Error>>
    where
        F: FnMut(&Envelope) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or("timed out waiting for matching envelope")?;
            let envelope = self.recv_envelope_timeout(remaining).await?;
            if matches(&envelope) {
                return Ok(envelope);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
