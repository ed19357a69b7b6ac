// UpstreamConnector - opens the provider socket and exposes it as a pair of channels

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::RelayError;
use crate::settings::UpstreamSettings;

/// One frame received from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Text(String),
    /// The socket is gone. `code` is `None` when no close frame arrived (1006).
    Closed { code: Option<u16>, reason: String },
}

/// An open provider connection.
///
/// Dropping `outbound` closes the socket with a normal close frame.
pub struct UpstreamLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<UpstreamFrame>,
}

/// Opens connections to the transcription provider
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<UpstreamLink, RelayError>;
}

/// Realtime provider connection over tokio-tungstenite
pub struct WebSocketConnector {
    url: String,
    api_key: Option<String>,
    beta_header: String,
    outbound_buffer: usize,
}

impl WebSocketConnector {
    pub fn new(settings: &UpstreamSettings, api_key: Option<String>) -> Self {
        Self {
            url: settings.url.clone(),
            api_key,
            beta_header: settings.beta_header.clone(),
            outbound_buffer: settings.outbound_buffer.max(1),
        }
    }

    fn build_request(&self) -> Result<tungstenite::handshake::client::Request, RelayError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::UpstreamAuth("OPENAI_API_KEY is not set".to_string()))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::UpstreamConnect(format!("Invalid upstream url: {}", e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| RelayError::UpstreamAuth(format!("Invalid API key header: {}", e)))?;
        let beta = HeaderValue::from_str(&self.beta_header)
            .map_err(|e| RelayError::UpstreamConnect(format!("Invalid beta header: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("OpenAI-Beta", beta);

        Ok(request)
    }
}

/// 401/403 on the upgrade means retrying with the same key is pointless
fn is_auth_rejection(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => matches!(resp.status().as_u16(), 401 | 403),
        _ => false,
    }
}

#[async_trait]
impl UpstreamConnector for WebSocketConnector {
    async fn connect(&self) -> Result<UpstreamLink, RelayError> {
        let request = self.build_request()?;

        log::info!("UpstreamConnector: Connecting to {}", self.url);
        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                if is_auth_rejection(&e) {
                    RelayError::UpstreamAuth(e.to_string())
                } else {
                    RelayError::UpstreamConnect(e.to_string())
                }
            })?;
        log::debug!("UpstreamConnector: Upgrade status {}", response.status());

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.outbound_buffer);
        let (in_tx, in_rx) = mpsc::channel::<UpstreamFrame>(self.outbound_buffer);

        // Writer: runs until every sender is dropped, then closes cleanly
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::warn!("UpstreamConnector: Send failed: {}", e);
                    return;
                }
            }
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: String::from("client closing").into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
        });

        // Reader: always ends with exactly one Closed frame
        tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(UpstreamFrame::Text(text.as_str().to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => UpstreamFrame::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_string(),
                            },
                            None => UpstreamFrame::Closed {
                                code: None,
                                reason: "closed without frame".to_string(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break UpstreamFrame::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break UpstreamFrame::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = in_tx.send(closed).await;
        });

        Ok(UpstreamLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_auth_and_beta_headers() {
        let connector = WebSocketConnector::new(&UpstreamSettings::default(), Some("sk-test".into()));
        let request = connector.build_request().unwrap();

        assert_eq!(request.headers()[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(request.headers()["OpenAI-Beta"], "realtime=v1");
        assert_eq!(request.uri().host(), Some("api.openai.com"));
        assert_eq!(request.uri().query(), Some("intent=transcription"));
    }

    #[test]
    fn test_missing_key_is_auth_error() {
        let connector = WebSocketConnector::new(&UpstreamSettings::default(), None);
        assert!(matches!(connector.build_request(), Err(RelayError::UpstreamAuth(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let mut settings = UpstreamSettings::default();
        settings.url = "ws://127.0.0.1:1/realtime".to_string();
        let connector = WebSocketConnector::new(&settings, Some("sk-test".into()));

        let result = connector.connect().await;
        assert!(matches!(result, Err(RelayError::UpstreamConnect(_))));
    }
}
