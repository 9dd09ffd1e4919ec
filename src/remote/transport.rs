use crate::remote::{
    ClientMessage, JobPayload, RemoteConfig, RemoteError, ServerMessage, StatusEvent,
};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// A live connection to the job service's status channel.
#[allow(async_fn_in_trait)]
pub trait JobConnection {
    /// Sends a blocking request and waits for the service to accept it. The returned event
    /// names the job that later events on this connection are matched against.
    async fn submit(&mut self, payload: &JobPayload) -> Result<StatusEvent, RemoteError>;

    /// The next status event, or `None` once the service has closed the connection.
    async fn next_event(&mut self) -> Result<Option<StatusEvent>, RemoteError>;

    async fn close(&mut self) -> Result<(), RemoteError>;
}

/// A streamed result blob.
#[allow(async_fn_in_trait)]
pub trait ResultDownload {
    /// Size declared by the service, used for progress reporting.
    fn total_len(&self) -> Option<u64>;

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError>;
}

#[allow(async_fn_in_trait)]
pub trait JobTransport {
    type Connection: JobConnection;
    type Download: ResultDownload;

    async fn connect(&self) -> Result<Self::Connection, RemoteError>;

    /// Non-blocking submission. Returns the first status of the new job.
    async fn submit(&self, payload: &JobPayload) -> Result<StatusEvent, RemoteError>;

    async fn status(&self, id: &str) -> Result<StatusEvent, RemoteError>;

    async fn download(&self, id: &str) -> Result<Self::Download, RemoteError>;
}

fn connection_error(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Connection(err.to_string())
}

/// Websocket status channel plus HTTP endpoints of a job service.
#[derive(Debug, Clone)]
pub struct NetworkTransport {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl NetworkTransport {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.wait_timeout())
            .build()
            .map_err(connection_error)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, RemoteError> {
        let url = self.config.http_url(path);
        let response = self.client.get(&url).send().await.map_err(connection_error)?;
        if !response.status().is_success() {
            return Err(RemoteError::Protocol(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

impl JobTransport for NetworkTransport {
    type Connection = WsConnection;
    type Download = NetworkDownload;

    async fn connect(&self) -> Result<WsConnection, RemoteError> {
        let url = self.config.ws_url();
        let attempts = self.config.reconnection_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.wait_timeout(), connect_async(&url)).await {
                Ok(Ok((stream, _))) => {
                    log::debug!("Connected to {url} on attempt {attempt}");
                    return Ok(WsConnection { stream });
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.config.wait_timeout());
                }
            }
            log::warn!("Connecting to {url} failed (attempt {attempt}/{attempts}): {last_error}");
            if attempt < attempts {
                tokio::time::sleep(self.config.reconnection_delay()).await;
            }
        }
        Err(RemoteError::Connection(format!(
            "could not reach {url} after {attempts} attempts: {last_error}"
        )))
    }

    async fn submit(&self, payload: &JobPayload) -> Result<StatusEvent, RemoteError> {
        let url = self.config.http_url("/request");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(connection_error)?;
        if !response.status().is_success() {
            return Err(RemoteError::Protocol(format!(
                "POST {url} returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(connection_error)
    }

    async fn status(&self, id: &str) -> Result<StatusEvent, RemoteError> {
        self.get(&format!("/response/{id}"))
            .await?
            .json()
            .await
            .map_err(connection_error)
    }

    async fn download(&self, id: &str) -> Result<NetworkDownload, RemoteError> {
        let response = self.get(&format!("/result/{id}")).await?;
        let total = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(NetworkDownload { total, stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    async fn next_message(&mut self) -> Result<Option<ServerMessage>, RemoteError> {
        while let Some(msg) = self.stream.next().await {
            match msg.map_err(connection_error)? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(|err| RemoteError::Protocol(err.to_string()));
                }
                Message::Close(_) => return Ok(None),
                Message::Binary(_) => {
                    return Err(RemoteError::Protocol("unexpected binary frame".to_string()));
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

impl JobConnection for WsConnection {
    async fn submit(&mut self, payload: &JobPayload) -> Result<StatusEvent, RemoteError> {
        let json = serde_json::to_string(&ClientMessage::BlockingRequest(payload.clone()))?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(connection_error)?;
        loop {
            match self.next_message().await? {
                Some(ServerMessage::BlockingAccepted(event)) => return Ok(event),
                Some(ServerMessage::BlockingResponse(event)) => {
                    log::debug!("Ignoring status of unrelated job {}", event.id);
                }
                None => {
                    return Err(RemoteError::Connection(
                        "job service closed the connection before accepting the job".to_string(),
                    ));
                }
            }
        }
    }

    async fn next_event(&mut self) -> Result<Option<StatusEvent>, RemoteError> {
        Ok(self.next_message().await?.map(|message| match message {
            ServerMessage::BlockingAccepted(event) | ServerMessage::BlockingResponse(event) => {
                event
            }
        }))
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(connection_error(err)),
        }
    }
}

pub struct NetworkDownload {
    total: Option<u64>,
    stream: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
}

impl ResultDownload for NetworkDownload {
    fn total_len(&self) -> Option<u64> {
        self.total
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.stream.next().await.transpose().map_err(connection_error)
    }
}
