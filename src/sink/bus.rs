//! Message-bus publisher.
//!
//! Binds a TCP socket and broadcasts one newline-terminated line per record
//! to every connected subscriber. There is no handshake, acknowledgement or
//! replay, and slow subscribers skip what they missed. Subscribers read
//! plain lines; this is not a ZeroMQ endpoint. Publishing with no subscriber
//! connected is not an error.

use super::RecordSink;
use crate::error::SinkError;
use crate::record::CompletedRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcast buffer depth; two records per round.
const CHANNEL_CAPACITY: usize = 64;

/// Wire format of published records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusFormat {
    /// `YYYY-MM-DD,HH:MM,f1,f2,f3`
    #[default]
    Csv,
    /// JSON object tagged with the controller id.
    Json,
}

/// TCP broadcast publisher.
pub struct BusPublisher {
    local_addr: SocketAddr,
    format: BusFormat,
    controller_id: String,
    sender: broadcast::Sender<String>,
    accept_task: JoinHandle<()>,
}

impl BusPublisher {
    /// Bind `addr` and start accepting subscribers.
    pub async fn bind(
        addr: &str,
        format: BusFormat,
        controller_id: impl Into<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        let accept_task = tokio::spawn(accept_loop(listener, sender.clone()));
        tracing::info!(addr = %local_addr, ?format, "Bus publisher listening");

        Ok(Self {
            local_addr,
            format,
            controller_id: controller_id.into(),
            sender,
            accept_task,
        })
    }

    /// Address subscribers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Fire-and-forget publish of one message.
    pub fn publish(&self, message: String) {
        if self.sender.send(message).is_err() {
            tracing::trace!("No bus subscribers connected, message discarded");
        }
    }

    fn render(&self, record: &CompletedRecord) -> Result<String, SinkError> {
        Ok(match self.format {
            BusFormat::Csv => record.to_line(),
            BusFormat::Json => record.to_json(&self.controller_id)?,
        })
    }
}

async fn accept_loop(listener: TcpListener, sender: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "Bus subscriber connected");
                tokio::spawn(serve_subscriber(stream, peer, sender.subscribe()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept bus subscriber");
            }
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut receiver: broadcast::Receiver<String>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let mut line = message.into_bytes();
                line.push(b'\n');
                if let Err(e) = stream.write_all(&line).await {
                    tracing::info!(%peer, error = %e, "Bus subscriber disconnected");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%peer, skipped, "Bus subscriber lagging, messages skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[async_trait]
impl RecordSink for BusPublisher {
    fn name(&self) -> &str {
        "bus"
    }

    async fn emit(&mut self, record: &CompletedRecord) -> Result<(), SinkError> {
        let message = self.render(record)?;
        self.publish(message);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), SinkError> {
        self.accept_task.abort();
        tracing::info!(addr = %self.local_addr, "Bus publisher shut down");
        Ok(())
    }
}

impl Drop for BusPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
