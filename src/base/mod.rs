//! # Base Module - TCP endpoint for radio Bases
//!
//! Bases bridge the radio network to the gateway. Each one connects over TCP,
//! introduces itself with `{"base-name": "<name>"}` and then streams JSON objects in
//! both directions. Connections run in their own tasks and talk to the gateway loop
//! only through [`BaseEvent`]s, so all state stays with the gateway.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sensorino::base::{serve, BaseEvent};
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:8001").await?;
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! tokio::spawn(serve(listener, tx, 64 * 1024));
//! while let Some(event) = rx.recv().await {
//!     if let BaseEvent::Registered { ack, .. } = event {
//!         let _ = ack.send(true);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::errors::TransportError;
use crate::logutil::escape_line;
use crate::protocol::framer::ObjectFramer;

pub const BASE_NAME_FIELD: &str = "base-name";

const READ_CHUNK: usize = 8192;

/// What a connection task reports to the gateway loop.
#[derive(Debug)]
pub enum BaseEvent {
    /// Handshake completed. The gateway answers on `ack`; `false` rejects the name
    /// and closes the connection.
    Registered {
        name: String,
        outbound: mpsc::UnboundedSender<String>,
        ack: oneshot::Sender<bool>,
    },
    /// One framed object received from a registered Base.
    Object { base: String, raw: String },
    Disconnected { name: String },
}

/// Sending side of the Base connections, as seen by the gateway.
pub trait Transport {
    /// Queue one JSON line for the named Base.
    fn send_json(&mut self, base: &str, line: &str) -> Result<(), TransportError>;

    /// Connected Base names in registration order.
    fn bases(&self) -> Vec<String>;

    fn first_base(&self) -> Option<String> {
        self.bases().into_iter().next()
    }
}

/// Registered Bases keyed by name, in registration order.
#[derive(Debug, Default)]
pub struct BaseRegistry {
    bases: Vec<(String, mpsc::UnboundedSender<String>)>,
}

impl BaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<(), TransportError> {
        if self.contains(name) {
            return Err(TransportError::DuplicateBase(name.to_string()));
        }
        self.bases.push((name.to_string(), outbound));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.bases.len();
        self.bases.retain(|(n, _)| n != name);
        self.bases.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bases.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

impl Transport for BaseRegistry {
    fn send_json(&mut self, base: &str, line: &str) -> Result<(), TransportError> {
        let (_, tx) = self
            .bases
            .iter()
            .find(|(n, _)| n == base)
            .ok_or_else(|| TransportError::UnknownBase(base.to_string()))?;
        tx.send(line.to_string())
            .map_err(|_| TransportError::Closed(base.to_string()))
    }

    fn bases(&self) -> Vec<String> {
        self.bases.iter().map(|(n, _)| n.clone()).collect()
    }
}

/// The Base name announced by a handshake object, if any.
pub fn parse_base_name(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let name = value.as_object()?.get(BASE_NAME_FIELD)?.as_str()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Accept Base connections until the listener fails or the gateway goes away.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::UnboundedSender<BaseEvent>,
    max_object: usize,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for Bases on {}", addr);
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        if events.is_closed() {
            return Ok(());
        }
        debug!("Base connection from {}", peer);
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, events, max_object).await {
                warn!("Base connection {} closed with error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<BaseEvent>,
    max_object: usize,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut framer = ObjectFramer::new(max_object);
    let mut buf = vec![0u8; READ_CHUNK];

    // Handshake: the first complete object names the Base
    let hello = loop {
        if let Some(obj) = framer.next_object() {
            break obj;
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("connection closed before handshake"));
        }
        framer.push(&buf[..n]);
    };
    let Some(name) = parse_base_name(&hello) else {
        return Err(anyhow!("bad handshake: {}", escape_line(&hello)));
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (ack_tx, ack_rx) = oneshot::channel();
    events
        .send(BaseEvent::Registered {
            name: name.clone(),
            outbound: outbound_tx,
            ack: ack_tx,
        })
        .map_err(|_| anyhow!("gateway is gone"))?;
    if !ack_rx.await.unwrap_or(false) {
        return Err(anyhow!("Base name '{}' rejected", name));
    }
    info!("Base '{}' registered from {}", name, peer);

    let result = run_session(
        &name,
        &mut reader,
        &mut writer,
        &mut framer,
        &mut buf,
        &events,
        &mut outbound_rx,
    )
    .await;

    let _ = events.send(BaseEvent::Disconnected { name: name.clone() });
    info!("Base '{}' disconnected", name);
    result
}

async fn run_session(
    name: &str,
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    framer: &mut ObjectFramer,
    buf: &mut [u8],
    events: &mpsc::UnboundedSender<BaseEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    loop {
        // Objects that arrived together with the handshake, or in one read
        while let Some(raw) = framer.next_object() {
            events
                .send(BaseEvent::Object {
                    base: name.to_string(),
                    raw,
                })
                .map_err(|_| anyhow!("gateway is gone"))?;
        }

        tokio::select! {
            read = reader.read(buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                framer.push(&buf[..n]);
            }
            line = outbound.recv() => {
                let Some(line) = line else {
                    // Registry dropped us
                    return Ok(());
                };
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
    }
}
