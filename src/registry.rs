//! Which client owns which token.
//!
//! The [`Registry`] is the only owner of the token to connection table. All
//! lifecycle transitions go through its operations, which hold the table lock
//! for their whole duration. Lock order is registry table, then a
//! connection's pending table.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use n0_error::{e, stack_error};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    channel::{ChannelHandle, ChannelId},
    error::{ExchangeError, Failure},
    frame::{Frame, FrameKind, Side},
    mux::{ExchangeHandle, Multiplexer, RequestDescriptor},
};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Connecting,
    Identified,
    Disconnected,
}

/// What a client tells about itself when identifying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    /// Snapshot of the client's accept rules.
    #[serde(default)]
    pub filters: serde_json::Value,
}

/// Payload of the identify frame, the first frame a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub metadata: Metadata,
}

impl Identify {
    pub fn to_frame(&self) -> Frame {
        // serializing string and json value fields cannot fail
        let payload = serde_json::to_vec(self).unwrap_or_default();
        Frame::identify(payload)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, RegistryError> {
        if frame.kind != FrameKind::Identify {
            return Err(e!(RegistryError::NotIdentify { kind: frame.kind }));
        }
        serde_json::from_slice(&frame.payload)
            .map_err(|source| e!(RegistryError::InvalidIdentify { source }))
    }
}

#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("channel {id} is not registered")]
    UnknownChannel { id: ChannelId },
    #[error("channel {id} already identified")]
    AlreadyIdentified { id: ChannelId },
    #[error("expected identify frame, got {kind:?}")]
    NotIdentify { kind: FrameKind },
    #[error("invalid identify payload")]
    InvalidIdentify {
        #[error(source, std_err)]
        source: serde_json::Error,
    },
    #[error("identify carries an empty token")]
    EmptyToken,
}

/// One client's channel plus what it identified as.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    mux: Multiplexer,
    identity: OnceLock<Identify>,
    connected_at: SystemTime,
}

impl Connection {
    pub(crate) fn new(side: Side, channel: ChannelHandle) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                mux: Multiplexer::new(side, channel),
                identity: OnceLock::new(),
                connected_at: SystemTime::now(),
            }),
        }
    }

    /// Records the identity and moves to identified.
    ///
    /// Used directly by the client side, where no registry is involved.
    pub(crate) fn mark_identified(&self, identify: Identify) -> Result<(), RegistryError> {
        let id = self.channel_id();
        self.inner
            .identity
            .set(identify)
            .map_err(|_| e!(RegistryError::AlreadyIdentified { id }))?;
        if self.inner.mux.set_identified() {
            Ok(())
        } else {
            Err(e!(RegistryError::UnknownChannel { id }))
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.mux.channel().id()
    }

    pub fn channel(&self) -> &ChannelHandle {
        self.inner.mux.channel()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    pub fn token(&self) -> Option<&str> {
        self.inner.identity.get().map(|i| i.token.as_str())
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.inner.identity.get().map(|i| &i.metadata)
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.mux.liveness()
    }

    pub fn connected_at(&self) -> SystemTime {
        self.inner.connected_at
    }

    /// Starts an exchange on this connection.
    pub fn send(
        &self,
        request: RequestDescriptor,
        deadline: Instant,
    ) -> Result<ExchangeHandle, ExchangeError> {
        self.inner.mux.send(request, deadline)
    }

    /// Fails pending exchanges and closes the channel.
    pub(crate) fn terminate(&self, failure: Failure) {
        let failed = self.inner.mux.disconnect(failure);
        self.channel().close();
        debug!(channel=%self.channel_id(), failed, "connection terminated");
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            token: self.token().map(ToOwned::to_owned),
            metadata: self.metadata().cloned(),
            liveness: self.liveness(),
            channel_open: self.channel().is_open(),
            connected_at: self
                .inner
                .connected_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Diagnostic view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub token: Option<String>,
    pub metadata: Option<Metadata>,
    pub liveness: Liveness,
    pub channel_open: bool,
    /// Seconds since the unix epoch.
    pub connected_at: u64,
}

/// Token to connection table shared by every channel of a server.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    by_channel: HashMap<ChannelId, Connection>,
    by_token: HashMap<String, ChannelId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a freshly connected channel in the connecting state.
    ///
    /// The token is not known until the client identifies.
    pub fn register(&self, channel: ChannelHandle) -> Connection {
        let connection = Connection::new(Side::Server, channel);
        debug!(channel=%connection.channel_id(), "register connection");
        self.lock()
            .by_channel
            .insert(connection.channel_id(), connection.clone());
        connection
    }

    /// Promotes the channel's connection to identified under `identify.token`.
    ///
    /// A previous connection holding the same token is superseded: its pending
    /// exchanges fail and its channel closes.
    pub fn identify(
        &self,
        channel: ChannelId,
        identify: Identify,
    ) -> Result<Connection, RegistryError> {
        if identify.token.is_empty() {
            return Err(e!(RegistryError::EmptyToken));
        }
        let mut tables = self.lock();
        let connection = tables
            .by_channel
            .get(&channel)
            .cloned()
            .ok_or_else(|| e!(RegistryError::UnknownChannel { id: channel }))?;
        let token = identify.token.clone();
        connection.mark_identified(identify)?;
        if let Some(previous) = tables.by_token.insert(token.clone(), channel)
            && previous != channel
            && let Some(previous) = tables.by_channel.remove(&previous)
        {
            info!(%token, old=%previous.channel_id(), new=%channel, "connection superseded");
            previous.terminate(Failure::Superseded);
        }
        info!(%token, %channel, "client identified");
        Ok(connection)
    }

    /// Finds the identified connection for `token`.
    pub fn lookup(&self, token: &str) -> Option<Connection> {
        let tables = self.lock();
        let channel = tables.by_token.get(token)?;
        tables
            .by_channel
            .get(channel)
            .filter(|c| c.liveness() == Liveness::Identified)
            .cloned()
    }

    /// Removes the channel's connection and fails its pending exchanges.
    ///
    /// A stale channel that was already superseded leaves the table untouched.
    pub fn disconnect(&self, channel: ChannelId) -> Option<Connection> {
        let mut tables = self.lock();
        let connection = tables.by_channel.remove(&channel)?;
        if let Some(token) = connection.token()
            && tables.by_token.get(token) == Some(&channel)
        {
            tables.by_token.remove(token);
        }
        connection.terminate(Failure::Lost);
        info!(%channel, token=?connection.token(), "client disconnected");
        Some(connection)
    }

    /// Summaries of every tracked connection.
    pub fn list(&self) -> Vec<ConnectionSummary> {
        self.lock()
            .by_channel
            .values()
            .map(Connection::summary)
            .collect()
    }
}
