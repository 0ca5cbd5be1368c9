use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use iroh::{
    endpoint::{Connection, ConnectionError},
    protocol::{AcceptError, ProtocolHandler},
};
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr};
use n0_future::StreamExt;
use tokio_util::{codec::FramedRead, future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, instrument, warn};

use crate::{
    channel::{ChannelHandle, Dispatch, run_session},
    forward::{Forwarder, Pipeline, PipelineOpts},
    frame::{FrameCodec, Side},
    gateway::{GatewayOpts, IngressGateway, TokenPath},
    registry::{Identify, Registry},
};

/// ALPN of the broker tunnel protocol.
pub const ALPN: &[u8] = b"iroh-broker/0";

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for a [`BrokerServer`].
#[derive(Debug, Clone)]
pub struct ServerOpts {
    /// How long a new connection may take to identify.
    pub identify_timeout: Duration,
    /// Pipeline serving requests that clients send to the server side.
    pub pipeline: PipelineOpts,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            identify_timeout: Duration::from_secs(10),
            pipeline: Default::default(),
        }
    }
}

/// Accepts client connections and tracks them in a [`Registry`].
///
/// Implements [`ProtocolHandler`] for use with iroh's [`Router`](iroh::protocol::Router):
///
/// ```ignore
/// let server = BrokerServer::new(Registry::new(), ServerOpts::default())?;
/// let gateway = server.gateway(GatewayOpts::default());
/// let router = Router::builder(endpoint).accept(ALPN, server).spawn();
/// gateway.serve(listener).await?;
/// ```
#[derive(Debug)]
pub struct BrokerServer {
    registry: Registry,
    pipeline: Pipeline,
    identify_timeout: Duration,
    conn_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ProtocolHandler for BrokerServer {
    #[instrument("accept", level="error", skip_all, fields(id=self.conn_id.fetch_add(1, Ordering::SeqCst)))]
    async fn accept(&self, connection: Connection) -> std::result::Result<(), AcceptError> {
        debug!(remote_id=%connection.remote_id().fmt_short(), "accepted connection");
        let res = self
            .tasks
            .track_future(self.handle_connection(&connection))
            .await;
        connection.close(0u32.into(), b"");
        res.map_err(AcceptError::from_err)
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} open sessions)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all sessions closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all sessions closed in time, abort"
            ),
        }
    }
}

impl BrokerServer {
    pub fn new(registry: Registry, opts: ServerOpts) -> Result<Self> {
        Ok(Self {
            registry,
            pipeline: Pipeline::new(opts.pipeline)?,
            identify_timeout: opts.identify_timeout,
            conn_id: Default::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gateway relaying `/broker/{token}/...` calls to the clients of this server.
    pub fn gateway(&self, opts: GatewayOpts) -> IngressGateway {
        IngressGateway::new(TokenPath::new(self.registry.clone()), opts)
    }

    async fn handle_connection(&self, connection: &Connection) -> Result<()> {
        let (send, recv) = match connection
            .accept_bi()
            .with_cancellation_token(&self.shutdown)
            .await
        {
            None => return Ok(()),
            Some(Ok(streams)) => streams,
            Some(Err(ConnectionError::ApplicationClosed(_))) => {
                debug!("connection closed by client before opening the channel");
                return Ok(());
            }
            Some(Err(err)) => return Err(err).std_context("failed to accept channel stream"),
        };

        let (channel, outbound) = ChannelHandle::new();
        let conn = self.registry.register(channel.clone());
        let mut frames = FramedRead::new(recv, FrameCodec::default());
        let identify = async {
            let frame = frames
                .next()
                .timeout(self.identify_timeout)
                .await
                .map_err(|_| anyerr!("client did not identify in time"))?
                .context("channel closed before identify")??;
            let identify = Identify::from_frame(&frame)?;
            self.registry.identify(channel.id(), identify)?;
            Ok::<_, AnyError>(())
        };
        if let Err(err) = identify.await {
            self.registry.disconnect(channel.id());
            return Err(err);
        }
        let token = conn.token().unwrap_or_default().to_string();
        info!(%token, version=?conn.metadata().map(|m| &m.version), "session started");

        let forwarder = Forwarder::new(Side::Server, self.pipeline.for_client(&token), channel.clone());
        let session = run_session(
            &channel,
            frames,
            send,
            outbound,
            Dispatch {
                local: conn.multiplexer(),
                remote: &forwarder,
                side: Side::Server,
            },
        );
        let res = match session.with_cancellation_token(&self.shutdown).await {
            None => {
                debug!("session aborted at shutdown");
                Ok(())
            }
            Some(res) => res,
        };
        self.registry.disconnect(channel.id());
        forwarder.shutdown().await;
        match res {
            Ok(()) => {
                info!(%token, "session ended");
                Ok(())
            }
            Err(err) => {
                warn!(%token, "session failed: {err:#}");
                Err(err.into())
            }
        }
    }
}
