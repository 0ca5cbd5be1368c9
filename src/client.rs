use std::time::Duration;

use iroh::{Endpoint, EndpointAddr};
use n0_error::{Result, StdResultExt};
use tokio::{sync::watch, time::Instant};
use tokio_util::codec::FramedRead;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    channel::{ChannelHandle, Dispatch, run_session},
    error::Failure,
    filter::AcceptConfig,
    forward::{Forwarder, Pipeline, PipelineOpts},
    frame::{FrameCodec, Side},
    gateway::{GatewayOpts, IngressGateway, UpstreamConnection},
    registry::{Connection, Identify, Metadata},
    server::ALPN,
};

/// Options for a [`BrokerClient`].
#[derive(Debug, Clone)]
pub struct ClientOpts {
    /// Token this client identifies with.
    pub token: String,
    /// Reported to the server on identify. Defaults to the crate version.
    pub version: String,
    /// Pipeline serving requests that arrive from the server.
    pub pipeline: PipelineOpts,
    /// Accept file reported to the server on identify.
    ///
    /// When unset, only the pipeline rules are reported, as `private`.
    pub filters: Option<AcceptConfig>,
    /// First reconnect delay, doubled after every failed attempt.
    pub reconnect_delay: Duration,
    /// Upper bound of the reconnect delay.
    pub max_reconnect_delay: Duration,
}

impl ClientOpts {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pipeline: Default::default(),
            filters: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Keeps one tunnel connection to a broker server open.
///
/// Requests from the server are served through the client's [`Pipeline`]. Local
/// calls reach the server through the client's [`IngressGateway`].
#[derive(Debug)]
pub struct BrokerClient {
    endpoint: Endpoint,
    server: EndpointAddr,
    opts: ClientOpts,
    pipeline: Pipeline,
    current: watch::Sender<Option<Connection>>,
}

impl BrokerClient {
    pub fn new(endpoint: Endpoint, server: impl Into<EndpointAddr>, opts: ClientOpts) -> Result<Self> {
        let pipeline = Pipeline::new(opts.pipeline.clone())?;
        Ok(Self {
            endpoint,
            server: server.into(),
            opts,
            pipeline,
            current: watch::Sender::new(None),
        })
    }

    /// The identified connection, if the client is connected.
    pub fn connection(&self) -> watch::Receiver<Option<Connection>> {
        self.current.subscribe()
    }

    /// Gateway relaying local calls to the server over the current connection.
    pub fn gateway(&self, opts: GatewayOpts) -> IngressGateway {
        IngressGateway::new(UpstreamConnection::new(self.connection()), opts)
    }

    fn identify(&self) -> Identify {
        let filters = self.opts.filters.clone().unwrap_or_else(|| AcceptConfig {
            private: self.pipeline.rules().clone(),
            public: Default::default(),
        });
        Identify {
            token: self.opts.token.clone(),
            metadata: Metadata {
                version: self.opts.version.clone(),
                filters: serde_json::to_value(&filters).unwrap_or_default(),
            },
        }
    }

    /// Connects and runs one session until the channel drops.
    pub async fn run_once(&self) -> Result<()> {
        let conn = self
            .endpoint
            .connect(self.server.clone(), ALPN)
            .await
            .std_context("failed to connect to broker server")?;
        let (send, recv) = conn
            .open_bi()
            .await
            .std_context("failed to open channel stream")?;

        let (channel, outbound) = ChannelHandle::new();
        let connection = Connection::new(Side::Client, channel.clone());
        let identify = self.identify();
        // the identify frame is the first one queued, so it is the first one written
        channel.send(identify.to_frame())?;
        connection.mark_identified(identify)?;
        self.current.send_replace(Some(connection.clone()));
        info!(server=%conn.remote_id().fmt_short(), "connected to broker server");

        let forwarder = Forwarder::new(Side::Client, self.pipeline.clone(), channel.clone());
        let res = run_session(
            &channel,
            FramedRead::new(recv, FrameCodec::default()),
            send,
            outbound,
            Dispatch {
                local: connection.multiplexer(),
                remote: &forwarder,
                side: Side::Client,
            },
        )
        .await;
        self.current.send_replace(None);
        connection.terminate(Failure::Lost);
        forwarder.shutdown().await;
        conn.close(0u32.into(), b"");
        res?;
        info!("channel to broker server closed");
        Ok(())
    }

    /// Runs sessions forever, reconnecting with exponential backoff.
    ///
    /// In-flight exchanges of a dropped session fail and are not retried.
    pub async fn run(&self) -> Result<()> {
        let mut delay = self.opts.reconnect_delay;
        for attempt in 0u64.. {
            let started = Instant::now();
            if let Err(err) = self
                .run_once()
                .instrument(error_span!("session", attempt))
                .await
            {
                warn!("session failed: {err:#}");
            }
            // a session that stayed up for a while resets the backoff
            if started.elapsed() > self.opts.max_reconnect_delay {
                delay = self.opts.reconnect_delay;
            }
            debug!(?delay, "reconnecting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.opts.max_reconnect_delay);
        }
        Ok(())
    }
}
