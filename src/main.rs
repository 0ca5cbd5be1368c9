use std::{path::PathBuf, time::Duration};

use clap::Parser;
use iroh::{Endpoint, EndpointId, SecretKey, protocol::Router};
use iroh_broker::{
    ALPN, AcceptConfig, BrokerClient, BrokerServer, ClientOpts, GatewayOpts, PipelineOpts,
    Registry, ServerOpts, Variables,
};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
enum Cli {
    /// Run a broker server: accepts clients over iroh and relays
    /// `/broker/{token}/...` calls to them.
    Server {
        /// Port of the HTTP gateway.
        #[clap(short, long, env = "PORT", default_value_t = 8080)]
        port: u16,
        /// Accept file. `private` filters the gateway, `public` the requests
        /// clients send to this server. A missing file disables filtering.
        #[clap(long, env = "ACCEPT", default_value = "accept.json")]
        accept: PathBuf,
        /// Origin for client requests whose rule names none.
        #[clap(long, env = "BROKER_ORIGIN")]
        origin: Option<String>,
        /// Send the calling client's token to the origin in `x-broker-token`.
        #[clap(long)]
        forward_identity: bool,
        /// Secret key of the iroh endpoint, random if unset.
        #[clap(long, env = "BROKER_SECRET_KEY", hide_env_values = true)]
        secret_key: Option<SecretKey>,
        #[clap(flatten)]
        gateway: GatewayArgs,
    },
    /// Run a broker client: serves requests from the server against local
    /// origins and relays local calls to the server.
    Client {
        /// EndpointId of the broker server.
        #[clap(long, env = "BROKER_SERVER_ID")]
        server: EndpointId,
        /// Token this client identifies with.
        #[clap(long, env = "BROKER_TOKEN", hide_env_values = true)]
        token: String,
        /// Accept file. `private` filters requests from the server, `public`
        /// the local calls relayed to it.
        #[clap(long, env = "ACCEPT", default_value = "accept.json")]
        accept: PathBuf,
        /// Port of the local HTTP gateway.
        #[clap(short, long, env = "PORT", default_value_t = 8000)]
        port: u16,
        /// Origin for requests whose rule names none.
        #[clap(long, env = "BROKER_ORIGIN")]
        origin: Option<String>,
        #[clap(flatten)]
        gateway: GatewayArgs,
    },
}

#[derive(Parser, Clone)]
struct GatewayArgs {
    /// Deadline of a relayed call, in seconds.
    #[clap(long, default_value_t = 300)]
    exchange_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli {
        Cli::Server {
            port,
            accept,
            origin,
            forward_identity,
            secret_key,
            gateway,
        } => cmd_server(port, accept, origin, forward_identity, secret_key, gateway).await,
        Cli::Client {
            server,
            token,
            accept,
            port,
            origin,
            gateway,
        } => cmd_client(server, token, accept, port, origin, gateway).await,
    }
}

// -- Server --

async fn cmd_server(
    port: u16,
    accept: PathBuf,
    origin: Option<String>,
    forward_identity: bool,
    secret_key: Option<SecretKey>,
    gateway: GatewayArgs,
) -> Result<()> {
    let accept = AcceptConfig::load_or_default(&accept)?;
    let mut builder = Endpoint::builder();
    if let Some(secret_key) = secret_key {
        builder = builder.secret_key(secret_key);
    }
    let endpoint = builder.bind().await?;
    let endpoint_id = endpoint.id();

    let opts = ServerOpts {
        pipeline: PipelineOpts {
            rules: accept.public,
            variables: Variables::from_env(),
            default_origin: origin,
            forward_identity,
        },
        ..Default::default()
    };
    let server = BrokerServer::new(Registry::new(), opts)?;
    let gateway = server.gateway(GatewayOpts {
        rules: (!accept.private.is_empty()).then_some(accept.private),
        exchange_timeout: Duration::from_secs(gateway.exchange_timeout),
    });
    let router = Router::builder(endpoint).accept(ALPN, server).spawn();

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    println!("broker server endpoint: {endpoint_id}");
    info!(%addr, "gateway listening");
    tokio::select! {
        res = gateway.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    router.shutdown().await.anyerr()?;
    Ok(())
}

// -- Client --

async fn cmd_client(
    server: EndpointId,
    token: String,
    accept: PathBuf,
    port: u16,
    origin: Option<String>,
    gateway: GatewayArgs,
) -> Result<()> {
    let accept = AcceptConfig::load(&accept)?;
    let endpoint = Endpoint::builder().bind().await?;
    let mut variables = std::env::vars().collect::<Vec<_>>();
    variables.push(("BROKER_TOKEN".to_string(), token.clone()));
    variables.push(("BROKER_TYPE".to_string(), "client".to_string()));

    let mut opts = ClientOpts::new(token);
    opts.filters = Some(accept.clone());
    opts.pipeline = PipelineOpts {
        rules: accept.private,
        variables: Variables::new(variables),
        default_origin: origin,
        forward_identity: false,
    };
    let client = BrokerClient::new(endpoint.clone(), server, opts)?;
    let gateway = client.gateway(GatewayOpts {
        rules: Some(accept.public),
        exchange_timeout: Duration::from_secs(gateway.exchange_timeout),
    });

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, server=%server.fmt_short(), "gateway listening");
    tokio::select! {
        res = client.run() => res?,
        res = gateway.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    endpoint.close().await;
    Ok(())
}
