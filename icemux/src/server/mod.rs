// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! ICE-TCP listener which routes each accepted connection to the agent it belongs to

use anyhow::Context;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
  net::{IpAddr, SocketAddr},
  sync::Arc,
  time::Duration,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    agent::{Agent, ConnectionHandle, ConnectionId, MonotonicConnectionIds},
    protocol::{ControlCodec, StunCodec},
    registry::{SessionRegistry, Ufrag},
  },
  util::{
    interfaces::{select_listen_ip, system_interfaces},
    liveness::{LivenessFlag, ShutdownListener},
  },
};

pub mod dispatcher;
pub mod events;

pub use dispatcher::{
  AffinityPolicy, Binding, ConnectionDispatcher, DispatchContext, DispatchError, DispatchOptions,
};
pub use events::{DispatchEvent, DispatchStats, DispatchStatsSnapshot, DropReason};

/// Port ICE-TCP connections are accepted on unless configured otherwise
pub const DEFAULT_PORT: u16 = 20002;

const DEFAULT_EVENT_CAPACITY: usize = 32;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Address to listen on; discovered from the host's interfaces when absent
  pub bind_ip: Option<IpAddr>,
  pub port: u16,
  /// Per-frame read deadline in milliseconds; reads wait indefinitely when absent
  pub read_timeout_ms: Option<u64>,
  /// Cap on accepted frame length, below the 65535 bytes the length prefix allows
  pub max_frame_length: Option<u16>,
  pub affinity: AffinityPolicy,
  /// Buffered events per subscriber before the slowest starts lagging
  pub event_capacity: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_ip: None,
      port: DEFAULT_PORT,
      read_timeout_ms: None,
      max_frame_length: None,
      affinity: AffinityPolicy::default(),
      event_capacity: DEFAULT_EVENT_CAPACITY,
    }
  }
}

impl ServerConfig {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn dispatch_options(&self) -> DispatchOptions {
    DispatchOptions {
      affinity: self.affinity,
      read_timeout: self.read_timeout_ms.map(Duration::from_millis),
      max_frame_length: self.max_frame_length.map(usize::from),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  #[error("Failed to enumerate network interfaces: {0}")]
  InterfaceEnumeration(#[source] std::io::Error),
  #[error("No interface is up with a non-loopback IPv4 address")]
  NoUsableInterface,
  #[error("Failed to bind listener on {addr}: {error}")]
  Bind {
    addr: SocketAddr,
    #[source]
    error: std::io::Error,
  },
}

fn discover_listen_ip() -> Result<IpAddr, ServerError> {
  let interfaces = system_interfaces().map_err(ServerError::InterfaceEnumeration)?;
  select_listen_ip(interfaces)
    .map(IpAddr::V4)
    .ok_or(ServerError::NoUsableInterface)
}

/// Accepts framed connections and dispatches them against a shared session registry
///
/// Instances are independent of one another; each owns its registry, counters,
/// and event channel.
pub struct Server {
  config: ServerConfig,
  ip: IpAddr,
  context: DispatchContext,
  connection_ids: MonotonicConnectionIds,
  liveness: LivenessFlag,
}

impl Server {
  /// Creates a server using the built-in STUN codec.
  ///
  /// Fails when no listening address is configured and none can be discovered.
  pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
    Self::with_codec(config, Arc::new(StunCodec))
  }

  pub fn with_codec(config: ServerConfig, codec: Arc<dyn ControlCodec>) -> Result<Self, ServerError> {
    let ip = match config.bind_ip {
      Some(ip) => ip,
      None => discover_listen_ip()?,
    };
    let context = DispatchContext::new(
      Arc::new(SessionRegistry::new()),
      codec,
      config.dispatch_options(),
      config.event_capacity,
    );
    Ok(Self {
      config,
      ip,
      context,
      connection_ids: MonotonicConnectionIds::new(1),
      liveness: LivenessFlag::new(),
    })
  }

  pub fn config(&self) -> &ServerConfig {
    &self.config
  }

  pub fn local_ip(&self) -> IpAddr {
    self.ip
  }

  pub fn registry(&self) -> &Arc<SessionRegistry> {
    self.context.registry()
  }

  pub fn stats(&self) -> DispatchStatsSnapshot {
    self.context.stats().snapshot()
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
    self.context.subscribe()
  }

  /// Whether an accept loop is currently running
  pub fn is_live(&self) -> bool {
    self.liveness.is_live()
  }

  /// Makes `agent` reachable under its local username fragment; the first registration wins.
  pub fn add_agent(&self, agent: &Arc<dyn Agent>) -> bool {
    self
      .registry()
      .add(Ufrag::new(agent.local_ufrag()), Arc::downgrade(agent))
  }

  pub fn remove_agent(&self, agent: &Arc<dyn Agent>) -> bool {
    self.registry().remove(&agent.local_ufrag())
  }

  #[tracing::instrument(skip(self), fields(ip = %self.ip, port = self.config.port), err)]
  pub async fn bind(&self) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::new(self.ip, self.config.port);
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|error| ServerError::Bind { addr, error })?;
    tracing::info!(addr = ?listener.local_addr().ok(), "listening for ICE-TCP connections");
    Ok(listener)
  }

  /// Binds the configured address and runs the accept loop until `shutdown` fires
  pub async fn start(
    self: Arc<Self>,
    shutdown: CancellationToken,
  ) -> Result<tokio::task::JoinHandle<()>, ServerError> {
    let listener = self.bind().await?;
    Ok(self.run(listener, shutdown))
  }

  /// Spawns the accept loop over `listener`.
  ///
  /// Each accepted connection is dispatched on its own task; the loop itself only
  /// spawns. Accept failures are logged and do not end the loop. Cancelling
  /// `shutdown` stops accepting, closes the listener, and drops open connections.
  pub fn run(
    self: Arc<Self>,
    listener: TcpListener,
    shutdown: CancellationToken,
  ) -> tokio::task::JoinHandle<()> {
    let listen_addr = listener.local_addr().ok();
    let shutdown = ShutdownListener::from(shutdown);
    let live = self.liveness.raise();

    let pipeline = TcpListenerStream::new(listener)
      .take_until({
        let shutdown = shutdown.clone();
        async move { shutdown.shutdown_requested().await }
      })
      .for_each(move |accepted| {
        match accepted {
          Ok(stream) => self.spawn_connection(stream, shutdown.clone()),
          Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
        }
        futures::future::ready(())
      });

    tokio::task::spawn(
      async move {
        pipeline.await;
        drop(live);
        tracing::info!("accept loop stopped");
      }
      .instrument(tracing::span!(tracing::Level::INFO, "icemux_server", addr = ?listen_addr)),
    )
  }

  fn spawn_connection(self: &Arc<Self>, stream: TcpStream, shutdown: ShutdownListener) {
    let id = self.connection_ids.next();
    let this = Arc::clone(self);
    let span = tracing::span!(
      tracing::Level::DEBUG,
      "connection",
      %id,
      remote = ?stream.peer_addr().ok()
    );
    tokio::task::spawn(
      async move {
        if let Err(e) = this.handle_connection(id, stream, shutdown).await {
          tracing::debug!(error = ?e, "connection closed with error");
        }
      }
      .instrument(span),
    );
  }

  async fn handle_connection(
    &self,
    id: ConnectionId,
    stream: TcpStream,
    shutdown: ShutdownListener,
  ) -> anyhow::Result<()> {
    let local = stream.local_addr().context("reading local address")?;
    let remote = stream.peer_addr().context("reading peer address")?;
    self.context.stats().connection_accepted();
    tracing::debug!("accepted connection");

    let (reader, writer) = stream.into_split();
    let handle = ConnectionHandle::new(id, local, remote, writer);
    let dispatcher = ConnectionDispatcher::new(self.context.clone(), reader, handle.clone());
    let result = tokio::select! {
      res = dispatcher.run() => res.with_context(|| format!("dispatching {id} from {remote}")),
      _ = shutdown.shutdown_requested() => {
        tracing::debug!("server shutting down; dropping connection");
        Ok(())
      }
    };
    // Agents may still hold the handle; the socket must not outlive dispatch
    handle.close().await;
    result
  }
}

impl std::fmt::Debug for Server {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Server")
      .field("ip", &self.ip)
      .field("port", &self.config.port)
      .field("live", &self.is_live())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::{AffinityPolicy, Server, ServerConfig, DEFAULT_PORT};
  use crate::{
    common::{
      agent::{
        testing::{self, RecordingAgent},
        Agent, Candidate, NetworkType,
      },
      protocol::{ControlCodec, StunCodec},
    },
    server::DispatchEvent,
    util::framed::{read_frame, write_frame},
  };
  use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
  };
  use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
  };
  use stun::message::{Message, Setter, BINDING_SUCCESS};
  use tokio_util::sync::CancellationToken;

  const WAIT: Duration = Duration::from_secs(5);

  fn loopback_config() -> ServerConfig {
    ServerConfig {
      bind_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
      port: 0,
      ..Default::default()
    }
  }

  fn recording_agent(ufrag: &str, sink_limit: usize) -> Arc<RecordingAgent> {
    let local: SocketAddr = "127.0.0.1:20002".parse().unwrap();
    Arc::new(
      RecordingAgent::new(ufrag, sink_limit)
        .with_candidate(Candidate::host(NetworkType::Tcp4, local))
        .with_candidate(Candidate::host(NetworkType::Tcp4, SocketAddr::new(local.ip(), 20003))),
    )
  }

  fn binding_request(username: &str) -> Vec<u8> {
    testing::binding_request(Some(username)).raw
  }

  struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
  }

  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  async fn start(config: ServerConfig) -> Running {
    init_tracing();
    let server = Arc::new(Server::new(config).unwrap());
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = Arc::clone(&server).run(listener, shutdown.clone());
    Running {
      server,
      addr,
      shutdown,
      task,
    }
  }

  async fn expect_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, client.read(&mut buf))
      .await
      .expect("Server must close the connection");
    assert!(matches!(read, Ok(0) | Err(_)));
  }

  #[test]
  fn config_defaults_and_json() {
    let defaults = ServerConfig::from_json("{}").unwrap();
    assert_eq!(defaults, ServerConfig::default());
    assert_eq!(defaults.port, DEFAULT_PORT);
    assert_eq!(defaults.affinity, AffinityPolicy::Connection);
    assert!(defaults.dispatch_options().read_timeout.is_none());

    let config = ServerConfig::from_json(
      r#"{ "bind_ip": "127.0.0.1", "port": 3478, "affinity": "latest", "read_timeout_ms": 1500, "max_frame_length": 1200 }"#,
    )
    .unwrap();
    assert_eq!(config.bind_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert_eq!(config.port, 3478);
    assert_eq!(config.event_capacity, 32);
    let options = config.dispatch_options();
    assert_eq!(options.affinity, AffinityPolicy::Latest);
    assert_eq!(options.read_timeout, Some(Duration::from_millis(1500)));
    assert_eq!(options.max_frame_length, Some(1200));

    assert!(ServerConfig::from_json(r#"{ "affinity": "sometimes" }"#).is_err());
  }

  #[test]
  fn configured_ip_skips_discovery() {
    let server = Server::new(loopback_config()).unwrap();
    assert_eq!(server.local_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert!(!server.is_live());
  }

  #[test]
  fn duplicate_agent_registration_is_ignored() {
    let server = Server::new(loopback_config()).unwrap();
    let first: Arc<dyn Agent> = recording_agent("abcd", 64);
    let second: Arc<dyn Agent> = recording_agent("abcd", 64);
    assert!(server.add_agent(&first));
    assert!(!server.add_agent(&first));
    assert!(!server.add_agent(&second));
    assert_eq!(server.registry().len(), 1);
    assert!(server.remove_agent(&first));
    assert!(!server.remove_agent(&first));
    assert!(server.add_agent(&second));
  }

  #[tokio::test]
  async fn dispatches_connectivity_checks_and_payload() {
    let running = start(loopback_config()).await;
    assert!(running.server.is_live());
    let x = recording_agent("abcd", 1024);
    let x_dyn: Arc<dyn Agent> = x.clone();
    assert!(running.server.add_agent(&x_dyn));
    let mut events = running.server.subscribe();

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut client, &binding_request("abcd:wxyz"))
      .await
      .unwrap();
    write_frame(&mut client, &[0x42; 64]).await.unwrap();

    let payload = tokio::time::timeout(WAIT, x.sink.read())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, vec![0x42; 64]);
    let calls = x.inbound_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].local, x.local_candidates(NetworkType::Tcp4)[0]);
    assert_eq!(calls[0].remote, client.local_addr().unwrap());
    assert!(matches!(
      tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap(),
      DispatchEvent::Bound { ufrag, .. } if ufrag.raw() == "abcd"
    ));

    let stats = running.server.stats();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.payload_bytes_forwarded, 64);

    running.shutdown.cancel();
    tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn agent_answers_over_associated_transport() {
    let running = start(loopback_config()).await;
    let x = recording_agent("abcd", 1024);
    let x_dyn: Arc<dyn Agent> = x.clone();
    running.server.add_agent(&x_dyn);

    let client = TcpStream::connect(running.addr).await.unwrap();
    let (mut client_r, mut client_w) = client.into_split();
    write_frame(&mut client_w, &binding_request("abcd:wxyz"))
      .await
      .unwrap();

    let handle = tokio::time::timeout(WAIT, async {
      loop {
        if let Some(handle) = x.transport().get() {
          break handle.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(handle.remote_addr(), client_w.local_addr().unwrap());

    let request = x.inbound_calls().remove(0).message;
    let setters: Vec<Box<dyn Setter>> =
      vec![Box::new(BINDING_SUCCESS), Box::new(request.transaction_id)];
    let mut response = Message::new();
    response.build(&setters).unwrap();
    handle.send(&response.raw).await.unwrap();

    let frame = tokio::time::timeout(WAIT, read_frame(&mut client_r, None))
      .await
      .unwrap()
      .unwrap();
    let decoded = StunCodec.decode(&frame).unwrap();
    assert_eq!(decoded.typ, BINDING_SUCCESS);
    assert_eq!(decoded.transaction_id, request.transaction_id);

    running.shutdown.cancel();
  }

  #[tokio::test]
  async fn unknown_session_closes_only_that_connection() {
    let running = start(loopback_config()).await;
    let x = recording_agent("abcd", 1024);
    let x_dyn: Arc<dyn Agent> = x.clone();
    running.server.add_agent(&x_dyn);

    let mut stranger = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut stranger, &binding_request("zzzz:wxyz"))
      .await
      .unwrap();
    expect_closed(&mut stranger).await;
    assert_eq!(x.inbound_count(), 0);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut client, &binding_request("abcd:wxyz"))
      .await
      .unwrap();
    write_frame(&mut client, b"still accepting").await.unwrap();
    let payload = tokio::time::timeout(WAIT, x.sink.read())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, b"still accepting");
    assert_eq!(x.inbound_count(), 1);

    running.shutdown.cancel();
  }

  #[tokio::test]
  async fn bound_connection_closes_after_fatal_frame() {
    let running = start(loopback_config()).await;
    let x = recording_agent("abcd", 1024);
    let x_dyn: Arc<dyn Agent> = x.clone();
    running.server.add_agent(&x_dyn);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut client, &binding_request("abcd:wxyz"))
      .await
      .unwrap();
    write_frame(&mut client, &binding_request("zzzz:wxyz"))
      .await
      .unwrap();
    expect_closed(&mut client).await;
    assert_eq!(x.inbound_count(), 1);
    assert!(x.transport().get().unwrap().is_closed().await);

    running.shutdown.cancel();
  }

  #[tokio::test]
  async fn full_sink_keeps_connection_open() {
    let running = start(loopback_config()).await;
    let x = recording_agent("abcd", 10);
    let x_dyn: Arc<dyn Agent> = x.clone();
    running.server.add_agent(&x_dyn);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut client, &binding_request("abcd:wxyz"))
      .await
      .unwrap();
    write_frame(&mut client, &[1u8; 20]).await.unwrap();
    write_frame(&mut client, &[2u8; 5]).await.unwrap();

    let payload = tokio::time::timeout(WAIT, x.sink.read())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, vec![2u8; 5]);
    assert_eq!(running.server.stats().dropped_sink_full, 1);

    running.shutdown.cancel();
  }

  #[tokio::test]
  async fn removed_agent_is_no_longer_reachable() {
    let running = start(loopback_config()).await;
    let x = recording_agent("abcd", 1024);
    let x_dyn: Arc<dyn Agent> = x.clone();
    running.server.add_agent(&x_dyn);
    assert!(running.server.remove_agent(&x_dyn));

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    write_frame(&mut client, &binding_request("abcd:wxyz"))
      .await
      .unwrap();
    expect_closed(&mut client).await;
    assert_eq!(x.inbound_count(), 0);

    running.shutdown.cancel();
  }

  #[tokio::test]
  async fn shutdown_stops_accepting_and_drops_connections() {
    let running = start(loopback_config()).await;
    let mut idle = TcpStream::connect(running.addr).await.unwrap();
    tokio::time::timeout(WAIT, async {
      while running.server.stats().connections_accepted == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();

    running.shutdown.cancel();
    tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap();
    assert!(!running.server.is_live());
    expect_closed(&mut idle).await;
    assert!(TcpStream::connect(running.addr).await.is_err());
  }

  #[tokio::test]
  async fn bind_reports_address_in_use() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(ServerConfig {
      port: occupied.local_addr().unwrap().port(),
      ..loopback_config()
    })
    .unwrap();
    assert!(matches!(
      server.bind().await,
      Err(super::ServerError::Bind { .. })
    ));
  }
}
