//! The tokio driver: sockets, listeners, and timers for one engine.
//!
//! All engine state lives in a single driver task. Per-socket pump tasks
//! move raw bytes over channels: readers fan into one [`IoMsg`] queue,
//! writers each drain their own command queue, so nothing but bytes ever
//! crosses a task boundary. Closing a writer channel closes its socket.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::{Config, Mode};
use crate::error::{Error, Result};
use crate::protocol::{ChopEngine, CircuitId, ConnId, Event};
use crate::steg;

const CHANNEL_DEPTH: usize = 256;
const READ_CHUNK: usize = 16 * 1024;

/// Everything the pump tasks report back to the driver.
enum IoMsg {
    /// Client: a new application connection was accepted
    NewUpstream(TcpStream),
    /// Server: a new cover connection was accepted on target `usize`
    NewDownstream(TcpStream, usize),
    /// Client: an outbound cover dial finished
    DownstreamDialed(ConnId, std::io::Result<TcpStream>),
    /// Server: the dial to the real upstream failed
    UpstreamDialFailed(CircuitId),
    UpstreamData(CircuitId, Bytes),
    UpstreamEof(CircuitId),
    UpstreamError(CircuitId),
    DownstreamData(ConnId, Bytes),
    DownstreamEof(ConnId),
    DownstreamError(ConnId),
}

/// Commands for one socket's writer task.
enum WriteCmd {
    Data(Bytes),
    /// Half-close the write side (upstream EOF propagation)
    Eof,
}

/// Run the configured proxy until shutdown.
pub async fn run(config: Config) -> Result<()> {
    match config.mode {
        Mode::Client => run_client(config).await,
        Mode::Server => run_server(config).await,
        Mode::Socks => Err(Error::config(
            "the socks front-end is not built into this binary; use client mode",
        )),
    }
}

async fn run_client(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.up_address).await?;
    tracing::info!("client listening upstream on {}", config.up_address);

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let accept_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if accept_tx.send(IoMsg::NewUpstream(stream)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("accept error: {}", e),
            }
        }
    });

    let engine = ChopEngine::new(false, config.passphrase.clone());
    Driver::new(config, engine, tx, rx).run().await
}

async fn run_server(config: Config) -> Result<()> {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    for (index, target) in config.downstreams.iter().enumerate() {
        let listener = TcpListener::bind(target.addr).await?;
        tracing::info!("server listening on {} ({})", target.addr, target.steg);
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if accept_tx
                            .send(IoMsg::NewDownstream(stream, index))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("accept error: {}", e),
                }
            }
        });
    }

    let engine = ChopEngine::new(true, config.passphrase.clone());
    Driver::new(config, engine, tx, rx).run().await
}

struct Driver {
    config: Config,
    engine: ChopEngine,
    tx: mpsc::Sender<IoMsg>,
    rx: mpsc::Receiver<IoMsg>,
    down_writers: HashMap<ConnId, mpsc::Sender<WriteCmd>>,
    up_writers: HashMap<CircuitId, mpsc::Sender<WriteCmd>>,
    shutting_down: bool,
}

impl Driver {
    fn new(
        config: Config,
        engine: ChopEngine,
        tx: mpsc::Sender<IoMsg>,
        rx: mpsc::Receiver<IoMsg>,
    ) -> Self {
        Self {
            config,
            engine,
            tx,
            rx,
            down_writers: HashMap::new(),
            up_writers: HashMap::new(),
            shutting_down: false,
        }
    }

    async fn run(mut self) -> Result<()> {
        loop {
            let deadline = self
                .engine
                .next_timer()
                .map(tokio::time::Instant::from_std);
            let park = deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(park), if deadline.is_some() => {
                    self.engine.on_timer(Instant::now());
                }
                _ = tokio::signal::ctrl_c() => {
                    let barbaric = self.shutting_down;
                    tracing::info!(barbaric, "shutdown requested");
                    self.shutting_down = true;
                    self.engine.start_shutdown(barbaric, Instant::now());
                }
            }

            self.dispatch_events().await;
            if self.shutting_down && self.engine.is_idle() {
                break;
            }
        }
        tracing::info!("event loop finished");
        Ok(())
    }

    async fn handle(&mut self, msg: IoMsg) {
        let now = Instant::now();
        match msg {
            IoMsg::NewUpstream(stream) => match self.engine.create_circuit() {
                Ok(circuit) => {
                    tracing::info!(circuit, "new upstream connection");
                    self.attach_upstream(circuit, stream);
                    self.open_downstreams(circuit);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "refusing upstream connection");
                }
            },
            IoMsg::NewDownstream(stream, index) => {
                if self.shutting_down {
                    return;
                }
                let name = &self.config.downstreams[index].steg;
                let Some(module) = steg::create(name, true) else {
                    return;
                };
                let conn = self.engine.create_connection(module, None);
                tracing::debug!(conn, steg = %name, "new downstream connection");
                self.attach_downstream(conn, stream);
            }
            IoMsg::DownstreamDialed(conn, Ok(stream)) => {
                if !self.engine.has_conn(conn) {
                    return;
                }
                self.attach_downstream(conn, stream);
                self.engine.downstream_connected(conn, now);
            }
            IoMsg::DownstreamDialed(conn, Err(e)) => {
                tracing::warn!(conn, error = %e, "downstream dial failed");
                self.engine.downstream_error(conn, now);
            }
            IoMsg::UpstreamDialFailed(circuit) => {
                self.engine.upstream_closed(circuit, now);
            }
            IoMsg::UpstreamData(circuit, data) => {
                self.engine.upstream_data(circuit, &data, now);
            }
            IoMsg::UpstreamEof(circuit) => self.engine.upstream_eof(circuit, now),
            IoMsg::UpstreamError(circuit) => self.engine.upstream_closed(circuit, now),
            IoMsg::DownstreamData(conn, data) => {
                self.engine.downstream_data(conn, &data, now);
            }
            IoMsg::DownstreamEof(conn) => self.engine.downstream_eof(conn, now),
            IoMsg::DownstreamError(conn) => self.engine.downstream_error(conn, now),
        }
    }

    async fn dispatch_events(&mut self) {
        loop {
            let events = self.engine.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                match event {
                    Event::DownstreamWrite { conn, data } => {
                        if let Some(writer) = self.down_writers.get(&conn) {
                            let _ = writer.send(WriteCmd::Data(data)).await;
                        }
                    }
                    Event::DownstreamClose { conn } => {
                        // Dropping the sender lets queued writes drain,
                        // then the writer task closes the socket.
                        self.down_writers.remove(&conn);
                    }
                    Event::UpstreamWrite { circuit, data } => {
                        if let Some(writer) = self.up_writers.get(&circuit) {
                            let _ = writer.send(WriteCmd::Data(data)).await;
                        }
                    }
                    Event::UpstreamEof { circuit } => {
                        if let Some(writer) = self.up_writers.get(&circuit) {
                            let _ = writer.send(WriteCmd::Eof).await;
                        }
                    }
                    Event::OpenUpstream { circuit } => {
                        // Register the writer before the dial lands so
                        // blocks arriving in the meantime queue up instead
                        // of vanishing.
                        let addr = self.config.up_address;
                        let tx = self.tx.clone();
                        let (wtx, wrx) = mpsc::channel(CHANNEL_DEPTH);
                        self.up_writers.insert(circuit, wtx);
                        tokio::spawn(async move {
                            match TcpStream::connect(addr).await {
                                Ok(stream) => {
                                    tracing::debug!(circuit, "upstream connected");
                                    let (rd, wr) = stream.into_split();
                                    tokio::spawn(pump_writer(wr, wrx));
                                    pump_upstream(rd, circuit, tx).await;
                                }
                                Err(e) => {
                                    tracing::warn!(circuit, error = %e, "upstream dial failed");
                                    let _ =
                                        tx.send(IoMsg::UpstreamDialFailed(circuit)).await;
                                }
                            }
                        });
                    }
                    Event::ReopenDownstreams { circuit } => {
                        self.open_downstreams(circuit);
                    }
                    Event::CircuitDestroyed { circuit } => {
                        self.up_writers.remove(&circuit);
                    }
                }
            }
        }
    }

    /// Dial every configured cover endpoint for a circuit (client side).
    fn open_downstreams(&mut self, circuit: CircuitId) {
        if self.shutting_down || !self.engine.circuit_is_live(circuit) {
            return;
        }
        for target in self.config.downstreams.clone() {
            let Some(module) = steg::create(&target.steg, false) else {
                continue;
            };
            let conn = self.engine.create_connection(module, Some(circuit));
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let res = TcpStream::connect(target.addr).await;
                let _ = tx.send(IoMsg::DownstreamDialed(conn, res)).await;
            });
        }
    }

    fn attach_upstream(&mut self, circuit: CircuitId, stream: TcpStream) {
        let (rd, wr) = stream.into_split();
        let (wtx, wrx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(pump_writer(wr, wrx));
        tokio::spawn(pump_upstream(rd, circuit, self.tx.clone()));
        self.up_writers.insert(circuit, wtx);
    }

    fn attach_downstream(&mut self, conn: ConnId, stream: TcpStream) {
        let (rd, wr) = stream.into_split();
        let (wtx, wrx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(pump_writer(wr, wrx));
        tokio::spawn(pump_downstream(rd, conn, self.tx.clone()));
        self.down_writers.insert(conn, wtx);
    }
}

async fn pump_writer(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<WriteCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                if wr.write_all(&data).await.is_err() {
                    break;
                }
            }
            WriteCmd::Eof => {
                let _ = wr.shutdown().await;
            }
        }
    }
    let _ = wr.shutdown().await;
}

async fn pump_upstream(mut rd: OwnedReadHalf, circuit: CircuitId, tx: mpsc::Sender<IoMsg>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(IoMsg::UpstreamEof(circuit)).await;
                break;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(IoMsg::UpstreamData(circuit, chunk)).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                let _ = tx.send(IoMsg::UpstreamError(circuit)).await;
                break;
            }
        }
    }
}

async fn pump_downstream(mut rd: OwnedReadHalf, conn: ConnId, tx: mpsc::Sender<IoMsg>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(IoMsg::DownstreamEof(conn)).await;
                break;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(IoMsg::DownstreamData(conn, chunk)).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                let _ = tx.send(IoMsg::DownstreamError(conn)).await;
                break;
            }
        }
    }
}
