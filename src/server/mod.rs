//! Command server and event loop
//!
//! - **Concurrent** mode hands every accepted connection to its own task and
//!   button presses to another, so the accept loop never waits on the power
//!   controller.
//! - **Serial** mode keeps at most one connection and serves it from the loop
//!   itself, together with button presses; the listener is only polled again
//!   once that client is gone.

mod connection;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::button::ButtonHandler;
use crate::error::{AppError, Result};
use crate::gpio::EdgeEvent;
use crate::protocol::Dispatcher;
use crate::utils::{set_keepalive, KeepaliveConfig};

pub use connection::{read_record, serve_connection, write_record};

/// Connection handling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// One task per connection
    Concurrent,
    /// One connection at a time, served from the event loop
    Serial,
}

impl Default for ServerMode {
    fn default() -> Self {
        Self::Concurrent
    }
}

/// Server settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub keepalive: KeepaliveConfig,
}

/// Event loop over the listening socket and the button
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    button: ButtonHandler,
    edges: mpsc::Receiver<EdgeEvent>,
    config: ServerConfig,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        button: ButtonHandler,
        edges: mpsc::Receiver<EdgeEvent>,
        config: ServerConfig,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            button,
            edges,
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Serving commands on {} ({:?} mode)", self.local_addr()?, self.config.mode);
        match self.config.mode {
            ServerMode::Concurrent => self.run_concurrent(shutdown).await,
            ServerMode::Serial => self.run_serial(shutdown).await,
        }
    }

    async fn run_concurrent<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            dispatcher,
            button,
            edges,
            config,
        } = self;
        let presses = tokio::spawn(handle_presses(button, edges));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        prepare_connection(&stream, peer, &config.keepalive);
                        let dispatcher = dispatcher.clone();
                        connections.spawn(async move {
                            finish_connection(peer, serve_connection(&mut stream, &dispatcher).await);
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        debug!("Dropping {} open connections", connections.len());
        connections.shutdown().await;
        presses.abort();
        let _ = presses.await;
        Ok(())
    }

    async fn run_serial<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            dispatcher,
            mut button,
            mut edges,
            config,
        } = self;
        let mut active: Option<(TcpStream, SocketAddr)> = None;
        tokio::pin!(shutdown);

        loop {
            let mut accepted = None;
            let mut finished = None;

            match active.as_mut() {
                None => tokio::select! {
                    _ = &mut shutdown => break,
                    Some(event) = edges.recv() => {
                        button.on_edge(event).await;
                    }
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            prepare_connection(&stream, peer, &config.keepalive);
                            accepted = Some((stream, peer));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    },
                },
                Some((stream, peer)) => tokio::select! {
                    _ = &mut shutdown => break,
                    Some(event) = edges.recv() => {
                        button.on_edge(event).await;
                    }
                    record = read_record(stream) => {
                        let outcome = match record {
                            Ok(Some(cmd)) => {
                                let reply = dispatcher.handle(cmd).await;
                                write_record(stream, &reply).await.map(|_| true)
                            }
                            Ok(None) => Ok(false),
                            Err(e) => Err(e),
                        };
                        match outcome {
                            Ok(true) => {}
                            Ok(false) => finished = Some((*peer, Ok(()))),
                            Err(e) => finished = Some((*peer, Err(e))),
                        }
                    }
                },
            }

            if let Some((peer, result)) = finished {
                active = None;
                finish_connection(peer, result);
            }
            if accepted.is_some() {
                active = accepted;
            }
        }

        Ok(())
    }
}

/// Feed button edges to the handler until the watcher goes away
async fn handle_presses(mut button: ButtonHandler, mut edges: mpsc::Receiver<EdgeEvent>) {
    while let Some(event) = edges.recv().await {
        button.on_edge(event).await;
    }
    debug!("Button event channel closed");
}

fn prepare_connection(stream: &TcpStream, peer: SocketAddr, keepalive: &KeepaliveConfig) {
    info!("Client {} connected", peer);
    if let Err(e) = set_keepalive(stream, keepalive) {
        warn!("Failed to enable keepalive for {}: {}", peer, e);
    }
}

fn finish_connection(peer: SocketAddr, result: Result<()>) {
    match result {
        Ok(()) => info!("Client {} disconnected", peer),
        Err(AppError::Protocol(reason)) => warn!("Dropping client {}: {}", peer, reason),
        Err(e) => warn!("Connection to {} failed: {}", peer, e),
    }
}
