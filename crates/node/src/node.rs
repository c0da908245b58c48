use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mx::{Dispatcher, DispatcherEvent, SessionId, Target, TransportError};

use crate::config::NodeConfig;

pub struct Node {
    dispatcher: Dispatcher,
    config: NodeConfig,
    running: bool,
    tick: u64,
    tick_duration: Duration,
    accumulator: Duration,
    last_tick_time: Instant,
}

impl Node {
    pub fn new(bind_addr: &str, config: NodeConfig) -> Result<Self> {
        let dispatcher = Dispatcher::bind(bind_addr, config.transport.clone())
            .with_context(|| format!("failed to bind {}", bind_addr))?;

        Ok(Self {
            dispatcher,
            tick_duration: Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64),
            config,
            running: true,
            tick: 0,
            accumulator: Duration::ZERO,
            last_tick_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<SessionId> {
        let session = self.dispatcher.connect(addr)?;
        if let Some(group) = &self.config.group {
            self.dispatcher.place_in_group(session, group)?;
        }
        Ok(session)
    }

    /// Sends to the configured group, or to `session` when there is none.
    pub fn send(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<()> {
        let target = match &self.config.group {
            Some(group) => Target::Group(group),
            None => Target::Session(session),
        };
        self.dispatcher.send(target, payload, reliable)?;
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        while self.running {
            self.tick_once()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown()
    }

    pub fn tick_once(&mut self) -> Result<()> {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.step()?;

            self.tick += 1;
            if self.config.max_ticks.is_some_and(|max| self.tick >= max) {
                self.running = false;
                break;
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        match self.dispatcher.update() {
            Ok(()) => {}
            Err(err @ TransportError::CorruptMessage { .. }) => {
                log::warn!("Tick {}: {}", self.tick, err);
            }
            Err(err) => return Err(err.into()),
        }

        for event in self.dispatcher.drain_events() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: DispatcherEvent) -> Result<()> {
        match event {
            DispatcherEvent::Connected { session, addr } => {
                log::info!("Session {} connected ({})", session, addr);
                if let Some(group) = &self.config.group {
                    self.dispatcher.place_in_group(session, group)?;
                }
            }
            DispatcherEvent::Disconnected {
                session,
                addr,
                reason,
            } => {
                log::info!("Session {} ({}) {}", session, addr, reason.as_str());
            }
            DispatcherEvent::DisconnectWarning {
                session,
                accumulator,
                limit,
                ..
            } => {
                if accumulator % 30 == 0 {
                    log::warn!("Session {} silent for {}/{} ticks", session, accumulator, limit);
                }
            }
            DispatcherEvent::MessageReceived {
                session,
                payload,
                reliable,
            } => {
                log::info!(
                    "Session {} received {} bytes{}: {}",
                    session,
                    payload.len(),
                    if reliable { " (reliable)" } else { "" },
                    String::from_utf8_lossy(&payload)
                );
                if self.config.echo {
                    self.dispatcher
                        .send(Target::Session(session), &payload, reliable)?;
                }
            }
            DispatcherEvent::MessageAcknowledged {
                session,
                payload,
                reliable,
            } => {
                log::debug!(
                    "Session {} acknowledged {} bytes (reliable: {})",
                    session,
                    payload.len(),
                    reliable
                );
            }
            DispatcherEvent::MessageLost { session, payload } => {
                log::debug!("Session {} lost {} bytes", session, payload.len());
            }
            DispatcherEvent::MessageSent { .. } => {}
            DispatcherEvent::ReliableSendProgress { session, progress }
            | DispatcherEvent::ReliableReceiveProgress { session, progress } => {
                log::debug!(
                    "Session {} {} {}/{} fragments ({} bytes)",
                    session,
                    if progress.is_sending { "sent" } else { "received" },
                    progress.current_fragments,
                    progress.total_fragments,
                    progress.total_size
                );
            }
            DispatcherEvent::FlowControlChanged {
                session,
                mode,
                penalty_secs,
            } => {
                log::info!(
                    "Session {} flow control {:?}, penalty {}s",
                    session,
                    mode,
                    penalty_secs
                );
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let stats = self.dispatcher.stats()?;
        log::info!(
            "Sent {} datagrams ({} bytes), received {} ({} bytes), {} probes answered",
            stats.datagrams_sent,
            stats.bytes_sent,
            stats.datagrams_received,
            stats.bytes_received,
            stats.probes_answered
        );
        self.dispatcher.close()?;
        for event in self.dispatcher.drain_events() {
            self.handle_event(event)?;
        }
        Ok(())
    }
}
