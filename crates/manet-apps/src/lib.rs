//! # manet-apps
//!
//! UDP echo applications for the MANET simulator.
//!
//! Applications are hosted by a node entity and never touch the scheduler
//! themselves: every callback returns an [`AppOutput`] holding the packets
//! to send and, optionally, the time the application wants to be woken up
//! again. The node turns those into IP sends and timer events.

use manet_common::metric_defs::{self, MetricLabels};
use manet_common::{NodeId, SimContext, SimTime};
use manet_packet::{Packet, Payload, MAX_UDP_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

/// Echo client parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EchoClientConfig {
    /// Address of the echo server.
    pub remote: Ipv4Addr,
    /// Server port.
    pub port: u16,
    /// Number of requests to send.
    pub max_packets: u32,
    /// Interval between requests in seconds.
    pub interval_s: f64,
    /// Payload size of each request in bytes.
    pub packet_size: u32,
    /// Start time in seconds.
    pub start_s: f64,
    /// Stop time in seconds.
    pub stop_s: f64,
}

impl Default for EchoClientConfig {
    fn default() -> Self {
        EchoClientConfig {
            remote: Ipv4Addr::new(10, 1, 1, 2),
            port: 9,
            max_packets: 10,
            interval_s: 1.0,
            packet_size: 1024,
            start_s: 2.0,
            stop_s: 30.0,
        }
    }
}

impl EchoClientConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.interval_s > 0.0) || !self.interval_s.is_finite() {
            return Err(format!("echo client interval must be positive, got {}", self.interval_s));
        }
        if self.packet_size == 0 || self.packet_size > MAX_UDP_PAYLOAD {
            return Err(format!(
                "echo client packet size must be in 1..={}, got {}",
                MAX_UDP_PAYLOAD, self.packet_size
            ));
        }
        validate_window(self.start_s, self.stop_s)
    }
}

/// Echo server parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EchoServerConfig {
    /// Listening port.
    pub port: u16,
    /// Start time in seconds.
    pub start_s: f64,
    /// Stop time in seconds.
    pub stop_s: f64,
}

impl Default for EchoServerConfig {
    fn default() -> Self {
        EchoServerConfig {
            port: 9,
            start_s: 1.0,
            stop_s: 30.0,
        }
    }
}

impl EchoServerConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        validate_window(self.start_s, self.stop_s)
    }
}

fn validate_window(start_s: f64, stop_s: f64) -> Result<(), String> {
    if start_s < 0.0 || !start_s.is_finite() {
        return Err(format!("application start time must be non-negative, got {}", start_s));
    }
    if !stop_s.is_finite() {
        return Err(format!("application stop time must be finite, got {}", stop_s));
    }
    if stop_s < start_s {
        return Err(format!(
            "application stop time {} is before its start time {}",
            stop_s, start_s
        ));
    }
    Ok(())
}

// ============================================================================
// Application Output
// ============================================================================

/// Work requested by an application callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppOutput {
    /// Packets to hand to the IP layer.
    pub packets: Vec<Packet>,
    /// Absolute time of the next wake-up, if any.
    pub wake_at: Option<SimTime>,
}

// ============================================================================
// Echo Client
// ============================================================================

/// Sends fixed-size requests at a fixed interval and counts the echoes.
#[derive(Debug, Clone)]
pub struct EchoClient {
    config: EchoClientConfig,
    local: Ipv4Addr,
    local_port: u16,
    running: bool,
    sent: u32,
    received: u32,
    labels: MetricLabels,
}

impl EchoClient {
    /// Create a client bound to `local:local_port`.
    pub fn new(config: EchoClientConfig, node: NodeId, local: Ipv4Addr, local_port: u16) -> Self {
        EchoClient {
            config,
            local,
            local_port,
            running: false,
            sent: 0,
            received: 0,
            labels: MetricLabels::for_node(node.0),
        }
    }

    pub fn config(&self) -> &EchoClientConfig {
        &self.config
    }

    /// Requests sent so far.
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Echoes received so far.
    pub fn received(&self) -> u32 {
        self.received
    }

    fn send_next(&mut self, ctx: &mut SimContext) -> AppOutput {
        let mut output = AppOutput::default();
        if !self.running || self.sent >= self.config.max_packets {
            return output;
        }

        let packet = Packet::udp(
            ctx.next_uid(),
            (self.local, self.local_port),
            (self.config.remote, self.config.port),
            Payload::Data {
                len: self.config.packet_size,
            },
        );
        info!(
            time = %ctx.time(),
            "Sent {} bytes to {} port {}",
            self.config.packet_size,
            self.config.remote,
            self.config.port
        );
        metrics::counter!(metric_defs::APP_ECHO_SENT.name, &self.labels.to_labels()).increment(1);
        self.sent += 1;
        output.packets.push(packet);

        if self.sent < self.config.max_packets {
            let next = ctx.time() + SimTime::from_secs(self.config.interval_s);
            if next < SimTime::from_secs(self.config.stop_s) {
                output.wake_at = Some(next);
            }
        }
        output
    }

    fn receive(&mut self, packet: &Packet, ctx: &mut SimContext) -> AppOutput {
        if !self.running {
            debug!(uid = packet.uid, "echo client stopped, reply discarded");
            return AppOutput::default();
        }
        self.received += 1;
        metrics::counter!(metric_defs::APP_ECHO_RECEIVED.name, &self.labels.to_labels()).increment(1);
        info!(
            time = %ctx.time(),
            "Received {} bytes from {} port {}",
            packet.payload.len(),
            packet.source,
            packet.source_port
        );
        AppOutput::default()
    }
}

// ============================================================================
// Echo Server
// ============================================================================

/// Echoes every request back to its sender.
#[derive(Debug, Clone)]
pub struct EchoServer {
    config: EchoServerConfig,
    local: Ipv4Addr,
    listening: bool,
    served: u32,
    labels: MetricLabels,
}

impl EchoServer {
    /// Create a server on `local`.
    pub fn new(config: EchoServerConfig, node: NodeId, local: Ipv4Addr) -> Self {
        EchoServer {
            config,
            local,
            listening: false,
            served: 0,
            labels: MetricLabels::for_node(node.0),
        }
    }

    pub fn config(&self) -> &EchoServerConfig {
        &self.config
    }

    /// Requests answered so far.
    pub fn served(&self) -> u32 {
        self.served
    }

    fn receive(&mut self, packet: &Packet, ctx: &mut SimContext) -> AppOutput {
        let mut output = AppOutput::default();
        if !self.listening {
            debug!(uid = packet.uid, "echo server not listening, request discarded");
            return output;
        }
        let len = packet.payload.len();
        info!(
            time = %ctx.time(),
            "Received {} bytes from {} port {}",
            len,
            packet.source,
            packet.source_port
        );

        let reply = Packet::udp(
            ctx.next_uid(),
            (self.local, self.config.port),
            (packet.source, packet.source_port),
            Payload::Data { len },
        );
        info!(
            time = %ctx.time(),
            "Echoing {} bytes to {} port {}",
            len,
            packet.source,
            packet.source_port
        );
        metrics::counter!(metric_defs::APP_ECHO_SERVED.name, &self.labels.to_labels()).increment(1);
        self.served += 1;
        output.packets.push(reply);
        output
    }
}

// ============================================================================
// Application
// ============================================================================

/// Closed set of applications a node can host.
#[derive(Debug, Clone)]
pub enum Application {
    /// UDP echo client.
    EchoClient(EchoClient),
    /// UDP echo server.
    EchoServer(EchoServer),
}

impl Application {
    /// Time the application starts.
    pub fn start_time(&self) -> SimTime {
        match self {
            Application::EchoClient(client) => SimTime::from_secs(client.config.start_s),
            Application::EchoServer(server) => SimTime::from_secs(server.config.start_s),
        }
    }

    /// Time the application stops.
    pub fn stop_time(&self) -> SimTime {
        match self {
            Application::EchoClient(client) => SimTime::from_secs(client.config.stop_s),
            Application::EchoServer(server) => SimTime::from_secs(server.config.stop_s),
        }
    }

    /// UDP port the application receives on.
    pub fn local_port(&self) -> u16 {
        match self {
            Application::EchoClient(client) => client.local_port,
            Application::EchoServer(server) => server.config.port,
        }
    }

    /// Short name for logs and traces.
    pub fn name(&self) -> &'static str {
        match self {
            Application::EchoClient(_) => "udp_echo_client",
            Application::EchoServer(_) => "udp_echo_server",
        }
    }

    /// Returns true between start and stop.
    pub fn is_running(&self) -> bool {
        match self {
            Application::EchoClient(client) => client.running,
            Application::EchoServer(server) => server.listening,
        }
    }

    /// Start the application.
    pub fn start(&mut self, ctx: &mut SimContext) -> AppOutput {
        match self {
            Application::EchoClient(client) => {
                client.running = true;
                client.send_next(ctx)
            }
            Application::EchoServer(server) => {
                debug!(port = server.config.port, "echo server listening");
                server.listening = true;
                AppOutput::default()
            }
        }
    }

    /// Scheduled wake-up.
    pub fn wake(&mut self, ctx: &mut SimContext) -> AppOutput {
        match self {
            Application::EchoClient(client) => client.send_next(ctx),
            Application::EchoServer(_) => AppOutput::default(),
        }
    }

    /// Stop the application; later wake-ups and packets are ignored.
    pub fn stop(&mut self) {
        match self {
            Application::EchoClient(client) => client.running = false,
            Application::EchoServer(server) => server.listening = false,
        }
    }

    /// A packet addressed to [`Application::local_port`] arrived.
    pub fn receive(&mut self, packet: &Packet, ctx: &mut SimContext) -> AppOutput {
        match self {
            Application::EchoClient(client) => client.receive(packet, ctx),
            Application::EchoServer(server) => server.receive(packet, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manet_common::{EntityId, EventPayload};
    use manet_packet::EPHEMERAL_PORT_START;

    fn client_addr() -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, 1)
    }

    fn server_addr() -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, 2)
    }

    fn advance_to(ctx: &mut SimContext, at: SimTime) {
        ctx.post_at(at, vec![EntityId(0)], EventPayload::Timer { timer_id: 0 })
            .unwrap();
        while ctx.scheduler_mut().pop_next().is_some() {}
    }

    #[test]
    fn test_client_sends_max_packets_at_interval() {
        let mut ctx = SimContext::new(1);
        let mut app = Application::EchoClient(EchoClient::new(
            EchoClientConfig::default(),
            NodeId(0),
            client_addr(),
            EPHEMERAL_PORT_START,
        ));
        assert_eq!(app.start_time(), SimTime::from_secs(2.0));

        advance_to(&mut ctx, app.start_time());
        let mut output = app.start(&mut ctx);
        let mut sent = Vec::new();
        loop {
            sent.extend(output.packets.drain(..).map(|p| (ctx.time(), p)));
            let Some(at) = output.wake_at else { break };
            advance_to(&mut ctx, at);
            output = app.wake(&mut ctx);
        }

        assert_eq!(sent.len(), 10);
        assert_eq!(sent[0].0, SimTime::from_secs(2.0));
        assert_eq!(sent[9].0, SimTime::from_secs(11.0));
        let (_, first) = &sent[0];
        assert_eq!(first.size(), 1052);
        assert_eq!(first.destination, server_addr());
        assert_eq!(first.destination_port, 9);
        assert_eq!(first.source_port, EPHEMERAL_PORT_START);
        let uids: std::collections::BTreeSet<u64> = sent.iter().map(|(_, p)| p.uid).collect();
        assert_eq!(uids.len(), 10);
    }

    #[test]
    fn test_client_stops_before_max_packets() {
        let mut ctx = SimContext::new(1);
        let config = EchoClientConfig {
            start_s: 0.0,
            stop_s: 2.5,
            ..Default::default()
        };
        let mut app = Application::EchoClient(EchoClient::new(config, NodeId(0), client_addr(), 49153));
        let mut output = app.start(&mut ctx);
        let mut count = output.packets.len();
        while let Some(at) = output.wake_at {
            advance_to(&mut ctx, at);
            output = app.wake(&mut ctx);
            count += output.packets.len();
        }
        // Sends at 0, 1 and 2 s.
        assert_eq!(count, 3);
    }

    #[test]
    fn test_server_echoes_to_sender() {
        let mut ctx = SimContext::new(1);
        let mut app = Application::EchoServer(EchoServer::new(
            EchoServerConfig::default(),
            NodeId(1),
            server_addr(),
        ));
        let request = Packet::udp(
            7,
            (client_addr(), 49153),
            (server_addr(), 9),
            Payload::Data { len: 1024 },
        );

        // Not started yet.
        assert!(app.receive(&request, &mut ctx).packets.is_empty());

        app.start(&mut ctx);
        let output = app.receive(&request, &mut ctx);
        assert_eq!(output.packets.len(), 1);
        let reply = &output.packets[0];
        assert_eq!(reply.destination, client_addr());
        assert_eq!(reply.destination_port, 49153);
        assert_eq!(reply.source_port, 9);
        assert_eq!(reply.size(), request.size());
        assert_ne!(reply.uid, request.uid);

        app.stop();
        assert!(app.receive(&request, &mut ctx).packets.is_empty());
        match app {
            Application::EchoServer(server) => assert_eq!(server.served(), 1),
            Application::EchoClient(_) => unreachable!(),
        }
    }

    #[test]
    fn test_client_counts_replies_while_running() {
        let mut ctx = SimContext::new(1);
        let mut client = EchoClient::new(EchoClientConfig::default(), NodeId(0), client_addr(), 49153);
        let reply = Packet::udp(
            3,
            (server_addr(), 9),
            (client_addr(), 49153),
            Payload::Data { len: 1024 },
        );
        client.running = true;
        client.receive(&reply, &mut ctx);
        client.running = false;
        client.receive(&reply, &mut ctx);
        assert_eq!(client.received(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(EchoClientConfig::default().validate().is_ok());
        assert!(EchoServerConfig::default().validate().is_ok());
        let bad = EchoClientConfig {
            interval_s: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = EchoServerConfig {
            start_s: 5.0,
            stop_s: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_rejects_unbounded_values() {
        for interval_s in [f64::INFINITY, f64::NAN] {
            let bad = EchoClientConfig {
                interval_s,
                ..Default::default()
            };
            assert!(bad.validate().is_err(), "interval {}", interval_s);
        }
        let bad = EchoClientConfig {
            packet_size: u32::MAX,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let largest = EchoClientConfig {
            packet_size: MAX_UDP_PAYLOAD,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
        let bad = EchoServerConfig {
            stop_s: f64::INFINITY,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_huge_interval_sends_once() {
        let config = EchoClientConfig {
            interval_s: 1.0e12,
            ..Default::default()
        };
        let mut ctx = SimContext::new(1);
        let mut client = Application::EchoClient(EchoClient::new(
            config,
            NodeId(0),
            Ipv4Addr::new(10, 1, 1, 1),
            49153,
        ));
        let output = client.start(&mut ctx);
        assert_eq!(output.packets.len(), 1);
        assert_eq!(output.wake_at, None);
    }
}
