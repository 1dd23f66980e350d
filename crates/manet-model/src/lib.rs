//! # manet-model
//!
//! YAML scenario loading and simulation building for the MANET simulator.
//!
//! This crate provides:
//! - Typed scenario configuration ([`ScenarioConfig`]) whose defaults
//!   reproduce the five-node OLSR echo scenario
//! - Scenario loading from files and strings, with validation
//! - Simulation building: entities, initial events and node information
//!
//! Every section of the YAML file is optional; omitted fields take their
//! default values and unknown fields are rejected.

use manet_apps::{Application, EchoClient, EchoClientConfig, EchoServer, EchoServerConfig};
use manet_common::{Entity, EntityId, EntityRegistry, Event, EventId, EventPayload, NodeId, Position, SimTime};
use manet_mobility::{MobilityConfig, MobilityError, MobilityModel};
use manet_node::{AddressPlan, Node};
use manet_olsr::OlsrConfig;
use manet_packet::EPHEMERAL_PORT_START;
use manet_wifi::{Channel, ChannelConfig, MacConfig, PropagationConfig, PropagationModel, WifiMac, WifiStandard};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid scenario parameters.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Mobility model could not be created.
    #[error("Mobility error: {0}")]
    Mobility(#[from] MobilityError),
}

// ============================================================================
// Scenario Configuration
// ============================================================================

/// Global simulation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Seed of the simulation RNG.
    pub seed: u64,
    /// Simulation stop time in seconds.
    pub stop_time_s: f64,
    /// Number of nodes.
    pub node_count: usize,
    /// Descriptions of the first nodes; the rest are named `Node <i>`.
    pub node_names: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            seed: 1,
            stop_time_s: 30.0,
            node_count: 5,
            node_names: vec![
                "Source Node".to_string(),
                "Destination Node".to_string(),
                "Relay Node 1".to_string(),
                "Relay Node 2".to_string(),
                "Relay Node 3".to_string(),
            ],
        }
    }
}

/// Wi-Fi PHY/MAC and channel parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiConfig {
    /// 802.11 standard.
    pub standard: WifiStandard,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Minimum received power that decodes.
    pub rx_sensitivity_dbm: f64,
    /// Minimum received power that marks the medium busy.
    pub cca_threshold_dbm: f64,
    /// Frames weaker than this are not delivered at all.
    pub interference_threshold_dbm: f64,
    /// Retransmissions of an unacknowledged unicast frame.
    pub max_retries: u32,
    /// Busy-medium backoffs before a frame is dropped.
    pub max_access_attempts: u32,
    /// Transmit queue capacity.
    pub queue_limit: usize,
    /// Propagation loss and delay.
    pub propagation: PropagationConfig,
}

impl Default for WifiConfig {
    fn default() -> Self {
        let mac = MacConfig::default();
        WifiConfig {
            standard: WifiStandard::Ieee80211n,
            tx_power_dbm: mac.tx_power_dbm,
            rx_sensitivity_dbm: mac.rx_sensitivity_dbm,
            cca_threshold_dbm: mac.cca_threshold_dbm,
            interference_threshold_dbm: ChannelConfig::default().interference_threshold_dbm,
            max_retries: mac.max_retries,
            max_access_attempts: mac.max_access_attempts,
            queue_limit: mac.queue_limit,
            propagation: PropagationConfig::default(),
        }
    }
}

impl WifiConfig {
    /// MAC configuration derived from these parameters.
    pub fn mac_config(&self) -> MacConfig {
        MacConfig {
            phy: self.standard.phy_params(),
            tx_power_dbm: self.tx_power_dbm,
            rx_sensitivity_dbm: self.rx_sensitivity_dbm,
            cca_threshold_dbm: self.cca_threshold_dbm,
            max_retries: self.max_retries,
            max_access_attempts: self.max_access_attempts,
            queue_limit: self.queue_limit,
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.propagation.validate()?;
        for (name, value) in [
            ("tx_power_dbm", self.tx_power_dbm),
            ("rx_sensitivity_dbm", self.rx_sensitivity_dbm),
            ("cca_threshold_dbm", self.cca_threshold_dbm),
            ("interference_threshold_dbm", self.interference_threshold_dbm),
        ] {
            if !value.is_finite() {
                return Err(format!("{} must be finite, got {}", name, value));
            }
        }
        if self.interference_threshold_dbm > self.rx_sensitivity_dbm {
            return Err(format!(
                "interference threshold {} dBm is above the receiver sensitivity {} dBm",
                self.interference_threshold_dbm, self.rx_sensitivity_dbm
            ));
        }
        if self.queue_limit == 0 {
            return Err("queue_limit must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Routing protocols the simulator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingProtocol {
    /// Optimized Link State Routing.
    #[default]
    Olsr,
}

/// Routing parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Protocol.
    pub protocol: RoutingProtocol,
    /// OLSR timers.
    pub olsr: OlsrConfig,
}

/// An application installed on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ApplicationSpec {
    /// UDP echo server.
    UdpEchoServer {
        /// Hosting node index.
        node: u32,
        /// Server parameters.
        #[serde(default)]
        server: EchoServerConfig,
    },
    /// UDP echo client.
    UdpEchoClient {
        /// Hosting node index.
        node: u32,
        /// Client parameters.
        #[serde(default)]
        client: EchoClientConfig,
    },
}

impl ApplicationSpec {
    /// Index of the hosting node.
    pub fn node(&self) -> u32 {
        match self {
            ApplicationSpec::UdpEchoServer { node, .. } | ApplicationSpec::UdpEchoClient { node, .. } => *node,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ApplicationSpec::UdpEchoServer { server, .. } => server.validate(),
            ApplicationSpec::UdpEchoClient { client, .. } => client.validate(),
        }
    }
}

fn default_applications() -> Vec<ApplicationSpec> {
    vec![
        ApplicationSpec::UdpEchoServer {
            node: 1,
            server: EchoServerConfig::default(),
        },
        ApplicationSpec::UdpEchoClient {
            node: 0,
            client: EchoClientConfig::default(),
        },
    ]
}

/// Flow accounting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowMonitorConfig {
    /// Packets still in flight this long after the stop time count as lost.
    pub grace_period_s: f64,
}

impl Default for FlowMonitorConfig {
    fn default() -> Self {
        FlowMonitorConfig { grace_period_s: 1.0 }
    }
}

/// Trace parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Interval of position snapshots in seconds; null disables them.
    pub position_poll_interval_s: Option<f64>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            position_poll_interval_s: Some(1.0),
        }
    }
}

/// A complete scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Global parameters.
    pub simulation: SimulationConfig,
    /// IPv4 subnet of the nodes.
    pub addressing: AddressPlan,
    /// Placement and movement.
    pub mobility: MobilityConfig,
    /// Wi-Fi stack.
    pub wifi: WifiConfig,
    /// Routing protocol.
    pub routing: RoutingConfig,
    /// Installed applications.
    pub applications: Vec<ApplicationSpec>,
    /// Flow accounting.
    pub flow_monitor: FlowMonitorConfig,
    /// Trace output.
    pub trace: TraceConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            simulation: SimulationConfig::default(),
            addressing: AddressPlan::default(),
            mobility: MobilityConfig::default(),
            wifi: WifiConfig::default(),
            routing: RoutingConfig::default(),
            applications: default_applications(),
            flow_monitor: FlowMonitorConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl ScenarioConfig {
    /// Check every section; the first problem found is reported.
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |section: &str, message: String| ModelError::Configuration(format!("{}: {}", section, message));
        let sim = &self.simulation;

        if sim.node_count == 0 {
            return Err(invalid("simulation", "at least one node is required".to_string()));
        }
        if !(sim.stop_time_s > 0.0) || !sim.stop_time_s.is_finite() {
            return Err(invalid(
                "simulation",
                format!("stop_time_s must be positive, got {}", sim.stop_time_s),
            ));
        }
        if sim.node_names.len() > sim.node_count {
            return Err(invalid(
                "simulation",
                format!("{} node names for {} nodes", sim.node_names.len(), sim.node_count),
            ));
        }
        self.addressing
            .validate(sim.node_count)
            .map_err(|e| invalid("addressing", e))?;
        self.mobility
            .validate()
            .map_err(|e| invalid("mobility", e.to_string()))?;
        self.wifi.validate().map_err(|e| invalid("wifi", e))?;
        self.routing.olsr.validate().map_err(|e| invalid("routing", e))?;

        for (index, app) in self.applications.iter().enumerate() {
            let section = format!("applications[{}]", index);
            if app.node() as usize >= sim.node_count {
                return Err(invalid(
                    &section,
                    format!("node {} does not exist ({} nodes)", app.node(), sim.node_count),
                ));
            }
            app.validate().map_err(|e| invalid(&section, e))?;
        }

        if !(self.flow_monitor.grace_period_s >= 0.0) || !self.flow_monitor.grace_period_s.is_finite() {
            return Err(invalid(
                "flow_monitor",
                format!("grace_period_s must be >= 0, got {}", self.flow_monitor.grace_period_s),
            ));
        }
        if let Some(interval) = self.trace.position_poll_interval_s {
            if !(interval > 0.0) || !interval.is_finite() {
                return Err(invalid(
                    "trace",
                    format!("position_poll_interval_s must be positive, got {}", interval),
                ));
            }
        }
        Ok(())
    }

    /// Name of a node.
    pub fn node_name(&self, node: NodeId) -> String {
        self.simulation
            .node_names
            .get(node.index())
            .cloned()
            .unwrap_or_else(|| format!("Node {}", node.0))
    }

    /// Stop time.
    pub fn stop_time(&self) -> SimTime {
        SimTime::from_secs(self.simulation.stop_time_s)
    }

    /// Grace period of flow accounting.
    pub fn grace_period(&self) -> SimTime {
        SimTime::from_secs(self.flow_monitor.grace_period_s)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String, ModelError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// ============================================================================
// Scenario Loading
// ============================================================================

/// Load and validate a scenario file.
pub fn load_scenario(path: &Path) -> Result<ScenarioConfig, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_scenario_from_str(&yaml)
}

/// Parse and validate a scenario from a YAML string.
pub fn load_scenario_from_str(yaml: &str) -> Result<ScenarioConfig, ModelError> {
    let config: ScenarioConfig = if yaml.trim().is_empty() {
        ScenarioConfig::default()
    } else {
        serde_yaml::from_str(yaml)?
    };
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Information about a node for display and reporting.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node index.
    pub node: NodeId,
    /// Description from the scenario.
    pub name: String,
    /// IPv4 address.
    pub address: Ipv4Addr,
    /// Entity ID of the MAC entity.
    pub mac_entity: EntityId,
    /// Entity ID of the IP/routing entity.
    pub node_entity: EntityId,
    /// Grid position at time zero.
    pub initial_position: Position,
}

/// Result of building a simulation from a scenario.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node, indexed by node.
    pub node_infos: Vec<NodeInfo>,
    /// Entity ID of the shared channel.
    pub channel_entity: EntityId,
    /// Simulation stop time.
    pub stop_time: SimTime,
}

/// Build a simulation from a validated scenario.
///
/// Entity 0 is the channel; node `i` gets MAC entity `2i + 1` and IP entity
/// `2i + 2`.
pub fn build_simulation(config: &ScenarioConfig) -> Result<BuiltSimulation, ModelError> {
    config.validate()?;
    let node_count = config.simulation.node_count;
    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut event_id_counter: u64 = 0;

    let channel_id = EntityId::new(0);
    let mac_id = |i: usize| EntityId::new(2 * i as u64 + 1);
    let node_entity_id = |i: usize| EntityId::new(2 * i as u64 + 2);

    let mac_config = config.wifi.mac_config();
    let mut node_infos = Vec::with_capacity(node_count);
    let mut nodes: Vec<Node> = Vec::with_capacity(node_count);

    for i in 0..node_count {
        let node = NodeId(i as u32);
        let name = config.node_name(node);
        let address = config.addressing.address_of(node);
        entities.register(Box::new(WifiMac::new(
            mac_id(i),
            node,
            mac_config.clone(),
            channel_id,
            node_entity_id(i),
        )));
        nodes.push(Node::new(
            node_entity_id(i),
            node,
            name.clone(),
            config.addressing,
            mac_id(i),
            config.routing.olsr.clone(),
        ));
        node_infos.push(NodeInfo {
            node,
            name,
            address,
            mac_entity: mac_id(i),
            node_entity: node_entity_id(i),
            initial_position: config.mobility.grid.position(i),
        });
    }

    // Clients on the same node get consecutive ephemeral ports.
    let mut next_port = vec![EPHEMERAL_PORT_START; node_count];
    for entry in &config.applications {
        let index = entry.node() as usize;
        let node = NodeId(entry.node());
        let address = node_infos[index].address;
        let application = match entry {
            ApplicationSpec::UdpEchoServer { server, .. } => {
                Application::EchoServer(EchoServer::new(server.clone(), node, address))
            }
            ApplicationSpec::UdpEchoClient { client, .. } => {
                let port = next_port[index];
                next_port[index] = port.wrapping_add(1);
                Application::EchoClient(EchoClient::new(client.clone(), node, address, port))
            }
        };
        debug!(node = %address, app = application.name(), "installing application");
        nodes[index].add_application(application);
    }

    for node in nodes {
        let id = node.entity_id();
        entities.register(Box::new(node));
        initial_events.push(Event {
            id: EventId(event_id_counter),
            time: SimTime::ZERO,
            source: id,
            targets: vec![id],
            payload: EventPayload::Timer {
                timer_id: manet_node::TIMER_START,
            },
        });
        event_id_counter += 1;
    }

    let mobility = MobilityModel::new(config.mobility.clone(), node_count)?;
    let phy = config.wifi.standard.phy_params();
    let propagation = PropagationModel::new(config.wifi.propagation.clone(), phy.frequency_hz);
    let channel_config = ChannelConfig {
        interference_threshold_dbm: config.wifi.interference_threshold_dbm,
        position_poll_interval: config.trace.position_poll_interval_s.map(SimTime::from_secs),
    };
    let macs = (0..node_count).map(mac_id).collect();
    entities.register(Box::new(Channel::new(
        channel_id,
        channel_config,
        mobility,
        propagation,
        macs,
    )));
    initial_events.push(Event {
        id: EventId(event_id_counter),
        time: SimTime::ZERO,
        source: channel_id,
        targets: vec![channel_id],
        payload: EventPayload::Timer {
            timer_id: manet_wifi::channel::TIMER_START,
        },
    });

    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        channel_entity: channel_id,
        stop_time: config.stop_time(),
    })
}
