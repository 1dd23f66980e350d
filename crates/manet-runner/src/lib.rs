//! # manet-runner library
//!
//! Library interface of the MANET simulation runner.
//!
//! The [`EventLoop`] pops events from the scheduler owned by the simulation
//! context, dispatches them to their target entities and observes every
//! event on the way: IP observations feed the [`FlowMonitor`], frame and
//! mobility observations become trace records, and all of them update the
//! run statistics.
//!
//! ## Stop time and grace period
//!
//! Events are dispatched up to and including the stop time. The loop then
//! keeps running for the scenario's grace period so that packets already in
//! flight can still arrive; packets originated during that drain phase are
//! not accounted. Whatever is still in flight afterwards is counted lost, so
//! every flow satisfies `rxPackets + lostPackets == txPackets`.

pub mod flow_monitor;
pub mod metrics_export;

pub use flow_monitor::{FlowId, FlowMonitor, FlowRecord, FlowStats};
pub use manet_common::SimTime;
pub use manet_model::{build_simulation, load_scenario, load_scenario_from_str, BuiltSimulation, ScenarioConfig};

use manet_common::metric_defs::SIMULATION_STEP_TIME;
use manet_common::{
    EntityRegistry, Event, EventPayload, IpEventKind, MacDestination, NodeId, SimContext, SimError,
};
use manet_model::NodeInfo;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] manet_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    /// Frames put on the air by this node.
    pub tx_frames: u64,
    /// Frames this node received intact.
    pub rx_frames: u64,
    /// Frames lost to collisions at this node.
    pub collisions: u64,
    /// Packets originated by local applications.
    pub packets_sent: u64,
    /// Packets relayed by this node.
    pub packets_forwarded: u64,
    /// Packets delivered to this node's host.
    pub packets_delivered: u64,
    /// Packets dropped at this node.
    pub packets_dropped: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Frames put on the air.
    pub frames_transmitted: u64,
    /// Frames received intact.
    pub frames_received: u64,
    /// Frames lost to collisions.
    pub frames_collided: u64,
    /// Frames below receiver sensitivity.
    pub frames_weak: u64,
    /// Unicast packets originated by applications.
    pub packets_sent: u64,
    /// Packets relayed.
    pub packets_forwarded: u64,
    /// Packets delivered at their destination host.
    pub packets_delivered: u64,
    /// Packets dropped at the IP layer.
    pub packets_dropped: u64,
    /// Packets still in flight at the end of the run, counted lost.
    pub packets_expired: u64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback during simulation.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// Target simulation time (end time).
    pub target_time: SimTime,
    /// Elapsed wall clock time since start.
    pub wall_elapsed: Duration,
    /// Total events processed so far.
    pub events_processed: u64,
    /// Progress as a percentage (0.0 to 100.0).
    pub progress_percent: f64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// Why a position record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionReason {
    /// The node started a new leg or stopped.
    CourseChange,
    /// Periodic poll.
    Poll,
}

/// Payload types for different trace events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    /// Node position.
    #[serde(rename = "POSITION")]
    Position {
        /// Record cause.
        reason: PositionReason,
        /// X coordinate in meters.
        x: f64,
        /// Y coordinate in meters.
        y: f64,
        /// Speed in m/s, only for course changes.
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    /// A frame put on the air.
    #[serde(rename = "FRAME")]
    FrameTx {
        /// Always "TX".
        direction: &'static str,
        /// Frame uid.
        frame_uid: u64,
        /// "data" or "ack".
        frame_type: &'static str,
        /// Link-layer destination node, absent for broadcasts.
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<u32>,
        /// Size on the air in bytes.
        size_bytes: u32,
        /// Transmit power.
        tx_power_dbm: f64,
        /// Airtime in seconds.
        duration_s: f64,
    },
    /// A finished reception attempt.
    #[serde(rename = "FRAME")]
    FrameRx {
        /// Always "RX".
        direction: &'static str,
        /// Frame uid.
        frame_uid: u64,
        /// "data" or "ack".
        frame_type: &'static str,
        /// Transmitting node.
        sender: u32,
        /// Received power.
        rx_power_dbm: f64,
        /// "ok", "collided" or "weak".
        status: &'static str,
    },
    /// An IP-layer packet event.
    #[serde(rename = "PACKET")]
    Packet {
        /// "send", "forward", "deliver" or "drop".
        event: &'static str,
        /// Drop reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
        /// Packet uid.
        uid: u64,
        /// Source address.
        source: String,
        /// Destination address.
        destination: String,
        /// Size in bytes, IP header included.
        size_bytes: u32,
        /// Remaining TTL.
        ttl: u8,
    },
}

/// A trace entry for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// Simulation time in seconds.
    pub time_s: f64,
    /// Node name.
    pub origin: String,
    /// Node index.
    pub origin_id: u32,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Trace recorder for outputting simulation events.
///
/// Entries are kept in memory and written as one JSON array on flush.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Record an event.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Recorded entries.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Flush all entries to output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    stats: SimulationStats,
    node_stats: BTreeMap<u32, NodeStats>,
    /// Entity ID to node name, for step-time metric labels.
    entity_to_name: HashMap<u64, String>,
    flow_monitor: FlowMonitor,
    grace_period: SimTime,
    draining: bool,
}

impl EventLoop {
    /// Create a new event loop and seed it with the simulation's initial events.
    pub fn new(
        simulation: BuiltSimulation,
        seed: u64,
        grace_period: SimTime,
        trace_output: Option<Box<dyn Write>>,
    ) -> Result<Self, RunnerError> {
        let mut context = SimContext::new(seed);
        for event in &simulation.initial_events {
            context.scheduler_mut().schedule(
                event.time,
                event.source,
                event.targets.clone(),
                event.payload.clone(),
            )?;
        }

        let mut node_stats = BTreeMap::new();
        let mut entity_to_name = HashMap::new();
        for node_info in &simulation.node_infos {
            node_stats.insert(node_info.node.0, NodeStats::default());
            entity_to_name.insert(node_info.mac_entity.0, node_info.name.clone());
            entity_to_name.insert(node_info.node_entity.0, node_info.name.clone());
        }

        Ok(EventLoop {
            simulation,
            context,
            trace: TraceRecorder::new(trace_output),
            stats: SimulationStats::default(),
            node_stats,
            entity_to_name,
            flow_monitor: FlowMonitor::new(),
            grace_period,
            draining: false,
        })
    }

    /// Dispatch an event to its target entities, recording per-entity step time.
    fn dispatch_event_with_metrics(&mut self, event: &Event) -> Result<(), SimError> {
        for target in &event.targets {
            let Some(entity) = self.simulation.entities.get_mut(*target) else {
                return Err(SimError::EntityNotFound(*target));
            };
            self.context.set_source(*target);

            let step_start = Instant::now();
            entity.handle_event(event, &mut self.context)?;
            let step_elapsed = step_start.elapsed();

            let name = self
                .entity_to_name
                .get(&target.0)
                .cloned()
                .unwrap_or_else(|| "channel".to_string());
            let labels = [("node", name)];
            metrics::histogram!(SIMULATION_STEP_TIME.name, &labels).record(step_elapsed.as_micros() as f64);
        }
        Ok(())
    }

    /// Run the simulation until `duration`, then drain for the grace period.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(duration, None, |_, _, _| {})
    }

    /// Run the simulation with an optional stop flag and a progress callback.
    ///
    /// The callback is invoked about every `5 s` of wall time and once more
    /// at the end with `is_final` set.
    pub fn run_with_progress<F>(
        &mut self,
        duration: SimTime,
        stop_flag: Option<Arc<AtomicBool>>,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Self, ProgressInfo, bool), // bool = is_final
    {
        let start_time = Instant::now();
        let progress_interval = Duration::from_secs(5);
        let mut last_progress = Instant::now();

        info!(stop_time = %duration, "simulation started");
        self.context.scheduler_mut().set_stop_time(duration);
        self.draining = false;
        let mut interrupted = self.process_events(stop_flag.as_deref(), |event_loop| {
            if last_progress.elapsed() >= progress_interval {
                let progress = event_loop.progress(duration, start_time.elapsed());
                on_progress(event_loop, progress, false);
                last_progress = Instant::now();
            }
        })?;

        if !interrupted && self.grace_period > SimTime::ZERO {
            debug!(grace = %self.grace_period, in_flight = self.flow_monitor.in_flight(), "draining");
            self.context
                .scheduler_mut()
                .set_stop_time(duration.saturating_add(self.grace_period));
            self.draining = true;
            interrupted = self.process_events(stop_flag.as_deref(), |_| {})?;
        }
        if interrupted {
            info!(time = %self.context.time(), "simulation interrupted");
        }

        let now = self.context.time();
        self.stats.packets_expired = self.flow_monitor.expire_in_flight(now) as u64;
        self.stats.simulation_time_us = now.as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;

        let mut progress = self.progress(duration, start_time.elapsed());
        progress.progress_percent = 100.0;
        on_progress(self, progress, true);

        self.trace.flush()?;
        info!(
            events = self.stats.total_events,
            flows = self.flow_monitor.flow_count(),
            "simulation finished"
        );
        Ok(self.stats.clone())
    }

    /// Dispatch events until the scheduler's stop time. Returns true if the
    /// stop flag ended the loop.
    fn process_events<P>(&mut self, stop_flag: Option<&AtomicBool>, mut after_event: P) -> Result<bool, RunnerError>
    where
        P: FnMut(&Self),
    {
        loop {
            // Checked before popping so an interrupted run keeps its next event queued.
            if stop_flag.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Ok(true);
            }
            let Some(event) = self.context.scheduler_mut().pop_next() else {
                break;
            };
            self.dispatch_event_with_metrics(&event)?;
            self.stats.total_events += 1;
            self.observe(&event);
            after_event(self);
        }
        Ok(false)
    }

    fn progress(&self, target: SimTime, wall_elapsed: Duration) -> ProgressInfo {
        let sim_time = self.context.time();
        let progress_percent = if target > SimTime::ZERO {
            (sim_time.as_secs_f64() / target.as_secs_f64() * 100.0).min(100.0)
        } else {
            100.0
        };
        ProgressInfo {
            sim_time,
            target_time: target,
            wall_elapsed,
            events_processed: self.stats.total_events,
            progress_percent,
        }
    }

    fn node_name(&self, node: NodeId) -> String {
        self.simulation
            .node_infos
            .get(node.index())
            .map(|info| info.name.clone())
            .unwrap_or_else(|| format!("Node {}", node.0))
    }

    fn record(&mut self, time: SimTime, node: NodeId, payload: TracePayload) {
        let entry = TraceEntry {
            time_s: time.as_secs_f64(),
            origin: self.node_name(node),
            origin_id: node.0,
            payload,
        };
        self.trace.record(entry);
    }

    /// Update statistics, flow accounting and the trace from one event.
    fn observe(&mut self, event: &Event) {
        let time = event.time;
        match &event.payload {
            EventPayload::TransmitAir(tx) => {
                let frame = &tx.frame;
                self.stats.frames_transmitted += 1;
                if let Some(stats) = self.node_stats.get_mut(&frame.sender.0) {
                    stats.tx_frames += 1;
                }
                let destination = match frame.destination {
                    MacDestination::Unicast(node) => Some(node.0),
                    MacDestination::Broadcast => None,
                };
                self.record(
                    time,
                    frame.sender,
                    TracePayload::FrameTx {
                        direction: "TX",
                        frame_uid: frame.uid,
                        frame_type: frame.as_label(),
                        destination,
                        size_bytes: frame.size_bytes,
                        tx_power_dbm: frame.tx_power_dbm,
                        duration_s: tx.duration.as_secs_f64(),
                    },
                );
            }
            EventPayload::FrameReceived(rx) => {
                let node_stats = self.node_stats.get_mut(&rx.node.0);
                match rx.status {
                    manet_common::ReceptionStatus::Ok => {
                        self.stats.frames_received += 1;
                        if let Some(stats) = node_stats {
                            stats.rx_frames += 1;
                        }
                    }
                    manet_common::ReceptionStatus::Collided => {
                        self.stats.frames_collided += 1;
                        if let Some(stats) = node_stats {
                            stats.collisions += 1;
                        }
                    }
                    manet_common::ReceptionStatus::Weak => self.stats.frames_weak += 1,
                }
                self.record(
                    time,
                    rx.node,
                    TracePayload::FrameRx {
                        direction: "RX",
                        frame_uid: rx.frame.uid,
                        frame_type: rx.frame.as_label(),
                        sender: rx.frame.sender.0,
                        rx_power_dbm: rx.rx_power_dbm,
                        status: rx.status.as_label(),
                    },
                );
            }
            EventPayload::CourseChange(change) => {
                self.record(
                    time,
                    change.node,
                    TracePayload::Position {
                        reason: PositionReason::CourseChange,
                        x: change.position.x,
                        y: change.position.y,
                        speed: Some(change.velocity.speed()),
                    },
                );
            }
            EventPayload::PositionSnapshot(snapshot) => {
                for (node, position) in &snapshot.positions {
                    self.record(
                        time,
                        *node,
                        TracePayload::Position {
                            reason: PositionReason::Poll,
                            x: position.x,
                            y: position.y,
                            speed: None,
                        },
                    );
                }
            }
            EventPayload::Ip(ip) => {
                let (label, reason) = match ip.kind {
                    IpEventKind::Send => ("send", None),
                    IpEventKind::Forward => ("forward", None),
                    IpEventKind::Deliver => ("deliver", None),
                    IpEventKind::Drop(reason) => ("drop", Some(reason.as_label())),
                };
                if let Some(stats) = self.node_stats.get_mut(&ip.node.0) {
                    match ip.kind {
                        IpEventKind::Send => stats.packets_sent += 1,
                        IpEventKind::Forward => stats.packets_forwarded += 1,
                        IpEventKind::Deliver => stats.packets_delivered += 1,
                        IpEventKind::Drop(_) => stats.packets_dropped += 1,
                    }
                }
                match ip.kind {
                    IpEventKind::Send => self.stats.packets_sent += 1,
                    IpEventKind::Forward => self.stats.packets_forwarded += 1,
                    IpEventKind::Deliver => self.stats.packets_delivered += 1,
                    IpEventKind::Drop(_) => self.stats.packets_dropped += 1,
                }

                if !(self.draining && ip.kind == IpEventKind::Send) {
                    self.flow_monitor.observe(ip, time);
                }
                self.record(
                    time,
                    ip.node,
                    TracePayload::Packet {
                        event: label,
                        reason,
                        uid: ip.packet.uid,
                        source: ip.packet.source.to_string(),
                        destination: ip.packet.destination.to_string(),
                        size_bytes: ip.packet.size(),
                        ttl: ip.packet.ttl,
                    },
                );
            }
            _ => {}
        }
    }

    /// Flow table ordered by flow id.
    pub fn flows(&self) -> Vec<FlowRecord> {
        self.flow_monitor.records()
    }

    /// The flow monitor.
    pub fn flow_monitor(&self) -> &FlowMonitor {
        &self.flow_monitor
    }

    /// Recorded trace entries.
    pub fn trace_entries(&self) -> &[TraceEntry] {
        self.trace.entries()
    }

    /// Per-node statistics keyed by node index.
    pub fn node_stats(&self) -> &BTreeMap<u32, NodeStats> {
        &self.node_stats
    }

    /// Get the simulation node info.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Simulation entities, for inspecting their state after a run.
    pub fn entities(&self) -> &EntityRegistry {
        &self.simulation.entities
    }

    /// Get current statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Events still queued in the scheduler.
    pub fn pending_events(&self) -> usize {
        self.context.scheduler().pending_count()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Build a scenario and wrap it in an event loop seeded from the scenario.
pub fn create_event_loop(
    config: &ScenarioConfig,
    trace_output: Option<Box<dyn Write>>,
) -> Result<EventLoop, RunnerError> {
    let simulation = build_simulation(config)?;
    EventLoop::new(simulation, config.simulation.seed, config.grace_period(), trace_output)
}

/// Human-readable flow report, one line per flow.
pub fn format_flow_report(flows: &[FlowRecord]) -> String {
    flows.iter().map(|flow| format!("{}\n", flow)).collect()
}

/// Write a value as pretty JSON to a file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), RunnerError> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut file, value)?;
    writeln!(file)?;
    file.flush()?;
    Ok(())
}
