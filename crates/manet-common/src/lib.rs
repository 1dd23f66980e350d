//! # manet-common
//!
//! Common types and traits for the MANET simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Planar geometry ([`Position`], [`Velocity`])
//! - Entity identification ([`EntityId`], [`NodeId`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Deterministic event ordering ([`scheduler::Scheduler`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`])
//! - Metric definitions ([`metric_defs`])

pub mod metric_defs;
pub mod scheduler;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use thiserror::Error;

pub use manet_packet::{FiveTuple, Packet, Payload};
pub use scheduler::Scheduler;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// An event was scheduled before the current clock.
    #[error("Cannot schedule event at {requested} before current time {now}")]
    InvalidTime {
        /// Requested absolute time.
        requested: SimTime,
        /// Clock at the time of the request.
        now: SimTime,
    },

    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from nanoseconds.
    pub fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float). Negative values clamp to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s.max(0.0) * 1_000_000_000.0).round() as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Add duration to time.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn checked_sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }

    /// Add duration, saturating at [`SimTime::MAX`].
    pub fn saturating_add(&self, duration: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(duration.0))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{:.9}s", self.as_secs_f64())
    }
}

// ============================================================================
// Geometry Types
// ============================================================================

/// Planar position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    /// Euclidean distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    /// Linear interpolation towards `other`; `fraction` is clamped to [0, 1].
    pub fn lerp(&self, other: &Position, fraction: f64) -> Position {
        let t = fraction.clamp(0.0, 1.0);
        Position {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }
}

/// Planar velocity in meters per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    /// X component in m/s.
    pub x: f64,
    /// Y component in m/s.
    pub y: f64,
}

impl Velocity {
    /// Stationary velocity.
    pub const ZERO: Velocity = Velocity { x: 0.0, y: 0.0 };

    /// Speed magnitude in m/s.
    pub fn speed(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

/// Index of a node in the scenario (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    /// Index into per-node vectors.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Frame Types
// ============================================================================

/// Link-layer destination of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacDestination {
    /// A single receiver.
    Unicast(NodeId),
    /// Every node in range.
    Broadcast,
}

impl MacDestination {
    /// Returns true if a frame with this destination is addressed to `node`.
    pub fn accepts(&self, node: NodeId) -> bool {
        match self {
            MacDestination::Unicast(dest) => *dest == node,
            MacDestination::Broadcast => true,
        }
    }
}

/// Frame contents.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// A data frame carrying an IP packet.
    Data(Packet),
    /// Acknowledgment of the data frame with the given uid.
    Ack {
        /// Uid of the acknowledged data frame.
        acked_uid: u64,
    },
}

/// A frame on the air.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame uid (retransmissions reuse the uid of the original).
    pub uid: u64,
    /// Transmitting node.
    pub sender: NodeId,
    /// Link-layer destination.
    pub destination: MacDestination,
    /// Frame contents.
    pub kind: FrameKind,
    /// Size on the air in bytes (MAC header and FCS included).
    pub size_bytes: u32,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
}

impl Frame {
    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self.kind {
            FrameKind::Data(_) => "data",
            FrameKind::Ack { .. } => "ack",
        }
    }

    /// Returns true if this frame is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.destination, MacDestination::Broadcast)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event; doubles as the cancellation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID, assigned in insertion order.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Transmit air event - a MAC starts putting a frame on the air.
/// Directed to the Channel entity which routes to receivers in range.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Transmitting MAC entity.
    pub mac_id: EntityId,
    /// The frame being transmitted.
    pub frame: Frame,
    /// Airtime of the frame.
    pub duration: SimTime,
}

/// Receive air event - sent from the Channel entity to a receiving MAC.
/// Arrives when the first bit reaches the receiver.
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// MAC entity that transmitted.
    pub source_mac: EntityId,
    /// The frame being received.
    pub frame: Frame,
    /// Received power in dBm.
    pub rx_power_dbm: f64,
    /// Distance between the two nodes at transmission time.
    pub distance_m: f64,
    /// When the last bit arrives.
    pub end_time: SimTime,
}

/// Outcome of a reception attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionStatus {
    /// Received intact.
    Ok,
    /// Destroyed by an overlapping frame or our own transmission.
    Collided,
    /// Below receiver sensitivity.
    Weak,
}

impl ReceptionStatus {
    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            ReceptionStatus::Ok => "ok",
            ReceptionStatus::Collided => "collided",
            ReceptionStatus::Weak => "weak",
        }
    }
}

/// Observation of a finished reception attempt (for tracing and statistics).
#[derive(Debug, Clone)]
pub struct FrameReceivedEvent {
    /// Receiving node.
    pub node: NodeId,
    /// The frame.
    pub frame: Frame,
    /// Received power in dBm.
    pub rx_power_dbm: f64,
    /// Reception outcome.
    pub status: ReceptionStatus,
    /// When the first bit arrived.
    pub start_time: SimTime,
}

/// IP layer requests the MAC to send a packet.
#[derive(Debug, Clone)]
pub struct MacTxRequestEvent {
    /// The packet to send.
    pub packet: Packet,
    /// Link-layer next hop.
    pub destination: MacDestination,
}

/// MAC delivers a received packet to the IP layer.
#[derive(Debug, Clone)]
pub struct MacRxPacketEvent {
    /// The received packet.
    pub packet: Packet,
    /// Link-layer sender.
    pub from: NodeId,
}

/// Why the MAC gave up on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacFailureReason {
    /// No ACK after the maximum number of retransmissions.
    RetryExhausted,
    /// Medium stayed busy for the maximum number of access attempts.
    ChannelBusy,
    /// Transmit queue full.
    QueueFull,
}

impl MacFailureReason {
    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            MacFailureReason::RetryExhausted => "retry_exhausted",
            MacFailureReason::ChannelBusy => "channel_busy",
            MacFailureReason::QueueFull => "queue_full",
        }
    }
}

/// MAC reports a frame it gave up on.
#[derive(Debug, Clone)]
pub struct MacTxFailedEvent {
    /// The packet that was not delivered.
    pub packet: Packet,
    /// Link-layer next hop it was addressed to.
    pub destination: MacDestination,
    /// Failure reason.
    pub reason: MacFailureReason,
}

/// A node started a new movement leg or stopped.
#[derive(Debug, Clone)]
pub struct CourseChangeEvent {
    /// The node.
    pub node: NodeId,
    /// Position at the change.
    pub position: Position,
    /// New velocity.
    pub velocity: Velocity,
}

/// Periodic snapshot of every node's position.
#[derive(Debug, Clone)]
pub struct PositionSnapshotEvent {
    /// Positions indexed by node.
    pub positions: Vec<(NodeId, Position)>,
}

/// Why the IP layer discarded a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// No routing table entry for the destination.
    NoRoute,
    /// TTL reached zero while forwarding.
    TtlExpired,
    /// The MAC could not deliver the frame.
    MacFailure(MacFailureReason),
}

impl DropReason {
    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::NoRoute => "no_route",
            DropReason::TtlExpired => "ttl_expired",
            DropReason::MacFailure(reason) => reason.as_label(),
        }
    }
}

/// What happened to a packet at the IP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpEventKind {
    /// Originated by a local application.
    Send,
    /// Relayed towards its destination.
    Forward,
    /// Delivered to the local host (final destination).
    Deliver,
    /// Discarded.
    Drop(DropReason),
}

/// Observation of an IP-layer packet event (consumed by flow accounting).
#[derive(Debug, Clone)]
pub struct IpEvent {
    /// Node where the event happened.
    pub node: NodeId,
    /// The packet.
    pub packet: Packet,
    /// What happened.
    pub kind: IpEventKind,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Channel Events ===========
    /// A MAC started transmitting (directed to the Channel entity).
    TransmitAir(TransmitAirEvent),
    /// A frame reaches a receiver (from the Channel entity to a MAC).
    ReceiveAir(ReceiveAirEvent),

    // =========== MAC <-> IP Events ===========
    /// IP layer requests transmission.
    MacTxRequest(MacTxRequestEvent),
    /// MAC has a packet for the IP layer.
    MacRxPacket(MacRxPacketEvent),
    /// MAC gave up on a packet.
    MacTxFailed(MacTxFailedEvent),

    // =========== Observations ===========
    /// Reception attempt finished.
    FrameReceived(FrameReceivedEvent),
    /// Node changed course.
    CourseChange(CourseChangeEvent),
    /// Periodic position poll.
    PositionSnapshot(PositionSnapshotEvent),
    /// IP-layer packet event.
    Ip(IpEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// Entity-defined timer ID.
        timer_id: u64,
    },
}

impl EventPayload {
    /// Short name of the payload variant for logs and traces.
    pub fn kind_label(&self) -> &'static str {
        match self {
            EventPayload::TransmitAir(_) => "transmit_air",
            EventPayload::ReceiveAir(_) => "receive_air",
            EventPayload::MacTxRequest(_) => "mac_tx_request",
            EventPayload::MacRxPacket(_) => "mac_rx_packet",
            EventPayload::MacTxFailed(_) => "mac_tx_failed",
            EventPayload::FrameReceived(_) => "frame_received",
            EventPayload::CourseChange(_) => "course_change",
            EventPayload::PositionSnapshot(_) => "position_snapshot",
            EventPayload::Ip(_) => "ip",
            EventPayload::Timer { .. } => "timer",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Owns the scheduler (and with it the simulation clock) and the simulation
/// RNG. Entities never keep their own clock.
pub struct SimContext {
    scheduler: Scheduler,
    rng: ChaCha8Rng,
    source_entity: EntityId,
    next_uid: u64,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            scheduler: Scheduler::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            source_entity: EntityId(0),
            next_uid: 0,
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Get the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get mutable access to the scheduler (used by event loop).
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.scheduler
            .schedule_in(delay, self.source_entity, targets, payload)
    }

    /// Post an event at an absolute time.
    pub fn post_at(
        &mut self,
        time: SimTime,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<EventId, SimError> {
        self.scheduler
            .schedule(time, self.source_entity, targets, payload)
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Post an event with no targets, seen only by the event loop's observers.
    pub fn post_observation(&mut self, payload: EventPayload) -> EventId {
        self.post_immediate(Vec::new(), payload)
    }

    /// Cancel a pending event. Returns false if it was already dispatched.
    pub fn cancel_event(&mut self, id: EventId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Allocate a simulation-wide unique packet/frame uid.
    pub fn next_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;

    /// Access the concrete entity for inspection.
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get an entity by ID, downcast to its concrete type.
    pub fn get_as<T: 'static>(&self, id: EntityId) -> Option<&T> {
        self.get(id).and_then(|e| e.as_any().downcast_ref::<T>())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
