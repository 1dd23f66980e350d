//! Per-node CSMA/CA MAC and half-duplex PHY.
//!
//! The MAC serves one frame at a time from a bounded queue:
//!
//! 1. Wait DIFS plus a random backoff drawn from the contention window.
//! 2. If the medium is busy when the wait ends, double the window and wait
//!    again; give up after `max_access_attempts`.
//! 3. Transmit. Broadcast frames are done once on the air. Unicast data
//!    frames wait for an ACK and are retransmitted (same uid) up to
//!    `max_retries` times.
//!
//! Reception tracks every frame the channel delivers. Overlapping frames
//! destroy each other; frames arriving while transmitting are lost, and
//! starting a transmission destroys frames being received.

use crate::{check_collision, CollisionContext, CollisionResult, PhyParams, WifiStandard, ACK_FRAME_SIZE, DATA_FRAME_OVERHEAD};
use manet_common::metric_defs::{self, MetricLabels};
use manet_common::{
    Entity, EntityId, Event, EventId, EventPayload, Frame, FrameKind, FrameReceivedEvent,
    MacDestination, MacFailureReason, MacRxPacketEvent, MacTxFailedEvent, NodeId, Packet,
    ReceiveAirEvent, ReceptionStatus, SimContext, SimError, SimTime, TransmitAirEvent,
};
use rand::Rng;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Timer ID constants for the MAC entity.
const TIMER_ACCESS: u64 = 1;
const TIMER_TX_END: u64 = 2;
const TIMER_ACK_TIMEOUT: u64 = 3;
const TIMER_SEND_ACK: u64 = 4;
const TIMER_RX_END_BASE: u64 = 0x1000; // reception_id is added to this

/// MAC configuration.
#[derive(Debug, Clone)]
pub struct MacConfig {
    /// PHY timing and rates.
    pub phy: PhyParams,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Minimum power for a frame to decode.
    pub rx_sensitivity_dbm: f64,
    /// Minimum power for a frame to mark the medium busy.
    pub cca_threshold_dbm: f64,
    /// Retransmissions of a unicast frame after the first attempt.
    pub max_retries: u32,
    /// Busy-medium backoffs tolerated before the frame is dropped.
    pub max_access_attempts: u32,
    /// Frames waiting behind the one in service.
    pub queue_limit: usize,
}

impl MacConfig {
    /// Configuration for a standard with default power and retry settings.
    pub fn for_standard(standard: WifiStandard) -> Self {
        MacConfig {
            phy: standard.phy_params(),
            tx_power_dbm: 16.0206,
            rx_sensitivity_dbm: -101.0,
            cca_threshold_dbm: -82.0,
            max_retries: 7,
            max_access_attempts: 10,
            queue_limit: 100,
        }
    }
}

impl Default for MacConfig {
    fn default() -> Self {
        Self::for_standard(WifiStandard::default())
    }
}

/// Transmit-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// Nothing in service.
    Idle,
    /// Waiting for the access timer.
    Contending,
    /// Frame on the air.
    Transmitting,
    /// Unicast frame sent, ACK timeout pending.
    AwaitingAck(EventId),
}

/// The frame currently in service.
#[derive(Debug, Clone)]
struct TxAttempt {
    frame: Frame,
    packet: Packet,
    retries: u32,
    access_attempts: u32,
    cw: u32,
}

/// State of an active reception.
#[derive(Debug, Clone)]
struct ActiveReception {
    frame: Frame,
    start_time: SimTime,
    end_time: SimTime,
    rx_power_dbm: f64,
    collided: bool,
    reception_id: u64,
}

impl ActiveReception {
    fn collision_context(&self) -> CollisionContext {
        CollisionContext {
            start_time: self.start_time,
            end_time: self.end_time,
            frame_uid: self.frame.uid,
        }
    }
}

/// Per-node Wi-Fi MAC entity.
///
/// Accepts [`EventPayload::MacTxRequest`] from the node above it and answers
/// with [`EventPayload::MacRxPacket`] and [`EventPayload::MacTxFailed`].
pub struct WifiMac {
    id: EntityId,
    node: NodeId,
    config: MacConfig,
    channel: EntityId,
    upper: EntityId,

    state: TxState,
    queue: VecDeque<(Packet, MacDestination)>,
    current: Option<TxAttempt>,
    transmitting_until: SimTime,
    /// End of the latest sensed transmission (CCA).
    busy_until: SimTime,
    /// ACK owed to a sender: (acked uid, sender).
    pending_ack: Option<(u64, NodeId)>,

    active_receptions: Vec<ActiveReception>,
    next_reception_id: u64,
    /// Last data frame uid accepted from each sender.
    last_rx_uid: HashMap<NodeId, u64>,

    metric_labels: MetricLabels,
}

impl WifiMac {
    /// Create a MAC for `node`, attached to `channel` and delivering to `upper`.
    pub fn new(id: EntityId, node: NodeId, config: MacConfig, channel: EntityId, upper: EntityId) -> Self {
        WifiMac {
            id,
            node,
            config,
            channel,
            upper,
            state: TxState::Idle,
            queue: VecDeque::new(),
            current: None,
            transmitting_until: SimTime::ZERO,
            busy_until: SimTime::ZERO,
            pending_ack: None,
            active_receptions: Vec::new(),
            next_reception_id: 0,
            last_rx_uid: HashMap::new(),
            metric_labels: MetricLabels::for_node(node.0),
        }
    }

    /// Node this MAC belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// MAC configuration.
    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Frames waiting behind the one in service.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if the radio is on the air at `now`.
    pub fn is_transmitting(&self, now: SimTime) -> bool {
        now < self.transmitting_until
    }

    fn medium_busy(&self, now: SimTime) -> bool {
        now < self.busy_until || self.is_transmitting(now)
    }

    fn frame_labels(&self, frame: &Frame) -> Vec<(&'static str, String)> {
        let mut labels = self.metric_labels.to_labels();
        labels.push(("frame_type", frame.as_label().to_string()));
        labels
    }

    // ------------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------------

    fn handle_tx_request(&mut self, packet: Packet, destination: MacDestination, ctx: &mut SimContext) {
        if self.current.is_some() {
            if self.queue.len() >= self.config.queue_limit {
                debug!(node = %self.node, uid = packet.uid, "transmit queue full");
                self.report_failure(packet, destination, MacFailureReason::QueueFull, ctx);
                return;
            }
            self.queue.push_back((packet, destination));
            return;
        }
        self.begin_service(packet, destination, ctx);
    }

    fn begin_service(&mut self, packet: Packet, destination: MacDestination, ctx: &mut SimContext) {
        let frame = Frame {
            uid: ctx.next_uid(),
            sender: self.node,
            destination,
            size_bytes: packet.size() + DATA_FRAME_OVERHEAD,
            kind: FrameKind::Data(packet.clone()),
            tx_power_dbm: self.config.tx_power_dbm,
        };
        self.current = Some(TxAttempt {
            frame,
            packet,
            retries: 0,
            access_attempts: 0,
            cw: self.config.phy.cw_min,
        });
        self.schedule_access(SimTime::ZERO, ctx);
    }

    fn schedule_access(&mut self, defer: SimTime, ctx: &mut SimContext) {
        let Some(attempt) = self.current.as_ref() else {
            return;
        };
        let cw = attempt.cw;
        let slots: u32 = ctx.rng().gen_range(0..=cw);
        let backoff = SimTime::from_nanos(self.config.phy.slot.as_nanos() * slots as u64);
        let delay = defer + self.config.phy.difs() + backoff;
        self.state = TxState::Contending;
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_ACCESS });
    }

    fn handle_access_timer(&mut self, ctx: &mut SimContext) {
        if self.state != TxState::Contending {
            return;
        }
        let now = ctx.time();
        if self.medium_busy(now) {
            let max_attempts = self.config.max_access_attempts;
            let cw_max = self.config.phy.cw_max;
            let Some(attempt) = self.current.as_mut() else {
                return;
            };
            attempt.access_attempts += 1;
            metrics::counter!(metric_defs::MAC_BACKOFFS.name, &self.metric_labels.to_labels()).increment(1);
            if attempt.access_attempts > max_attempts {
                debug!(node = %self.node, "medium busy, giving up");
                self.finish_current(Some(MacFailureReason::ChannelBusy), ctx);
                return;
            }
            attempt.cw = (attempt.cw * 2 + 1).min(cw_max);
            let defer = self.busy_until.max(self.transmitting_until) - now;
            self.schedule_access(defer, ctx);
            return;
        }
        self.transmit_current(ctx);
    }

    fn transmit_current(&mut self, ctx: &mut SimContext) {
        let Some(attempt) = self.current.as_ref() else {
            return;
        };
        let frame = attempt.frame.clone();
        let rate = if frame.is_broadcast() {
            self.config.phy.basic_rate_bps
        } else {
            self.config.phy.data_rate_bps
        };
        let airtime = self.config.phy.airtime(frame.size_bytes, rate);
        trace!(node = %self.node, uid = frame.uid, retries = attempt.retries, "transmitting data frame");
        self.state = TxState::Transmitting;
        self.put_on_air(frame, airtime, ctx);
        ctx.post_event(airtime, vec![self.id], EventPayload::Timer { timer_id: TIMER_TX_END });
    }

    fn put_on_air(&mut self, frame: Frame, airtime: SimTime, ctx: &mut SimContext) {
        let now = ctx.time();
        self.transmitting_until = now + airtime;
        // Half-duplex: everything being received is lost.
        for reception in &mut self.active_receptions {
            reception.collided = true;
        }

        let labels = self.frame_labels(&frame);
        metrics::counter!(metric_defs::MAC_TX_FRAMES.name, &labels).increment(1);
        metrics::counter!(metric_defs::MAC_TX_AIRTIME.name, &labels).increment(airtime.as_micros());

        ctx.post_immediate(
            vec![self.channel],
            EventPayload::TransmitAir(TransmitAirEvent {
                mac_id: self.id,
                frame,
                duration: airtime,
            }),
        );
    }

    fn handle_tx_end(&mut self, ctx: &mut SimContext) {
        if self.state != TxState::Transmitting {
            return;
        }
        let broadcast = self
            .current
            .as_ref()
            .map(|a| a.frame.is_broadcast())
            .unwrap_or(true);
        if broadcast {
            self.finish_current(None, ctx);
            return;
        }
        let timeout = ctx.post_event(
            self.config.phy.ack_timeout(),
            vec![self.id],
            EventPayload::Timer { timer_id: TIMER_ACK_TIMEOUT },
        );
        self.state = TxState::AwaitingAck(timeout);
    }

    fn handle_ack_timeout(&mut self, ctx: &mut SimContext) {
        if !matches!(self.state, TxState::AwaitingAck(_)) {
            return;
        }
        let max_retries = self.config.max_retries;
        let cw_max = self.config.phy.cw_max;
        let Some(attempt) = self.current.as_mut() else {
            return;
        };
        attempt.retries += 1;
        if attempt.retries > max_retries {
            debug!(node = %self.node, uid = attempt.frame.uid, "retry limit reached");
            self.finish_current(Some(MacFailureReason::RetryExhausted), ctx);
            return;
        }
        attempt.cw = (attempt.cw * 2 + 1).min(cw_max);
        metrics::counter!(metric_defs::MAC_RETRANSMISSIONS.name, &self.metric_labels.to_labels()).increment(1);
        self.schedule_access(SimTime::ZERO, ctx);
    }

    fn handle_ack(&mut self, acked_uid: u64, ctx: &mut SimContext) {
        let TxState::AwaitingAck(timeout) = self.state else {
            return;
        };
        let matches_current = self
            .current
            .as_ref()
            .map(|a| a.frame.uid == acked_uid)
            .unwrap_or(false);
        if !matches_current {
            return;
        }
        ctx.cancel_event(timeout);
        self.finish_current(None, ctx);
    }

    /// End service of the current frame and start the next queued one.
    fn finish_current(&mut self, failure: Option<MacFailureReason>, ctx: &mut SimContext) {
        self.state = TxState::Idle;
        if let Some(attempt) = self.current.take() {
            if let Some(reason) = failure {
                self.report_failure(attempt.packet, attempt.frame.destination, reason, ctx);
            }
        }
        if let Some((packet, destination)) = self.queue.pop_front() {
            self.begin_service(packet, destination, ctx);
        }
    }

    fn report_failure(
        &mut self,
        packet: Packet,
        destination: MacDestination,
        reason: MacFailureReason,
        ctx: &mut SimContext,
    ) {
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::MAC_TX_FAILED.name, &labels).increment(1);
        ctx.post_immediate(
            vec![self.upper],
            EventPayload::MacTxFailed(MacTxFailedEvent {
                packet,
                destination,
                reason,
            }),
        );
    }

    fn send_ack(&mut self, ctx: &mut SimContext) {
        let Some((acked_uid, to)) = self.pending_ack.take() else {
            return;
        };
        if self.is_transmitting(ctx.time()) {
            return;
        }
        let frame = Frame {
            uid: ctx.next_uid(),
            sender: self.node,
            destination: MacDestination::Unicast(to),
            kind: FrameKind::Ack { acked_uid },
            size_bytes: ACK_FRAME_SIZE,
            tx_power_dbm: self.config.tx_power_dbm,
        };
        let airtime = self.config.phy.airtime(ACK_FRAME_SIZE, self.config.phy.basic_rate_bps);
        self.put_on_air(frame, airtime, ctx);
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    fn handle_receive_air(&mut self, rx: &ReceiveAirEvent, ctx: &mut SimContext) {
        let now = ctx.time();
        if rx.rx_power_dbm >= self.config.cca_threshold_dbm {
            self.busy_until = self.busy_until.max(rx.end_time);
        }

        let reception_id = self.next_reception_id;
        self.next_reception_id += 1;
        let mut reception = ActiveReception {
            frame: rx.frame.clone(),
            start_time: now,
            end_time: rx.end_time,
            rx_power_dbm: rx.rx_power_dbm,
            collided: self.is_transmitting(now),
            reception_id,
        };

        let existing: Vec<CollisionContext> = self
            .active_receptions
            .iter()
            .map(ActiveReception::collision_context)
            .collect();
        if let CollisionResult::BothDestroyed(_) = check_collision(&reception.collision_context(), &existing) {
            reception.collided = true;
            for other in &mut self.active_receptions {
                if other.start_time < reception.end_time && other.end_time > reception.start_time {
                    other.collided = true;
                }
            }
        }
        self.active_receptions.push(reception);

        let delay = rx.end_time - now;
        ctx.post_event(
            delay,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RX_END_BASE + reception_id,
            },
        );
    }

    fn handle_rx_end(&mut self, reception_id: u64, ctx: &mut SimContext) {
        let Some(idx) = self
            .active_receptions
            .iter()
            .position(|r| r.reception_id == reception_id)
        else {
            return;
        };
        let reception = self.active_receptions.remove(idx);
        let status = if reception.collided {
            ReceptionStatus::Collided
        } else if !crate::deliverable(reception.rx_power_dbm, self.config.rx_sensitivity_dbm) {
            ReceptionStatus::Weak
        } else {
            ReceptionStatus::Ok
        };

        let labels = self.frame_labels(&reception.frame);
        match status {
            ReceptionStatus::Ok => {
                metrics::counter!(metric_defs::MAC_RX_FRAMES.name, &labels).increment(1);
                metrics::histogram!(metric_defs::MAC_RX_POWER.name, &labels).record(reception.rx_power_dbm);
            }
            ReceptionStatus::Collided => {
                metrics::counter!(metric_defs::MAC_RX_COLLIDED.name, &labels).increment(1);
            }
            ReceptionStatus::Weak => {
                metrics::counter!(metric_defs::MAC_RX_WEAK.name, &labels).increment(1);
            }
        }

        ctx.post_observation(EventPayload::FrameReceived(FrameReceivedEvent {
            node: self.node,
            frame: reception.frame.clone(),
            rx_power_dbm: reception.rx_power_dbm,
            status,
            start_time: reception.start_time,
        }));

        if status != ReceptionStatus::Ok || !reception.frame.destination.accepts(self.node) {
            return;
        }

        let frame = reception.frame;
        match frame.kind {
            FrameKind::Ack { acked_uid } => self.handle_ack(acked_uid, ctx),
            FrameKind::Data(packet) => {
                if let MacDestination::Unicast(_) = frame.destination {
                    self.pending_ack = Some((frame.uid, frame.sender));
                    ctx.post_event(
                        self.config.phy.sifs,
                        vec![self.id],
                        EventPayload::Timer { timer_id: TIMER_SEND_ACK },
                    );
                    if self.last_rx_uid.get(&frame.sender) == Some(&frame.uid) {
                        trace!(node = %self.node, uid = frame.uid, "duplicate frame");
                        return;
                    }
                    self.last_rx_uid.insert(frame.sender, frame.uid);
                }
                ctx.post_immediate(
                    vec![self.upper],
                    EventPayload::MacRxPacket(MacRxPacketEvent {
                        packet,
                        from: frame.sender,
                    }),
                );
            }
        }
    }
}

impl Entity for WifiMac {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::MacTxRequest(request) => {
                self.handle_tx_request(request.packet.clone(), request.destination, ctx);
            }
            EventPayload::ReceiveAir(rx) => self.handle_receive_air(rx, ctx),
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_ACCESS => self.handle_access_timer(ctx),
                TIMER_TX_END => self.handle_tx_end(ctx),
                TIMER_ACK_TIMEOUT => self.handle_ack_timeout(ctx),
                TIMER_SEND_ACK => self.send_ack(ctx),
                id if id >= TIMER_RX_END_BASE => self.handle_rx_end(id - TIMER_RX_END_BASE, ctx),
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
