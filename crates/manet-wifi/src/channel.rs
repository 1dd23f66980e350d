//! The shared wireless medium.
//!
//! The [`Channel`] entity owns node positions (through the mobility model)
//! and the propagation model. When a MAC starts a transmission it computes the
//! received power at every other node from their positions at that instant and
//! schedules a [`ReceiveAirEvent`] for each node at or above the interference
//! threshold, delayed by the propagation delay.

use crate::propagation::PropagationModel;
use manet_common::{
    CourseChangeEvent, Entity, EntityId, Event, EventId, EventPayload, NodeId, Position,
    PositionSnapshotEvent, ReceiveAirEvent, SimContext, SimError, SimTime, TransmitAirEvent,
};
use manet_mobility::{MobilityError, MobilityModel, MobilityStep};
use std::any::Any;
use tracing::{debug, trace};

/// Timer that starts mobility for every node.
pub const TIMER_START: u64 = 1;
/// Periodic position snapshot timer.
pub const TIMER_POSITION_POLL: u64 = 2;
/// Mobility transition timers; the node index is added to this.
const TIMER_MOBILITY_BASE: u64 = 0x1000;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frames weaker than this are not delivered at all (they neither decode
    /// nor interfere).
    pub interference_threshold_dbm: f64,
    /// Interval of position snapshots; None disables polling.
    pub position_poll_interval: Option<SimTime>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            interference_threshold_dbm: -110.0,
            position_poll_interval: Some(SimTime::from_secs(1.0)),
        }
    }
}

/// Shared medium entity.
pub struct Channel {
    id: EntityId,
    config: ChannelConfig,
    mobility: MobilityModel,
    propagation: PropagationModel,
    /// MAC entity of each node, indexed by node.
    macs: Vec<EntityId>,
    /// Pending mobility transition of each node.
    pending_mobility: Vec<Option<EventId>>,
}

impl Channel {
    /// Create a channel. `macs[i]` is the MAC entity of node `i`.
    pub fn new(
        id: EntityId,
        config: ChannelConfig,
        mobility: MobilityModel,
        propagation: PropagationModel,
        macs: Vec<EntityId>,
    ) -> Self {
        let pending_mobility = vec![None; macs.len()];
        Channel {
            id,
            config,
            mobility,
            propagation,
            macs,
            pending_mobility,
        }
    }

    /// Mobility model.
    pub fn mobility(&self) -> &MobilityModel {
        &self.mobility
    }

    /// Propagation model.
    pub fn propagation(&self) -> &PropagationModel {
        &self.propagation
    }

    /// Position of a node at `now`.
    pub fn position_of(&self, node: NodeId, now: SimTime) -> Result<Position, MobilityError> {
        self.mobility.position_at(node, now)
    }

    /// Pin a node to a fixed position, cancelling its pending mobility
    /// transition.
    pub fn set_node_position(
        &mut self,
        node: NodeId,
        position: Position,
        ctx: &mut SimContext,
    ) -> Result<(), MobilityError> {
        let step = self.mobility.set_position(node, position, ctx.time())?;
        if let Some(pending) = self.pending_mobility[node.index()].take() {
            ctx.cancel_event(pending);
        }
        self.apply_step(step, ctx);
        Ok(())
    }

    fn apply_step(&mut self, step: MobilityStep, ctx: &mut SimContext) {
        ctx.post_observation(EventPayload::CourseChange(CourseChangeEvent {
            node: step.node,
            position: step.position,
            velocity: step.velocity,
        }));
        let pending = step.next_transition.map(|at| {
            let delay = at - ctx.time();
            ctx.post_event(
                delay,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_MOBILITY_BASE + step.node.0 as u64,
                },
            )
        });
        self.pending_mobility[step.node.index()] = pending;
    }

    fn start_mobility(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        for index in 0..self.mobility.node_count() {
            let node = NodeId(index as u32);
            let now = ctx.time();
            let step = self
                .mobility
                .start(node, now, ctx.rng())
                .map_err(|e| self.handler_error(e))?;
            self.apply_step(step, ctx);
        }
        Ok(())
    }

    fn advance_mobility(&mut self, node: NodeId, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let step = self
            .mobility
            .advance(node, now, ctx.rng())
            .map_err(|e| self.handler_error(e))?;
        self.apply_step(step, ctx);
        Ok(())
    }

    fn poll_positions(&mut self, ctx: &mut SimContext) {
        ctx.post_observation(EventPayload::PositionSnapshot(PositionSnapshotEvent {
            positions: self.mobility.positions_at(ctx.time()),
        }));
        if let Some(interval) = self.config.position_poll_interval {
            ctx.post_event(
                interval,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_POSITION_POLL,
                },
            );
        }
    }

    fn handle_transmit_air(&mut self, tx: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let sender = tx.frame.sender;
        let sender_position = self
            .mobility
            .position_at(sender, now)
            .map_err(|e| self.handler_error(e))?;

        for (index, mac) in self.macs.iter().enumerate() {
            if index == sender.index() {
                continue;
            }
            let receiver = NodeId(index as u32);
            let receiver_position = self
                .mobility
                .position_at(receiver, now)
                .map_err(|e| self.handler_error(e))?;
            let distance = sender_position.distance_to(&receiver_position);
            let rx_power_dbm = self
                .propagation
                .received_power_dbm(tx.frame.tx_power_dbm, distance);

            if rx_power_dbm < self.config.interference_threshold_dbm {
                trace!(from = %sender, to = %receiver, rx_power_dbm, "below interference threshold");
                continue;
            }

            let delay = SimTime::from_nanos(self.propagation.delay_nanos(distance));
            ctx.post_event(
                delay,
                vec![*mac],
                EventPayload::ReceiveAir(ReceiveAirEvent {
                    source_mac: tx.mac_id,
                    frame: tx.frame.clone(),
                    rx_power_dbm,
                    distance_m: distance,
                    end_time: now + delay + tx.duration,
                }),
            );
        }
        Ok(())
    }

    fn handler_error(&self, error: MobilityError) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: error.to_string(),
        }
    }
}

impl Entity for Channel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx) => self.handle_transmit_air(tx, ctx)?,
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_START => {
                    debug!(nodes = self.macs.len(), "starting mobility");
                    self.start_mobility(ctx)?;
                    if self.config.position_poll_interval.is_some() {
                        self.poll_positions(ctx);
                    }
                }
                TIMER_POSITION_POLL => self.poll_positions(ctx),
                id if id >= TIMER_MOBILITY_BASE => {
                    let node = NodeId((id - TIMER_MOBILITY_BASE) as u32);
                    self.pending_mobility[node.index()] = None;
                    self.advance_mobility(node, ctx)?;
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::PropagationConfig;
    use manet_common::{Frame, FrameKind, MacDestination};
    use manet_mobility::{MobilityConfig, MobilityModelKind};

    fn channel(model: MobilityModelKind) -> Channel {
        let mobility = MobilityModel::new(
            MobilityConfig {
                model,
                ..Default::default()
            },
            3,
        )
        .unwrap();
        Channel::new(
            EntityId(100),
            ChannelConfig::default(),
            mobility,
            PropagationModel::new(PropagationConfig::default(), 2.412e9),
            vec![EntityId(10), EntityId(11), EntityId(12)],
        )
    }

    fn ack_frame(sender: u32) -> Frame {
        Frame {
            uid: 1,
            sender: NodeId(sender),
            destination: MacDestination::Broadcast,
            kind: FrameKind::Ack { acked_uid: 0 },
            size_bytes: 14,
            tx_power_dbm: 16.0206,
        }
    }

    fn drain(ctx: &mut SimContext) -> Vec<Event> {
        std::iter::from_fn(|| ctx.scheduler_mut().pop_next()).collect()
    }

    #[test]
    fn test_transmission_reaches_every_other_node() {
        let mut ch = channel(MobilityModelKind::ConstantPosition);
        let mut ctx = SimContext::new(1);
        let tx = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(10),
            targets: vec![EntityId(100)],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                mac_id: EntityId(10),
                frame: ack_frame(0),
                duration: SimTime::from_micros(50),
            }),
        };
        ch.handle_event(&tx, &mut ctx).unwrap();

        let deliveries = drain(&mut ctx);
        assert_eq!(deliveries.len(), 2);
        let targets: Vec<EntityId> = deliveries.iter().map(|e| e.targets[0]).collect();
        assert_eq!(targets, vec![EntityId(11), EntityId(12)]);

        // Node 1 at 5 m, node 2 at 10 m: the nearer node hears it louder and sooner.
        let (near, far) = match (&deliveries[0].payload, &deliveries[1].payload) {
            (EventPayload::ReceiveAir(a), EventPayload::ReceiveAir(b)) => (a.clone(), b.clone()),
            _ => panic!("expected receive events"),
        };
        assert!(near.rx_power_dbm > far.rx_power_dbm);
        assert!(deliveries[0].time < deliveries[1].time);
        assert_eq!(near.end_time, deliveries[0].time + SimTime::from_micros(50));
    }

    #[test]
    fn test_start_schedules_mobility_and_poll() {
        let mut ch = channel(MobilityModelKind::RandomWaypoint);
        let mut ctx = SimContext::new(42);
        let start = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(0),
            targets: vec![EntityId(100)],
            payload: EventPayload::Timer { timer_id: TIMER_START },
        };
        ch.handle_event(&start, &mut ctx).unwrap();

        // 3 course changes + 3 transitions + 1 snapshot + next poll
        assert_eq!(ctx.scheduler().pending_count(), 8);
        assert!(ch.pending_mobility.iter().all(|p| p.is_some()));
    }

    #[test]
    fn test_set_position_cancels_pending_transition() {
        let mut ch = channel(MobilityModelKind::RandomWaypoint);
        let mut ctx = SimContext::new(42);
        let start = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(0),
            targets: vec![EntityId(100)],
            payload: EventPayload::Timer { timer_id: TIMER_START },
        };
        ch.handle_event(&start, &mut ctx).unwrap();
        let pending = ch.pending_mobility[1].unwrap();

        ch.set_node_position(NodeId(1), Position::new(2.0, 2.0), &mut ctx)
            .unwrap();
        assert!(!ctx.scheduler().is_pending(pending));
        assert!(ch.pending_mobility[1].is_none());
        assert_eq!(
            ch.position_of(NodeId(1), SimTime::from_secs(20.0)).unwrap(),
            Position::new(2.0, 2.0)
        );
    }
}
