//! # manet-mobility
//!
//! Node placement and movement.
//!
//! Nodes start on a grid ([`GridPositionAllocator`]) and then either stay put
//! or follow the random waypoint law: pause, pick a uniformly random target in
//! the area, walk there at a uniformly drawn speed, pause again.
//!
//! [`MobilityModel`] is a pure state machine. It never schedules anything
//! itself; each transition returns a [`MobilityStep`] telling the owner when
//! the next transition is due. The channel entity owns the model and turns
//! steps into timer events.

use manet_common::{NodeId, Position, SimTime, Velocity};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

// ============================================================================
// Error Types
// ============================================================================

/// Mobility configuration and usage errors.
#[derive(Debug, Error, PartialEq)]
pub enum MobilityError {
    /// Speed bounds must be positive and ordered.
    #[error("invalid speed range [{min}, {max}]: bounds must be > 0 and min <= max")]
    InvalidSpeed {
        /// Lower bound in m/s.
        min: f64,
        /// Upper bound in m/s.
        max: f64,
    },

    /// Pause bounds must be non-negative and ordered.
    #[error("invalid pause range [{min}, {max}]: bounds must be >= 0 and min <= max")]
    InvalidPause {
        /// Lower bound in seconds.
        min: f64,
        /// Upper bound in seconds.
        max: f64,
    },

    /// The movement area is empty.
    #[error("empty mobility area: x [{min_x}, {max_x}], y [{min_y}, {max_y}]")]
    EmptyArea {
        /// Area bounds.
        min_x: f64,
        /// Area bounds.
        max_x: f64,
        /// Area bounds.
        min_y: f64,
        /// Area bounds.
        max_y: f64,
    },

    /// Grid allocator parameters are unusable.
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// Node index outside the model.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

// ============================================================================
// Configuration
// ============================================================================

/// Mobility law applied to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityModelKind {
    /// Nodes stay on their initial positions.
    ConstantPosition,
    /// Random waypoint movement.
    #[default]
    RandomWaypoint,
}

/// Order in which grid cells are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridLayout {
    /// Fill a row of `grid_width` cells, then move to the next row.
    #[default]
    RowFirst,
    /// Fill a column of `grid_width` cells, then move to the next column.
    ColumnFirst,
}

/// Places nodes on a regular grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridPositionAllocator {
    /// X coordinate of the first cell.
    pub min_x: f64,
    /// Y coordinate of the first cell.
    pub min_y: f64,
    /// Spacing between columns in meters.
    pub delta_x: f64,
    /// Spacing between rows in meters.
    pub delta_y: f64,
    /// Cells per row (or per column for column-first layout).
    pub grid_width: u32,
    /// Fill order.
    pub layout: GridLayout,
}

impl Default for GridPositionAllocator {
    fn default() -> Self {
        GridPositionAllocator {
            min_x: 0.0,
            min_y: 0.0,
            delta_x: 5.0,
            delta_y: 10.0,
            grid_width: 3,
            layout: GridLayout::RowFirst,
        }
    }
}

impl GridPositionAllocator {
    /// Position of the `index`-th node.
    pub fn position(&self, index: usize) -> Position {
        let width = self.grid_width.max(1) as usize;
        let (major, minor) = (index / width, index % width);
        match self.layout {
            GridLayout::RowFirst => Position::new(
                self.min_x + self.delta_x * minor as f64,
                self.min_y + self.delta_y * major as f64,
            ),
            GridLayout::ColumnFirst => Position::new(
                self.min_x + self.delta_x * major as f64,
                self.min_y + self.delta_y * minor as f64,
            ),
        }
    }

    /// Validate the allocator parameters.
    pub fn validate(&self) -> Result<(), MobilityError> {
        if self.grid_width == 0 {
            return Err(MobilityError::InvalidGrid("grid_width must be at least 1".into()));
        }
        if !self.delta_x.is_finite() || !self.delta_y.is_finite() {
            return Err(MobilityError::InvalidGrid("grid spacing must be finite".into()));
        }
        if !self.min_x.is_finite() || !self.min_y.is_finite() {
            return Err(MobilityError::InvalidGrid("grid origin must be finite".into()));
        }
        Ok(())
    }
}

/// Rectangular area that waypoints are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Area {
    /// Lower X bound.
    pub min_x: f64,
    /// Upper X bound.
    pub max_x: f64,
    /// Lower Y bound.
    pub min_y: f64,
    /// Upper Y bound.
    pub max_y: f64,
}

impl Default for Area {
    fn default() -> Self {
        Area {
            min_x: 0.0,
            max_x: 10.0,
            min_y: 0.0,
            max_y: 10.0,
        }
    }
}

impl Area {
    /// Returns true if `position` lies inside the area (bounds included).
    pub fn contains(&self, position: &Position) -> bool {
        position.x >= self.min_x
            && position.x <= self.max_x
            && position.y >= self.min_y
            && position.y <= self.max_y
    }
}

/// Closed interval for uniform sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniformRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl UniformRange {
    /// Create a range.
    pub fn new(min: f64, max: f64) -> Self {
        UniformRange { min, max }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.min == self.max {
            return self.min;
        }
        Uniform::new_inclusive(self.min, self.max).sample(rng)
    }
}

/// Mobility configuration shared by all nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MobilityConfig {
    /// Mobility law.
    pub model: MobilityModelKind,
    /// Initial placement.
    pub grid: GridPositionAllocator,
    /// Area waypoints are drawn from.
    pub area: Area,
    /// Walking speed range in m/s.
    pub speed: UniformRange,
    /// Pause duration range in seconds.
    pub pause: UniformRange,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig {
            model: MobilityModelKind::RandomWaypoint,
            grid: GridPositionAllocator::default(),
            area: Area::default(),
            speed: UniformRange::new(1.0, 5.0),
            pause: UniformRange::new(1.0, 5.0),
        }
    }
}

impl MobilityConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MobilityError> {
        self.grid.validate()?;
        let speed = self.speed;
        if !(speed.min > 0.0 && speed.max > 0.0 && speed.min <= speed.max) || !speed.max.is_finite() {
            return Err(MobilityError::InvalidSpeed {
                min: speed.min,
                max: speed.max,
            });
        }
        let pause = self.pause;
        if !(pause.min >= 0.0 && pause.max >= 0.0 && pause.min <= pause.max) || !pause.max.is_finite() {
            return Err(MobilityError::InvalidPause {
                min: pause.min,
                max: pause.max,
            });
        }
        let area = self.area;
        let finite = [area.min_x, area.max_x, area.min_y, area.max_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || !(area.min_x <= area.max_x && area.min_y <= area.max_y) {
            return Err(MobilityError::EmptyArea {
                min_x: area.min_x,
                max_x: area.max_x,
                min_y: area.min_y,
                max_y: area.max_y,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Per-node State
// ============================================================================

/// Movement state of one node.
#[derive(Debug, Clone, PartialEq)]
pub enum MobilityState {
    /// Fixed position with no further transitions.
    Stationary {
        /// Position.
        position: Position,
    },
    /// Standing still until `until`, then walking.
    Paused {
        /// Position.
        position: Position,
        /// End of the pause.
        until: SimTime,
    },
    /// Walking on a straight segment.
    Moving {
        /// Segment start.
        from: Position,
        /// Segment end (the waypoint).
        to: Position,
        /// Departure time.
        depart: SimTime,
        /// Arrival time.
        arrive: SimTime,
        /// Velocity on the segment.
        velocity: Velocity,
    },
}

impl MobilityState {
    /// Position at time `now`, interpolated when moving.
    pub fn position_at(&self, now: SimTime) -> Position {
        match self {
            MobilityState::Stationary { position } | MobilityState::Paused { position, .. } => *position,
            MobilityState::Moving {
                from,
                to,
                depart,
                arrive,
                ..
            } => {
                let span = arrive.as_nanos().saturating_sub(depart.as_nanos());
                if span == 0 {
                    return *to;
                }
                let elapsed = now.as_nanos().saturating_sub(depart.as_nanos());
                from.lerp(to, elapsed as f64 / span as f64)
            }
        }
    }

    /// Velocity at time `now`.
    pub fn velocity_at(&self, now: SimTime) -> Velocity {
        match self {
            MobilityState::Moving { velocity, arrive, .. } if now < *arrive => *velocity,
            _ => Velocity::ZERO,
        }
    }

    /// Time of the next transition, if one is due.
    pub fn next_transition(&self) -> Option<SimTime> {
        match self {
            MobilityState::Stationary { .. } => None,
            MobilityState::Paused { until, .. } => Some(*until),
            MobilityState::Moving { arrive, .. } => Some(*arrive),
        }
    }
}

/// Result of a state transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MobilityStep {
    /// Node that changed course.
    pub node: NodeId,
    /// Position at the change.
    pub position: Position,
    /// Velocity after the change.
    pub velocity: Velocity,
    /// When the owner must call [`MobilityModel::advance`] next.
    pub next_transition: Option<SimTime>,
}

// ============================================================================
// Mobility Model
// ============================================================================

/// Mobility state for every node of a scenario.
#[derive(Debug, Clone)]
pub struct MobilityModel {
    config: MobilityConfig,
    states: Vec<MobilityState>,
}

impl MobilityModel {
    /// Create the model with every node on its grid position.
    pub fn new(config: MobilityConfig, node_count: usize) -> Result<Self, MobilityError> {
        config.validate()?;
        let states = (0..node_count)
            .map(|i| MobilityState::Stationary {
                position: config.grid.position(i),
            })
            .collect();
        Ok(MobilityModel { config, states })
    }

    /// Configuration in use.
    pub fn config(&self) -> &MobilityConfig {
        &self.config
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.states.len()
    }

    /// Current state of a node.
    pub fn state(&self, node: NodeId) -> Result<&MobilityState, MobilityError> {
        self.states.get(node.index()).ok_or(MobilityError::UnknownNode(node))
    }

    /// Position of a node at `now`.
    pub fn position_at(&self, node: NodeId, now: SimTime) -> Result<Position, MobilityError> {
        Ok(self.state(node)?.position_at(now))
    }

    /// Velocity of a node at `now`.
    pub fn velocity_at(&self, node: NodeId, now: SimTime) -> Result<Velocity, MobilityError> {
        Ok(self.state(node)?.velocity_at(now))
    }

    /// Positions of all nodes at `now`.
    pub fn positions_at(&self, now: SimTime) -> Vec<(NodeId, Position)> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| (NodeId(i as u32), s.position_at(now)))
            .collect()
    }

    /// Put a node in motion at simulation start.
    ///
    /// Random waypoint nodes begin with a pause on their initial position.
    pub fn start<R: Rng + ?Sized>(
        &mut self,
        node: NodeId,
        now: SimTime,
        rng: &mut R,
    ) -> Result<MobilityStep, MobilityError> {
        let position = self.position_at(node, now)?;
        let state = match self.config.model {
            MobilityModelKind::ConstantPosition => MobilityState::Stationary { position },
            MobilityModelKind::RandomWaypoint => self.pause_at(position, now, rng),
        };
        Ok(self.apply(node, now, state))
    }

    /// Perform the transition that was due at `now`.
    ///
    /// A paused node starts walking towards a fresh waypoint; a moving node
    /// arrives and pauses. Calling this before the transition is due leaves the
    /// node's state unchanged and reports it again.
    pub fn advance<R: Rng + ?Sized>(
        &mut self,
        node: NodeId,
        now: SimTime,
        rng: &mut R,
    ) -> Result<MobilityStep, MobilityError> {
        let current = self.state(node)?.clone();
        let due = current.next_transition().map(|t| t <= now).unwrap_or(false);
        if !due {
            return Ok(self.apply(node, now, current));
        }
        let state = match current {
            MobilityState::Paused { position, .. } => self.begin_walk(position, now, rng),
            MobilityState::Moving { to, .. } => self.pause_at(to, now, rng),
            stationary @ MobilityState::Stationary { .. } => stationary,
        };
        Ok(self.apply(node, now, state))
    }

    /// Move a node to a fixed position. The node stops following its
    /// mobility law; any transition previously reported for it is stale.
    pub fn set_position(
        &mut self,
        node: NodeId,
        position: Position,
        now: SimTime,
    ) -> Result<MobilityStep, MobilityError> {
        self.state(node)?;
        Ok(self.apply(node, now, MobilityState::Stationary { position }))
    }

    fn apply(&mut self, node: NodeId, now: SimTime, state: MobilityState) -> MobilityStep {
        let step = MobilityStep {
            node,
            position: state.position_at(now),
            velocity: state.velocity_at(now),
            next_transition: state.next_transition(),
        };
        trace!(node = %node, x = step.position.x, y = step.position.y, "course change");
        self.states[node.index()] = state;
        step
    }

    fn pause_at<R: Rng + ?Sized>(&self, position: Position, now: SimTime, rng: &mut R) -> MobilityState {
        let pause = self.config.pause.sample(rng);
        MobilityState::Paused {
            position,
            until: now.saturating_add(SimTime::from_secs(pause)),
        }
    }

    fn begin_walk<R: Rng + ?Sized>(&self, from: Position, now: SimTime, rng: &mut R) -> MobilityState {
        let area = self.config.area;
        let to = Position::new(
            UniformRange::new(area.min_x, area.max_x).sample(rng),
            UniformRange::new(area.min_y, area.max_y).sample(rng),
        );
        let speed = self.config.speed.sample(rng);
        let distance = from.distance_to(&to);
        let travel = distance / speed;
        let velocity = if distance > 0.0 {
            Velocity {
                x: (to.x - from.x) / travel,
                y: (to.y - from.y) / travel,
            }
        } else {
            Velocity::ZERO
        };
        MobilityState::Moving {
            from,
            to,
            depart: now,
            arrive: now.saturating_add(SimTime::from_secs(travel)),
            velocity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_grid_row_first_layout() {
        let grid = GridPositionAllocator::default();
        let expected = [(0.0, 0.0), (5.0, 0.0), (10.0, 0.0), (0.0, 10.0), (5.0, 10.0)];
        for (i, (x, y)) in expected.iter().enumerate() {
            assert_eq!(grid.position(i), Position::new(*x, *y));
        }
    }

    #[test]
    fn test_grid_column_first_layout() {
        let grid = GridPositionAllocator {
            layout: GridLayout::ColumnFirst,
            ..Default::default()
        };
        assert_eq!(grid.position(1), Position::new(0.0, 10.0));
        assert_eq!(grid.position(3), Position::new(5.0, 0.0));
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let mut config = MobilityConfig::default();
        config.speed = UniformRange::new(0.0, 5.0);
        assert!(matches!(config.validate(), Err(MobilityError::InvalidSpeed { .. })));

        config.speed = UniformRange::new(5.0, 1.0);
        assert!(matches!(config.validate(), Err(MobilityError::InvalidSpeed { .. })));

        config.speed = UniformRange::new(1.0, 5.0);
        config.pause = UniformRange::new(-1.0, 5.0);
        assert!(matches!(config.validate(), Err(MobilityError::InvalidPause { .. })));

        config.pause = UniformRange::new(1.0, 5.0);
        config.area.max_x = -1.0;
        assert!(matches!(config.validate(), Err(MobilityError::EmptyArea { .. })));

        config.area = Area::default();
        config.grid.grid_width = 0;
        assert!(matches!(config.validate(), Err(MobilityError::InvalidGrid(_))));
    }

    #[test]
    fn test_validation_rejects_non_finite_values() {
        let mut config = MobilityConfig::default();
        config.area.max_x = f64::INFINITY;
        assert!(matches!(config.validate(), Err(MobilityError::EmptyArea { .. })));

        config.area = Area::default();
        config.area.min_y = f64::NAN;
        assert!(matches!(config.validate(), Err(MobilityError::EmptyArea { .. })));

        config.area = Area::default();
        config.speed = UniformRange::new(1.0, f64::INFINITY);
        assert!(matches!(config.validate(), Err(MobilityError::InvalidSpeed { .. })));

        config.speed = UniformRange::new(1.0, 5.0);
        config.pause = UniformRange::new(f64::NAN, 5.0);
        assert!(matches!(config.validate(), Err(MobilityError::InvalidPause { .. })));

        config.pause = UniformRange::new(1.0, 5.0);
        config.grid.min_x = f64::NEG_INFINITY;
        assert!(matches!(config.validate(), Err(MobilityError::InvalidGrid(_))));
    }

    #[test]
    fn test_waypoint_cycle_alternates_pause_and_walk() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut model = MobilityModel::new(MobilityConfig::default(), 5).unwrap();
        let node = NodeId(2);

        let step = model.start(node, SimTime::ZERO, &mut rng).unwrap();
        assert_eq!(step.position, Position::new(10.0, 0.0));
        assert_eq!(step.velocity, Velocity::ZERO);
        let pause_end = step.next_transition.unwrap();
        assert!(pause_end >= SimTime::from_secs(1.0) && pause_end <= SimTime::from_secs(5.0));

        let walk = model.advance(node, pause_end, &mut rng).unwrap();
        assert!(matches!(model.state(node).unwrap(), MobilityState::Moving { .. }));
        let speed = walk.velocity.speed();
        assert!(speed == 0.0 || (1.0..=5.0 + 1e-9).contains(&speed));

        let arrival = walk.next_transition.unwrap();
        let paused = model.advance(node, arrival, &mut rng).unwrap();
        assert!(matches!(model.state(node).unwrap(), MobilityState::Paused { .. }));
        assert!(model.config().area.contains(&paused.position));
    }

    #[test]
    fn test_interpolation_lies_on_segment() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut model = MobilityModel::new(MobilityConfig::default(), 1).unwrap();
        let node = NodeId(0);
        let step = model.start(node, SimTime::ZERO, &mut rng).unwrap();
        model.advance(node, step.next_transition.unwrap(), &mut rng).unwrap();

        let (from, to, depart, arrive) = match model.state(node).unwrap().clone() {
            MobilityState::Moving { from, to, depart, arrive, .. } => (from, to, depart, arrive),
            other => panic!("expected moving, got {:?}", other),
        };
        let segment = from.distance_to(&to);
        for k in 0..=10 {
            let t = SimTime::from_nanos(
                depart.as_nanos() + (arrive.as_nanos() - depart.as_nanos()) * k / 10,
            );
            let p = model.position_at(node, t).unwrap();
            let detour = from.distance_to(&p) + p.distance_to(&to);
            assert!((detour - segment).abs() < 1e-6, "point {:?} off segment", p);
        }
    }

    #[test]
    fn test_early_advance_keeps_state() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut model = MobilityModel::new(MobilityConfig::default(), 1).unwrap();
        let step = model.start(NodeId(0), SimTime::ZERO, &mut rng).unwrap();
        let before = model.state(NodeId(0)).unwrap().clone();
        let again = model.advance(NodeId(0), SimTime::from_millis(1), &mut rng).unwrap();
        assert_eq!(model.state(NodeId(0)).unwrap(), &before);
        assert_eq!(again.next_transition, step.next_transition);
    }

    #[test]
    fn test_constant_position_never_transitions() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let config = MobilityConfig {
            model: MobilityModelKind::ConstantPosition,
            ..Default::default()
        };
        let mut model = MobilityModel::new(config, 3).unwrap();
        let step = model.start(NodeId(1), SimTime::ZERO, &mut rng).unwrap();
        assert_eq!(step.next_transition, None);
        assert_eq!(
            model.position_at(NodeId(1), SimTime::from_secs(100.0)).unwrap(),
            Position::new(5.0, 0.0)
        );
    }

    #[test]
    fn test_set_position_stops_node() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut model = MobilityModel::new(MobilityConfig::default(), 2).unwrap();
        model.start(NodeId(0), SimTime::ZERO, &mut rng).unwrap();
        let step = model
            .set_position(NodeId(0), Position::new(3.0, 4.0), SimTime::from_secs(1.0))
            .unwrap();
        assert_eq!(step.next_transition, None);
        assert_eq!(
            model.set_position(NodeId(9), Position::default(), SimTime::ZERO),
            Err(MobilityError::UnknownNode(NodeId(9)))
        );
    }
}
