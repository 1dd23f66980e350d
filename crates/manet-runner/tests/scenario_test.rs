//! End-to-end runs of the five-node scenario through the library API.

use manet_mobility::MobilityModelKind;
use manet_node::Node;
use manet_runner::{
    create_event_loop, load_scenario_from_str, EventLoop, FlowRecord, ScenarioConfig, SimTime, TracePayload,
};
use std::net::Ipv4Addr;

// ============================================================================
// Test Helper Functions
// ============================================================================

fn run(config: &ScenarioConfig) -> EventLoop {
    let mut event_loop = create_event_loop(config, None).expect("Failed to build scenario");
    event_loop.run(config.stop_time()).expect("Simulation failed");
    event_loop
}

fn static_grid(seed: u64, stop_time_s: f64) -> ScenarioConfig {
    let mut config = ScenarioConfig::default();
    config.simulation.seed = seed;
    config.simulation.stop_time_s = stop_time_s;
    config.mobility.model = MobilityModelKind::ConstantPosition;
    config
}

fn echo_request_flow(flows: &[FlowRecord]) -> &FlowRecord {
    flow_to(flows, Ipv4Addr::new(10, 1, 1, 2))
}

fn flow_to(flows: &[FlowRecord], server: Ipv4Addr) -> &FlowRecord {
    flows
        .iter()
        .find(|f| {
            f.source_address == Ipv4Addr::new(10, 1, 1, 1)
                && f.destination_address == server
                && f.destination_port == 9
        })
        .expect("missing echo request flow")
}

/// Three static nodes 250 m apart: the ends only reach each other through
/// the middle node.
fn line_of_three(seed: u64) -> ScenarioConfig {
    let yaml = format!(
        r#"
simulation:
  seed: {seed}
  stop_time_s: 30.0
  node_count: 3
  node_names: [Left, Relay, Right]
mobility:
  model: constant_position
  grid: {{min_x: 0.0, min_y: 0.0, delta_x: 250.0, delta_y: 250.0, grid_width: 3}}
  area: {{min_x: 0.0, max_x: 500.0, min_y: 0.0, max_y: 500.0}}
applications:
  - type: udp_echo_server
    node: 2
  - type: udp_echo_client
    node: 0
    client: {{remote: 10.1.1.3}}
"#
    );
    load_scenario_from_str(&yaml).expect("invalid line scenario")
}

/// Five fast walkers in an area much larger than the radio range. The
/// client starts at 0 s, before any HELLO has been heard.
fn sparse_mobile(seed: u64) -> ScenarioConfig {
    let yaml = format!(
        r#"
simulation:
  seed: {seed}
  stop_time_s: 60.0
mobility:
  model: random_waypoint
  grid: {{delta_x: 200.0, delta_y: 200.0, grid_width: 3}}
  area: {{min_x: 0.0, max_x: 1200.0, min_y: 0.0, max_y: 1200.0}}
  speed: {{min: 10.0, max: 20.0}}
  pause: {{min: 0.0, max: 1.0}}
applications:
  - type: udp_echo_server
    node: 1
    server: {{start_s: 0.0, stop_s: 60.0}}
  - type: udp_echo_client
    node: 0
    client: {{max_packets: 50, start_s: 0.0, stop_s: 60.0}}
"#
    );
    load_scenario_from_str(&yaml).expect("invalid mobile scenario")
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_default_scenario_echo_flow() {
    let config = ScenarioConfig::default();
    let event_loop = run(&config);
    let flows = event_loop.flows();

    let request = echo_request_flow(&flows);
    assert_eq!(request.flow_id, 1);
    assert_eq!(request.source_port, 49153);
    assert_eq!(request.protocol, 17);
    assert_eq!(request.stats.tx_packets, 10);
    assert_eq!(request.stats.tx_bytes, 10 * 1052);
    assert!(request.stats.rx_packets <= 10);
    assert_eq!(request.stats.lost_packets, 10 - request.stats.rx_packets);
    assert_eq!(request.stats.rx_bytes, request.stats.rx_packets * 1052);
    assert!(request.stats.jitter_sum >= 0.0);
    if request.stats.rx_packets > 0 {
        assert!(request.stats.delay_sum > 0.0);
    }

    // First request leaves at 2 s, the last at 11 s.
    assert_eq!(request.stats.time_first_tx_packet, Some(2.0));
    assert_eq!(request.stats.time_last_tx_packet, Some(11.0));

    // Every flow is unicast between scenario addresses.
    for flow in &flows {
        assert!(!flow.destination_address.is_broadcast());
        assert_eq!(flow.stats.rx_packets + flow.stats.lost_packets, flow.stats.tx_packets);
    }
    assert!(event_loop.current_time() <= config.stop_time().saturating_add(config.grace_period()));
}

#[test]
fn test_echo_replies_return_on_static_grid() {
    let config = static_grid(11, 20.0);
    let event_loop = run(&config);
    let flows = event_loop.flows();

    let request = echo_request_flow(&flows);
    assert!(request.stats.rx_packets > 0, "no request reached the server: {}", request);

    let reply = flows
        .iter()
        .find(|f| f.source_address == Ipv4Addr::new(10, 1, 1, 2) && f.source_port == 9)
        .expect("missing echo reply flow");
    assert_eq!(reply.destination_address, Ipv4Addr::new(10, 1, 1, 1));
    assert_eq!(reply.destination_port, 49153);
    assert!(reply.flow_id > request.flow_id);
    assert!(reply.stats.tx_packets <= request.stats.rx_packets);
}

#[test]
fn test_flow_conservation_across_seeds() {
    for seed in [1, 2, 3, 4] {
        let mut config = ScenarioConfig::default();
        config.simulation.seed = seed;
        let event_loop = run(&config);

        let flows = event_loop.flows();
        assert!(!flows.is_empty(), "seed {} produced no flows", seed);
        for flow in &flows {
            assert_eq!(
                flow.stats.rx_packets + flow.stats.lost_packets,
                flow.stats.tx_packets,
                "seed {}: {}",
                seed,
                flow
            );
        }
        assert_eq!(event_loop.flow_monitor().in_flight(), 0);
    }
}

#[test]
fn test_same_seed_is_deterministic() {
    let config = ScenarioConfig::default();
    let first = run(&config);
    let second = run(&config);

    assert_eq!(first.trace_entries(), second.trace_entries());
    assert_eq!(first.flows(), second.flows());
    assert_eq!(first.node_stats(), second.node_stats());
    assert_eq!(first.stats().total_events, second.stats().total_events);
}

#[test]
fn test_different_seeds_move_nodes_differently() {
    let mut config = ScenarioConfig::default();
    config.simulation.stop_time_s = 10.0;
    let first = run(&config);
    config.simulation.seed = 2;
    let second = run(&config);

    assert_ne!(first.trace_entries(), second.trace_entries());
}

#[test]
fn test_olsr_converges_on_static_grid() {
    let config = static_grid(5, 15.0);
    let event_loop = run(&config);
    let infos = event_loop.node_infos();
    assert_eq!(infos.len(), 5);

    for info in infos {
        let node = event_loop
            .entities()
            .get_as::<Node>(info.node_entity)
            .expect("node entity missing");
        assert_eq!(node.address(), info.address);
        for other in infos.iter().filter(|o| o.node != info.node) {
            let route = node
                .olsr()
                .lookup(other.address)
                .unwrap_or_else(|e| panic!("{} has no route to {}: {}", info.name, other.address, e));
            assert_eq!(route.destination, other.address);
            assert!(route.distance >= 1);
        }
        assert!(node.olsr().lookup(Ipv4Addr::new(10, 1, 1, 99)).is_err());
    }
}

#[test]
fn test_waypoints_stay_in_area() {
    let config = ScenarioConfig::default();
    let event_loop = run(&config);
    let area = config.mobility.area;

    let positions: Vec<_> = event_loop
        .trace_entries()
        .iter()
        .filter_map(|entry| match entry.payload {
            manet_runner::TracePayload::Position { x, y, .. } => Some((x, y)),
            _ => None,
        })
        .collect();
    assert!(!positions.is_empty());
    // The default grid lies inside the waypoint area.
    for (x, y) in positions {
        assert!(x >= area.min_x - 1e-9 && x <= area.max_x + 1e-9, "x = {}", x);
        assert!(y >= area.min_y - 1e-9 && y <= area.max_y + 1e-9, "y = {}", y);
    }
}

#[test]
fn test_no_packets_after_drain() {
    let config = ScenarioConfig::default();
    let event_loop = run(&config);
    let end = config.stop_time().saturating_add(config.grace_period());
    let last = event_loop.trace_entries().last().expect("empty trace");
    assert!(last.time_s <= end.as_secs_f64());
    assert!(SimTime::from_secs(last.time_s) <= end);
}

#[test]
fn test_line_topology_relays_through_middle_node() {
    let config = line_of_three(3);
    let event_loop = run(&config);
    let infos = event_loop.node_infos();
    assert_eq!(infos.len(), 3);

    // The ends are out of radio range of each other.
    let direct_ok = event_loop.trace_entries().iter().any(|entry| {
        matches!(
            entry.payload,
            TracePayload::FrameRx { sender: 0, status: "ok", .. } if entry.origin_id == 2
        )
    });
    assert!(!direct_ok, "right node decoded a frame from the left node");

    let left = event_loop
        .entities()
        .get_as::<Node>(infos[0].node_entity)
        .expect("node entity missing");
    let to_right = left.olsr().lookup(Ipv4Addr::new(10, 1, 1, 3)).expect("no route to the far end");
    assert_eq!(to_right.next_hop, Ipv4Addr::new(10, 1, 1, 2));
    assert_eq!(to_right.distance, 2);
    assert_eq!(left.olsr().lookup(Ipv4Addr::new(10, 1, 1, 2)).map(|r| r.distance).ok(), Some(1));

    let flows = event_loop.flows();
    let request = flow_to(&flows, Ipv4Addr::new(10, 1, 1, 3));
    assert!(request.stats.rx_packets > 0, "nothing crossed the relay: {}", request);
    assert!(request.stats.times_forwarded >= request.stats.rx_packets);
    assert_eq!(request.stats.rx_packets + request.stats.lost_packets, request.stats.tx_packets);

    let relay = &event_loop.node_stats()[&1];
    assert!(relay.packets_forwarded > 0);
    let relayed_traces = event_loop
        .trace_entries()
        .iter()
        .filter(|entry| entry.origin_id == 1)
        .filter(|entry| matches!(entry.payload, TracePayload::Packet { event: "forward", .. }))
        .count() as u64;
    assert_eq!(relayed_traces, relay.packets_forwarded);
}

#[test]
fn test_mobile_sparse_network_accounts_every_packet() {
    for seed in [1, 2, 3] {
        let config = sparse_mobile(seed);
        let event_loop = run(&config);
        let flows = event_loop.flows();

        let request = echo_request_flow(&flows);
        assert_eq!(request.stats.tx_packets, 50, "seed {}", seed);
        assert!(request.stats.lost_packets >= 1, "seed {}: {}", seed, request);
        for flow in &flows {
            assert_eq!(
                flow.stats.rx_packets + flow.stats.lost_packets,
                flow.stats.tx_packets,
                "seed {}: {}",
                seed,
                flow
            );
        }
        assert_eq!(event_loop.flow_monitor().in_flight(), 0);

        // The first request leaves before any route exists.
        let early_no_route = event_loop.trace_entries().iter().any(|entry| {
            entry.origin_id == 0
                && entry.time_s == 0.0
                && matches!(
                    entry.payload,
                    TracePayload::Packet {
                        event: "drop",
                        reason: Some("no_route"),
                        ..
                    }
                )
        });
        assert!(early_no_route, "seed {}: no no_route drop at start", seed);

        let legs = event_loop
            .trace_entries()
            .iter()
            .filter_map(|entry| match entry.payload {
                TracePayload::Position {
                    speed: Some(speed), ..
                } if speed > 0.0 => Some(speed),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(!legs.is_empty(), "seed {}: nobody moved", seed);
        assert!(legs.iter().all(|&v| (10.0..=20.0).contains(&v)), "seed {}", seed);
    }
}

#[test]
fn test_huge_client_interval_runs_to_completion() {
    let mut config = static_grid(1, 10.0);
    let yaml = "applications:\n  - type: udp_echo_client\n    node: 0\n    client: {interval_s: 1.0e12}\n";
    config.applications = load_scenario_from_str(yaml).expect("large interval rejected").applications;
    let event_loop = run(&config);
    let flows = event_loop.flows();
    let request = echo_request_flow(&flows);
    assert_eq!(request.stats.tx_packets, 1);
    assert_eq!(request.stats.rx_packets + request.stats.lost_packets, 1);
}
