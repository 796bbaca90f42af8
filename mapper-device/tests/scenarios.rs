//! End-to-end device scenarios driven over real (loopback) UDP sockets:
//! bus discovery/naming, and link-loss cleanup.

use mapper_core::map::Mode;
use mapper_core::object;
use mapper_core::signal::Direction;
use mapper_core::value::ScalarType;
use mapper_device::config::DeviceConfig;
use mapper_device::device::Device;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

fn poll_until(devices: &mut [Device], timeout: Duration, mut done: impl FnMut(&[Device]) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for d in devices.iter_mut() {
            d.poll(8);
        }
        if done(devices) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Three devices requesting the same base name, started together, should
/// each lock a distinct id and learn about the other two on the bus.
#[test]
fn three_devices_resolve_distinct_names_via_bus_discovery() {
    let group: Ipv4Addr = "225.7.7.1".parse().unwrap();
    let cfg = || DeviceConfig::new().with_multicast_group(group).with_multicast_port(57301);

    let mut devices = vec![
        Device::new("tst", cfg()).unwrap(),
        Device::new("tst", cfg()).unwrap(),
        Device::new("tst", cfg()).unwrap(),
    ];

    let registered = poll_until(&mut devices, Duration::from_secs(5), |ds| ds.iter().all(|d| d.is_registered()));
    assert!(registered, "all three devices should register within 5s");

    let ids: Vec<u64> = devices.iter().map(|d| d.id).collect();
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3, "every device must lock a distinct id: {ids:?}");

    // Give `/name/registered` broadcasts time to reach every peer.
    poll_until(&mut devices, Duration::from_secs(2), |ds| ds.iter().all(|d| d.graph.devices.len() >= 2));

    for d in &devices {
        assert_eq!(
            d.graph.devices.len(),
            2,
            "each device's graph should hold the other two device records"
        );
        for (id, record) in &d.graph.devices {
            assert!(record.name.starts_with("tst."));
            assert_ne!(*id, d.id);
        }
    }
}

/// A link that stops hearing pings from its peer expires after
/// `2 * peer_ping_timeout`, and every map crossing it is dropped from the
/// router along with it.
#[test]
fn peer_loss_expires_link_and_drops_its_maps() {
    let group: Ipv4Addr = "225.7.7.2".parse().unwrap();
    let mut cfg = DeviceConfig::new()
        .with_multicast_group(group)
        .with_multicast_port(57302)
        .with_peer_ping_timeout(Duration::from_millis(150));
    cfg.default_subscriber_lease = Some(Duration::from_millis(50));

    let mut devices = vec![Device::new("tst-a", cfg).unwrap()];
    let registered = poll_until(&mut devices, Duration::from_secs(5), |ds| ds[0].is_registered());
    assert!(registered);
    let a = &mut devices[0];

    // A peer device that will never send another ping after this point.
    let remote_device = object::device_id_from_name("tst-b.0");
    let remote_signal = object::child_id(remote_device, 0);

    let y = a.add_signal("y", Direction::Input, ScalarType::F32, 1, 1);
    let map_id = a
        .add_map(vec![(remote_device, remote_signal, ScalarType::F32, 1)], y, None, Mode::Expression)
        .unwrap();
    assert!(a.router.map(map_id).is_some());

    let link_id = a.graph.find_or_create_link(a.id, remote_device, a.config.bundle_flush_threshold);
    a.graph
        .links
        .get_mut(&link_id)
        .unwrap()
        .note_ping_received(mapper_core::time::MapperTime::now());

    let expired = poll_until(&mut devices, Duration::from_secs(2), |ds| !ds[0].graph.links.contains_key(&link_id));
    assert!(expired, "link should expire within 2 * peer_ping_timeout");

    let a = &devices[0];
    assert!(a.router.map(map_id).is_none(), "map spanning the expired link should be dropped");
}
