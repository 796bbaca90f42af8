//! End-to-end scenario coverage across slot, map, router and id-map
//! together, exercising the same call sequences a device would make
//! rather than any one module in isolation.

use mapper_core::idmap::make_gid;
use mapper_core::map::{Map, Mode};
use mapper_core::router::Router;
use mapper_core::signal::{Direction, Signal};
use mapper_core::slot::{BoundaryAction, Slot, SlotDirection};
use mapper_core::time::MapperTime;
use mapper_core::value::{Elem, Scalar, ScalarType};

fn slot(id: u32, signal_id: u64, device: u64, dir: SlotDirection, ty: ScalarType) -> Slot {
    let mut s = Slot::new(id, signal_id, device, dir);
    s.lock_type_length(ty, 1);
    s.link_known = true;
    s
}

/// Linear 1-to-1: A.out (f32, 0..10) -> B.in (f32, 0..1), clamp below.
#[test]
fn linear_map_scales_and_clamps() {
    let mut src = slot(0, 100, 1, SlotDirection::Src, ScalarType::F32);
    src.min = Some(vec![0.0]);
    src.max = Some(vec![10.0]);

    let mut dst = slot(0, 200, 2, SlotDirection::Dst, ScalarType::F32);
    dst.min = Some(vec![0.0]);
    dst.max = Some(vec![1.0]);
    dst.bound_min = BoundaryAction::Clamp;
    dst.bound_max = BoundaryAction::Clamp;

    let mut m = Map::new(1, vec![src], dst);
    m.mode = Mode::Linear;
    m.compile_expression(None, true).unwrap();
    assert!(m.activate());

    let mut r = Router::new();
    r.add_map(m).unwrap();

    let updates = r.process_outgoing(
        100,
        1,
        &[Elem::Val(Scalar::F32(5.0))],
        1,
        MapperTime::from_double(1.0),
    );
    assert_eq!(updates.len(), 1);
    assert!((updates[0].value.as_ref().unwrap()[0].as_f64().unwrap() - 0.5).abs() < 1e-6);

    let updates = r.process_outgoing(
        100,
        1,
        &[Elem::Val(Scalar::F32(-1.0))],
        1,
        MapperTime::from_double(2.0),
    );
    assert_eq!(
        updates[0].value.as_ref().unwrap()[0].as_f64().unwrap(),
        0.0,
        "clamp on bound_min should floor the scaled value at 0"
    );
}

/// Convergent sum: [A.a, A.b] -> B.s with the default average expression.
#[test]
fn convergent_average_combines_two_sources() {
    let src_a = slot(0, 300, 1, SlotDirection::Src, ScalarType::I32);
    let src_b = slot(1, 301, 1, SlotDirection::Src, ScalarType::I32);
    let dst = slot(0, 400, 2, SlotDirection::Dst, ScalarType::I32);

    let mut m = Map::new(2, vec![src_a, src_b], dst);
    m.compile_expression(None, true).unwrap();
    assert!(m.activate());

    let mut r = Router::new();
    r.add_map(m).unwrap();

    r.process_outgoing(300, 1, &[Elem::Val(Scalar::I32(4))], 1, MapperTime::from_double(1.0));
    let updates = r.process_outgoing(
        301,
        1,
        &[Elem::Val(Scalar::I32(10))],
        1,
        MapperTime::from_double(2.0),
    );
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].value.as_ref().unwrap()[0].as_f64(), Some(7.0));
}

/// Instance activation, remote reference, and release: the id-map entry
/// survives until both the local and the remote side have dropped it.
#[test]
fn instance_release_frees_idmap_entry_once_both_sides_drop_it() {
    let mut p = Signal::new(1, 1, "p", Direction::Output, ScalarType::F32, 1, 4);
    p.ephemeral = true;

    let gid = make_gid(1, 1);
    assert_ne!(gid, 0, "a freshly activated instance gets a nonzero gid");
    p.idmap.activate(42, gid);

    p.set_value(42, &[Elem::Val(Scalar::F32(5.0))], MapperTime::from_double(1.0))
        .unwrap();
    assert!(p.find_instance(42).unwrap().active);

    // The destination device's map slot starts tracking this instance.
    p.idmap.incref_global(42);

    p.release(42, MapperTime::from_double(2.0));
    let inst = p.find_instance(42).unwrap();
    assert!(!inst.active);
    assert_eq!(p.idmap.len(), 1, "remote side still references it");

    // The destination acknowledges the release.
    p.idmap.decref_global(42);
    assert_eq!(p.idmap.len(), 0, "both refcounts are zero, entry is freed");
    assert!(p.idmap.find_by_lid(42).is_none());
}

/// Expression with destination history: `y = y{-1}*0.9 + x*0.1` forces
/// destination processing. Ten writes of a constant 1.0 should converge
/// exactly like the closed-form scalar IIR `y_n = 1 - 0.9^n`.
///
/// The source and destination each independently compile the map, mirroring
/// two separate devices; the routed value crosses from one `Router` to the
/// other the way it would cross the network.
#[test]
fn destination_history_expression_matches_closed_form_iir() {
    let expr = Some("y=y{-1}*0.9+x*0.1".to_string());

    let mut src_side = Map::new(
        10,
        vec![slot(0, 500, 1, SlotDirection::Src, ScalarType::F32)],
        slot(0, 600, 2, SlotDirection::Dst, ScalarType::F32),
    );
    src_side.compile_expression(expr.clone(), true).unwrap();
    assert!(src_side.activate());
    let mut router_src = Router::new();
    router_src.add_map(src_side).unwrap();

    let mut dst_side = Map::new(
        10,
        vec![slot(0, 500, 1, SlotDirection::Src, ScalarType::F32)],
        slot(0, 600, 2, SlotDirection::Dst, ScalarType::F32),
    );
    dst_side.compile_expression(expr, true).unwrap();
    assert!(dst_side.activate());
    assert_eq!(dst_side.destination.history_size, 2);
    let mut router_dst = Router::new();
    router_dst.add_map(dst_side).unwrap();

    for i in 1..=10u32 {
        let now = MapperTime::from_double(i as f64);
        let outbound = router_src.process_outgoing(500, 1, &[Elem::Val(Scalar::F32(1.0))], 1, now);
        assert_eq!(outbound.len(), 1);

        let inbound = router_dst.process_incoming(
            600,
            outbound[0].dest_slot_id,
            1,
            outbound[0].value.as_ref().unwrap(),
            now,
        );
        assert_eq!(inbound.len(), 1);
        let got = inbound[0].value.as_ref().unwrap()[0].as_f64().unwrap();
        let expected = 1.0 - 0.9f64.powi(i as i32);
        assert!(
            (got - expected).abs() < 1e-5,
            "iteration {i}: got {got}, expected {expected}"
        );
    }
}
