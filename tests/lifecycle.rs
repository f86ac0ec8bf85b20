mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::run_job;
use ferrocomm::loopback::LoopbackFabric;
use ferrocomm::{predefined, CommKind, Error, Info, RuntimeConfig};

#[test]
fn concurrent_references_balance_out() {
    let fabric = LoopbackFabric::single_node(2);
    run_job(&fabric, RuntimeConfig::default(), |rt| {
        let dup = rt.world().dup(None).unwrap();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let comm = Arc::clone(&dup);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        comm.add_ref();
                    }
                    for _ in 0..1000 {
                        comm.release().unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(dup.ref_count(), 1);
        assert!(dup.is_valid());
        assert!(Arc::ptr_eq(&rt.comm(dup.handle()).unwrap(), &dup));

        dup.release().unwrap();
        assert!(!dup.is_valid());
        assert!(matches!(dup.release(), Err(Error::InvalidCommunicator)));
        rt.finalize().unwrap();
    });
}

#[test]
fn threads_dup_different_parents_in_opposite_order() {
    let fabric = LoopbackFabric::single_node(2);
    let results = run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        let x = world.dup(None).unwrap();
        let y = world.dup(None).unwrap();
        let (first, second) = if world.rank() == 0 { (&x, &y) } else { (&y, &x) };

        let (a, b) = thread::scope(|s| {
            let a = s.spawn(|| first.dup(None));
            thread::sleep(Duration::from_millis(20));
            let b = s.spawn(|| second.dup(None));
            (a.join().unwrap(), b.join().unwrap())
        });
        let (a, b) = (a.unwrap(), b.unwrap());
        let out = (a.context_id() != b.context_id(), a.size() + b.size());
        a.release().unwrap();
        b.release().unwrap();
        y.release().unwrap();
        x.release().unwrap();
        out
    });
    assert_eq!(results, vec![(true, 4), (true, 4)]);
}

#[test]
fn create_from_group_keeps_group_order() {
    let fabric = LoopbackFabric::single_node(4);
    let results = run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        let group = world.local_group().incl(&[3, 1]).unwrap();
        let comm = world.create(&group).unwrap();
        let out = comm.as_ref().map(|c| (c.rank(), c.local_group().lpids().to_vec()));
        if let Some(comm) = comm {
            assert_eq!(comm.kind(), CommKind::Intra);
            comm.release().unwrap();
        }
        out
    });
    assert_eq!(results[0], None);
    assert_eq!(results[1], Some((1, vec![3, 1])));
    assert_eq!(results[2], None);
    assert_eq!(results[3], Some((0, vec![3, 1])));
}

#[test]
fn create_rejects_foreign_group() {
    let fabric = LoopbackFabric::single_node(2);
    run_job(&fabric, RuntimeConfig::default(), |rt| {
        let stranger = ferrocomm::Group::new(vec![0, 9]).unwrap();
        assert!(matches!(
            rt.world().create(&stranger),
            Err(Error::InvalidGroup(_))
        ));
    });
}

#[test]
fn intercommunicator_lifecycle() {
    let fabric = LoopbackFabric::single_node(4);
    let results = run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        let rank = world.rank();
        let even = rank % 2 == 0;
        let half = world.split((rank % 2) as i32, 0).unwrap().unwrap();
        let remote_leader = if even { 1 } else { 0 };
        let inter = half.intercomm_create(0, world, remote_leader, 7).unwrap();

        assert_eq!(inter.kind(), CommKind::Inter);
        assert!(inter.is_tainted());
        assert_eq!(inter.size(), 2);
        assert_eq!(inter.remote_size(), 2);
        assert_eq!(inter.is_low_group(), even);
        let remote = inter.remote_group().lpids().to_vec();

        let local = inter.local_comm().unwrap();
        assert_eq!(local.kind(), CommKind::Intra);
        assert_eq!(local.local_group().lpids(), half.local_group().lpids());
        assert!(Arc::ptr_eq(&local, &inter.local_comm().unwrap()));

        let dup = inter.dup(None).unwrap();
        assert_eq!(dup.kind(), CommKind::Inter);
        assert_eq!(dup.remote_group().lpids(), remote.as_slice());
        assert_eq!(dup.is_low_group(), even);

        // each side keeps only its first member
        let first = inter.local_group().incl(&[0]).unwrap();
        let sub = inter.create(&first).unwrap();
        let sub_shape = sub.as_ref().map(|c| (c.size(), c.remote_size()));
        if let Some(sub) = sub {
            sub.release().unwrap();
        }

        dup.release().unwrap();
        inter.release().unwrap();
        // the cached local communicator goes with its owner
        assert!(!local.is_valid());
        half.release().unwrap();
        (remote, sub_shape)
    });
    assert_eq!(results[0].0, vec![1, 3]);
    assert_eq!(results[1].0, vec![0, 2]);
    assert_eq!(results[0].1, Some((1, 1)));
    assert_eq!(results[1].1, Some((1, 1)));
    assert_eq!(results[2].1, None);
    assert_eq!(results[3].1, None);
}

#[test]
fn overlapping_groups_are_rejected() {
    let fabric = LoopbackFabric::single_node(2);
    run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        // the leader finds itself on the other side
        let err = world.intercomm_create(0, world, 0, 3);
        assert!(matches!(err, Err(Error::InvalidGroup(_))));
    });
}

#[test]
fn hints_follow_dup_and_must_agree() {
    let fabric = LoopbackFabric::single_node(2);
    let results = run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        let rank = world.rank();

        let mut agreed = Info::new();
        agreed.set("mpi_assert_no_any_tag", "true").unwrap();
        agreed.set("sender_vci", &rank.to_string()).unwrap();
        let dup = world.dup(Some(&agreed)).unwrap();
        assert_eq!(dup.hint(predefined::NO_ANY_TAG), 1);
        assert_eq!(dup.hint(predefined::SENDER_VCI), rank as i32);

        let child = dup.dup(None).unwrap();
        assert_eq!(child.hint(predefined::NO_ANY_TAG), 1);
        let info = child.get_info().unwrap();
        assert_eq!(info.get("mpi_assert_no_any_tag"), Some("true"));
        child.release().unwrap();

        let mut diverging = Info::new();
        diverging
            .set("eager_threshold", if rank == 0 { "1024" } else { "4096" })
            .unwrap();
        let err = dup.set_info(&diverging).unwrap_err();
        let failed_dup = world.dup(Some(&diverging)).map(|c| c.release());
        dup.release().unwrap();
        (err, failed_dup.is_err())
    });
    for (err, dup_failed) in results {
        match err {
            Error::HintMismatch { hint, values } => {
                assert_eq!(hint, "eager_threshold");
                assert_eq!(values, vec![1024, 4096]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(dup_failed);
    }
}

#[test]
fn intercommunicator_hint_verdict_is_shared() {
    let fabric = LoopbackFabric::single_node(4);
    let results = run_job(&fabric, RuntimeConfig::default(), |rt| {
        let world = rt.world();
        let rank = world.rank();
        let half = world.split((rank % 2) as i32, 0).unwrap().unwrap();
        let remote_leader = if rank % 2 == 0 { 1 } else { 0 };
        let inter = half.intercomm_create(0, world, remote_leader, 11).unwrap();

        // rank 2 disagrees with its own group only
        let mut info = Info::new();
        info.set("eager_threshold", "4096").unwrap();
        let dup = inter.dup(if rank == 2 { None } else { Some(&info) });
        let ok = match dup {
            Ok(dup) => {
                dup.release().unwrap();
                true
            }
            Err(Error::HintMismatch { hint, .. }) => {
                assert_eq!(hint, "eager_threshold");
                false
            }
            Err(other) => panic!("unexpected error {other:?}"),
        };
        inter.release().unwrap();
        half.release().unwrap();
        ok
    });
    assert_eq!(results, vec![false; 4]);
}

#[test]
fn dynamic_hint_with_validator() {
    let fabric = LoopbackFabric::single_node(2);
    run_job(&fabric, RuntimeConfig::default(), |rt| {
        let validator: ferrocomm::HintValidator = Arc::new(|comm: &ferrocomm::Comm, id: ferrocomm::HintId, value: i32| {
            if !(0..=8).contains(&value) {
                return Err(Error::InvalidHint(format!("{value} out of range")));
            }
            comm.store_hint(id, value * 2);
            Ok(())
        });
        let id = rt
            .register_hint(
                None,
                "app_lanes",
                Some(validator),
                ferrocomm::HintType::Int,
                ferrocomm::HintAttr::Global,
                1,
            )
            .unwrap();
        assert!(id >= predefined::FIRST_DYNAMIC);

        let mut info = Info::new();
        info.set("app_lanes", "3").unwrap();
        let dup = rt.world().dup(Some(&info)).unwrap();
        assert_eq!(dup.hint(id), 6);
        assert!(matches!(dup.set_hint(id, 42), Err(Error::InvalidHint(_))));
        assert_eq!(dup.hint(id), 6);
        dup.release().unwrap();
    });
}

#[test]
fn revoked_communicator_refuses_new_work() {
    let fabric = LoopbackFabric::single_node(1);
    run_job(&fabric, RuntimeConfig::default(), |rt| {
        let dup = rt.world().dup(None).unwrap();
        dup.revoke();
        assert!(dup.is_revoked());
        assert!(matches!(dup.dup(None), Err(Error::Revoked)));
        // still releasable
        dup.release().unwrap();
        rt.finalize().unwrap();
    });
}
