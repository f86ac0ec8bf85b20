mod common;

use common::{run_job, run_job_with_device};
use ferrocomm::loopback::LoopbackFabric;
use ferrocomm::{
    compute_affinity, AsyncProgress, ProgressLayout, ProgressState, RuntimeConfig, ThreadLevel,
};

#[test]
fn explicit_affinity_slices_by_node_rank() {
    let fabric = LoopbackFabric::single_node(2);
    let config = RuntimeConfig {
        progress_thread_affinity: Some("0,1,2,3".into()),
        progress_cpus_per_process: 2,
        ..RuntimeConfig::default()
    };
    let plans = run_job(&fabric, config.clone(), move |rt| {
        let layout = ProgressLayout::from_world(rt.world());
        compute_affinity(&config, &layout, 8).unwrap()
    });
    assert_eq!(plans[0].cpus, vec![0, 1]);
    assert_eq!(plans[1].cpus, vec![2, 3]);
    assert!(plans.iter().all(|p| p.explicit && p.table == vec![0, 1, 2, 3]));
}

#[test]
fn default_affinity_spreads_over_two_nodes() {
    let fabric = LoopbackFabric::uniform(2, 2);
    let config = RuntimeConfig::default();
    let plans = run_job(&fabric, config.clone(), move |rt| {
        let layout = ProgressLayout::from_world(rt.world());
        compute_affinity(&config, &layout, 4).unwrap().cpus
    });
    // ranks on each node count down from the last processor
    assert_eq!(plans, vec![vec![3], vec![2], vec![3], vec![2]]);
}

#[test]
fn cliques_index_the_whole_job() {
    let fabric = LoopbackFabric::single_node(4);
    let config = RuntimeConfig {
        num_cliques: 2,
        ..RuntimeConfig::default()
    };
    let plans = run_job(&fabric, config.clone(), move |rt| {
        let layout = ProgressLayout::from_world(rt.world());
        compute_affinity(&config, &layout, 4).unwrap().cpus
    });
    assert_eq!(plans, vec![vec![3], vec![2], vec![1], vec![0]]);
}

#[test]
fn finalize_without_initialize_twice() {
    let mut progress = AsyncProgress::new();
    progress.finalize().unwrap();
    progress.finalize().unwrap();
    assert_eq!(progress.state(), ProgressState::Uninitialized);
}

#[test]
fn progress_threads_run_alongside_collectives() {
    let fabric = LoopbackFabric::uniform(2, 2);
    let config = RuntimeConfig {
        async_progress: true,
        ..RuntimeConfig::default()
    };
    let results = run_job_with_device(&fabric, config, ThreadLevel::Multiple, |rt, device| {
        assert_eq!(rt.progress_state(), ProgressState::Running);
        let dup = rt.world().dup(None).unwrap();
        let half = dup.split((dup.rank() % 2) as i32, 0).unwrap().unwrap();
        let size = half.size();
        half.release().unwrap();
        dup.release().unwrap();

        // wait for the background thread to get the section at least once
        while device.progress_calls() == 0 {
            std::thread::yield_now();
        }
        rt.finalize().unwrap();
        size
    });
    assert_eq!(results, vec![2, 2, 2, 2]);
}

#[test]
fn progress_needs_full_thread_support() {
    let fabric = LoopbackFabric::single_node(2);
    let config = RuntimeConfig {
        async_progress: true,
        ..RuntimeConfig::default()
    };
    let states = run_job_with_device(&fabric, config, ThreadLevel::Funneled, |rt, _| {
        rt.progress_state()
    });
    assert!(states.iter().all(|s| *s == ProgressState::Uninitialized));
}
