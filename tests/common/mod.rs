//! Helpers for running a simulated job, one thread per rank.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use ferrocomm::loopback::{LoopbackDevice, LoopbackFabric};
use ferrocomm::{Runtime, RuntimeConfig, ThreadLevel};

/// Run `f` on every rank of `fabric`, each with its own runtime, and collect
/// the results in rank order.
pub fn run_job<T, F>(fabric: &LoopbackFabric, config: RuntimeConfig, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Runtime) -> T + Send + Sync + 'static,
{
    run_job_with_device(fabric, config, ThreadLevel::Multiple, move |rt, _| f(rt))
}

/// Like [`run_job`], also handing each rank its device endpoint.
pub fn run_job_with_device<T, F>(
    fabric: &LoopbackFabric,
    config: RuntimeConfig,
    level: ThreadLevel,
    f: F,
) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Runtime, Arc<LoopbackDevice>) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = (0..fabric.size())
        .map(|rank| {
            let fabric = fabric.clone();
            let config = config.clone();
            let f = Arc::clone(&f);
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let device = fabric.device(rank);
                    let rt = Runtime::init_thread(
                        level,
                        config,
                        device.clone(),
                        fabric.topology(rank),
                    )
                    .unwrap();
                    f(rt, device)
                })
                .unwrap()
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
