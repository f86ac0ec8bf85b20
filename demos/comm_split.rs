//! Communicator split example - a simulated job of 8 ranks on 2 nodes.
//!
//! Every rank runs on its own thread with its own runtime, connected through
//! the loopback fabric. Each rank splits world by parity, then by node, and
//! prints what it sees, including the node hierarchy of world.
//!
//! Run with: cargo run --example comm_split

use std::thread;

use ferrocomm::loopback::LoopbackFabric;
use ferrocomm::{Info, Result, Runtime, RuntimeConfig, SplitType, ThreadLevel};

const NODES: usize = 2;
const PER_NODE: usize = 4;

fn rank_main(fabric: LoopbackFabric, rank: usize) -> Result<()> {
    let rt = Runtime::init_thread(
        ThreadLevel::Multiple,
        RuntimeConfig::from_env(),
        fabric.device(rank),
        fabric.topology(rank),
    )?;
    let world = rt.world();
    let size = world.size();

    let color = (rank % 2) as i32;
    let Some(sub) = world.split(color, rank as i32)? else {
        return rt.finalize();
    };
    let group_name = if color == 0 { "even" } else { "odd" };

    let Some(node) = world.split_type(SplitType::Shared, 0, &Info::new())? else {
        sub.release()?;
        return rt.finalize();
    };

    println!(
        "World rank {}/{}: {} group rank {}/{}, node rank {}/{}, world spans {} nodes",
        rank,
        size,
        group_name,
        sub.rank(),
        sub.size(),
        node.rank(),
        node.size(),
        world.node_count(),
    );

    node.release()?;
    sub.release()?;
    rt.finalize()
}

fn main() {
    let fabric = LoopbackFabric::uniform(NODES, PER_NODE);
    let ranks: Vec<_> = (0..fabric.size())
        .map(|rank| {
            let fabric = fabric.clone();
            thread::spawn(move || rank_main(fabric, rank))
        })
        .collect();

    let mut failed = false;
    for (rank, handle) in ranks.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("rank {rank} failed: {e}");
                failed = true;
            }
            Err(_) => {
                eprintln!("rank {rank} panicked");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    println!("\nComm split demo passed!");
}
