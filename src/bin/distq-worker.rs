//! Worker entry point: `distq-worker <config-file> <worker-id>`.

use std::process::exit;

use distq::config::{self, WorkerConfig};
use distq::worker;

fn main() {
    let mut args = std::env::args().skip(1);
    let (config_path, worker_id) = match (args.next(), args.next()) {
        (Some(c), Some(w)) => (c, w),
        _ => {
            eprintln!("usage: distq-worker <config-file> <worker-id>");
            exit(2);
        }
    };

    env_logger::init();

    let map = config::load_kv(&config_path).unwrap_or_else(|e| {
        eprintln!("distq-worker: {}", e);
        exit(1);
    });
    let cfg = WorkerConfig::from_map(&map).unwrap_or_else(|e| {
        eprintln!("distq-worker: {}", e);
        exit(1);
    });

    if let Err(e) = worker::run(&worker_id, &cfg) {
        eprintln!("distq-worker {}: {}", worker_id, e);
        exit(1);
    }
}
