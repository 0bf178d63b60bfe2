//! Storage engine entry point: `distq-storage <config-file>`.

use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use distq::config::{self, StorageConfig};
use distq::storage::protocol;
use distq::storage::StorageEngine;

fn main() {
    env_logger::init();

    let config_path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: distq-storage <config-file>");
            exit(2);
        }
    };

    let map = config::load_kv(&config_path).unwrap_or_else(|e| {
        eprintln!("distq-storage: {}", e);
        exit(1);
    });
    let cfg = StorageConfig::from_map(&map).unwrap_or_else(|e| {
        eprintln!("distq-storage: {}", e);
        exit(1);
    });

    let engine = StorageEngine::new(
        cfg.mount_point.clone().into(),
        cfg.fs_size,
        cfg.block_size,
        cfg.fresh_start,
        Duration::from_millis(cfg.operation_delay_ms),
        Duration::from_millis(cfg.block_access_delay_ms),
    )
    .unwrap_or_else(|e| {
        eprintln!("distq-storage: {}", e);
        exit(1);
    });

    let addr = format!("0.0.0.0:{}", cfg.listen_port);
    if let Err(e) = protocol::serve(&addr, Arc::new(Mutex::new(engine))) {
        eprintln!("distq-storage: {}", e);
        exit(1);
    }
}
