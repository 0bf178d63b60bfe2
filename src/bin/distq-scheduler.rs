//! Scheduler (master) entry point: `distq-scheduler <config-file>`.

use std::process::exit;
use std::sync::Arc;

use distq::config::{self, SchedulerConfig};
use distq::scheduler::{self, dispatch, SchedulerState};

fn main() {
    let config_path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: distq-scheduler <config-file>");
            exit(2);
        }
    };

    let map = config::load_kv(&config_path).unwrap_or_else(|e| {
        eprintln!("distq-scheduler: {}", e);
        exit(1);
    });
    let cfg = SchedulerConfig::from_map(&map).unwrap_or_else(|e| {
        eprintln!("distq-scheduler: {}", e);
        exit(1);
    });

    env_logger::Builder::new()
        .parse_filters(&cfg.log_level)
        .init();

    let state = Arc::new(SchedulerState::new(cfg.policy));
    dispatch::spawn_aging_thread(Arc::clone(&state), cfg.aging_interval_ms);

    let addr = format!("0.0.0.0:{}", cfg.listen_port);
    if let Err(e) = scheduler::serve(&addr, state) {
        eprintln!("distq-scheduler: {}", e);
        exit(1);
    }
}
