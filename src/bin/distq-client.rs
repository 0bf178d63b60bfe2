//! Minimal client driver: `distq-client <scheduler-host:port> <script-path> [priority]`.
//!
//! Submits one query and prints every reply until the scheduler reports it
//! finished. Composing multiple submissions into a session, or any kind of
//! interactive shell, is left to the caller.

use std::process::exit;

use distq::client::{Session, SchedulerReply};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (addr, script_path) = match (args.next(), args.next()) {
        (Some(a), Some(s)) => (a, s),
        _ => {
            eprintln!("usage: distq-client <scheduler-host:port> <script-path> [priority]");
            exit(2);
        }
    };
    let priority: i32 = args.next().map(|s| s.parse().unwrap_or(0)).unwrap_or(0);

    let mut session = Session::connect(&addr).unwrap_or_else(|e| {
        eprintln!("distq-client: {}", e);
        exit(1);
    });

    if let Err(e) = session.submit_query(&script_path, priority) {
        eprintln!("distq-client: {}", e);
        exit(1);
    }

    loop {
        match session.next_reply() {
            Ok(SchedulerReply::ReadResult { query_id, file_tag, data }) => {
                println!("query {} read {}: {} bytes", query_id, file_tag, data.len());
            }
            Ok(SchedulerReply::QueryFinished { reason }) => {
                println!("query finished: {}", reason);
                break;
            }
            Ok(SchedulerReply::ExecError { message }) => {
                eprintln!("query error: {}", message);
                break;
            }
            Err(e) => {
                eprintln!("distq-client: {}", e);
                exit(1);
            }
        }
    }
}
