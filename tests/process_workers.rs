//! Dispatcher with real worker processes, started from the server binary.
//! Kept in their own test binary because the reaper waits on any child of
//! the process.

use remote_uptime::config::{Config, Isolation, WorkerConfig};
use remote_uptime::logging::LogLevel;
use remote_uptime::server::Server;
use remote_uptime::worker::ProcessSpawner;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_mixed_connections_leave_no_unreclaimed_workers() {
    let worker = WorkerConfig {
        read_timeout_ms: 200,
        command: "echo".to_string(),
        args: vec!["up 1 min".to_string()],
        ..WorkerConfig::default()
    };
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        backlog: 10,
        busy_backoff_ms: 10,
        isolation: Isolation::Process,
        log_level: LogLevel::None,
        worker: worker.clone(),
    };

    let spawner = ProcessSpawner::new(
        PathBuf::from(env!("CARGO_BIN_EXE_server")),
        worker.to_settings().unwrap(),
        LogLevel::None,
    );
    let server = Server::with_spawner(&config, Box::new(spawner)).unwrap();
    let addr = server.local_addr().unwrap();
    let reaper = server.reaper().clone();
    thread::spawn(move || server.run());

    let mut idle = Vec::new();
    for i in 0..20 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        match i % 4 {
            0 => {
                stream.write_all(b"GET_SYS_INFO\n").unwrap();
                let mut reply = Vec::new();
                stream.read_to_end(&mut reply).unwrap();
                assert_eq!(reply, b"up 1 min\n");
            }
            1 => {
                stream.write_all(b"WHAT\n").unwrap();
                let mut reply = Vec::new();
                stream.read_to_end(&mut reply).unwrap();
                assert_eq!(reply, b"ERROR: Unknown command\n");
            }
            2 => {
                // Goes quiet; the worker times out.
                idle.push(stream);
            }
            _ => {
                // Hangs up right after asking.
                stream.write_all(b"GET_SYS_INFO\n").unwrap();
                stream.shutdown(Shutdown::Both).unwrap();
            }
        }
    }

    for mut stream in idle {
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        assert!(reply.is_empty());
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while reaper.live() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(reaper.live(), 0);
}
