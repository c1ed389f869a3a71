mod common;

use common::{wait_for, Viewer, EXPECTED_ACCEPT};
use livetrace::{Profiler, ProfilerConfig};
use std::io::Read;
use std::net::{Ipv4Addr, TcpStream};
use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

fn start_profiler() -> Profiler {
    let config = ProfilerConfig::default()
        .with_port(0)
        .without_self_profile();
    Profiler::new(config).expect("profiler should start on an ephemeral port")
}

#[test]
fn test_viewer_receives_nested_samples() {
    let profiler = start_profiler();
    let mut viewer = Viewer::connect(profiler.port());
    assert!(viewer.handshake_response.starts_with("HTTP/1.1 101"));
    assert!(viewer
        .handshake_response
        .contains(&format!("Sec-WebSocket-Accept: {EXPECTED_ACCEPT}")));

    profiler.set_current_thread_name("stream-test");
    profiler.begin_sample("A", None);
    profiler.begin_sample("B", None);
    profiler.end_sample();
    profiler.end_sample();

    let msg = viewer.read_until(|v| v["id"] == "SAMPLES" && v["thread_name"] == "stream-test");
    assert_eq!(msg["nb_samples"], 2);
    let root = &msg["samples"][0];
    assert_eq!(root["name"], "A");
    assert!(root["us_length"].as_u64().is_some());
    let children = root["children"].as_array().unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["name"], "B");
    assert_eq!(children[0]["children"].as_array().unwrap().len(), 0);

    profiler.shutdown();
}

#[test]
fn test_repeated_frames_share_ids_and_digest() {
    static OUTER: AtomicU32 = AtomicU32::new(0);
    static INNER: AtomicU32 = AtomicU32::new(0);

    let profiler = start_profiler();
    let mut viewer = Viewer::connect(profiler.port());
    profiler.set_current_thread_name("digest-test");

    for _ in 0..2 {
        let _outer = profiler.scope("Frame", Some(&OUTER));
        for _ in 0..3 {
            let _inner = profiler.scope("Step", Some(&INNER));
        }
    }

    let first = viewer.read_until(|v| v["thread_name"] == "digest-test");
    let second = viewer.read_until(|v| v["thread_name"] == "digest-test");
    assert_eq!(first["sample_digest"], second["sample_digest"]);
    assert_eq!(first["samples"][0]["id"], second["samples"][0]["id"]);
    assert_eq!(first["nb_samples"], 4);

    let ids: Vec<_> = first["samples"][0]["children"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);
    profiler.shutdown();
}

#[test]
fn test_log_text_is_split_into_lines() {
    let profiler = start_profiler();
    let mut viewer = Viewer::connect(profiler.port());

    profiler.log_text("starting\nready\n");
    let first = viewer.read_until(|v| v["id"] == "LOG");
    let second = viewer.read_until(|v| v["id"] == "LOG");
    assert_eq!(first["text"], "starting");
    assert_eq!(second["text"], "ready");

    profiler.shutdown();
}

#[test]
fn test_close_frame_lets_next_viewer_in() {
    let profiler = start_profiler();
    let mut first = Viewer::connect(profiler.port());
    assert!(wait_for(|| profiler.is_client_connected()));

    first.send_close();
    assert!(wait_for(|| !profiler.is_client_connected()));

    let mut second = Viewer::connect(profiler.port());
    profiler.log_text("hello again");
    let msg = second.read_until(|v| v["id"] == "LOG");
    assert_eq!(msg["text"], "hello again");

    profiler.shutdown();
}

#[test]
fn test_queued_backlog_reaches_late_viewer() {
    let profiler = start_profiler();
    profiler.set_current_thread_name("early");
    profiler.begin_sample("BeforeViewer", None);
    profiler.end_sample();

    let mut viewer = Viewer::connect(profiler.port());
    let msg = viewer.read_until(|v| v["thread_name"] == "early");
    assert_eq!(msg["samples"][0]["name"], "BeforeViewer");
    assert_eq!(profiler.stats().trees_dropped, 0);

    profiler.shutdown();
}

#[test]
fn test_silent_connection_times_out_and_next_viewer_connects() {
    let profiler = start_profiler();

    // Connects but never sends an upgrade request
    let mut silent = TcpStream::connect((Ipv4Addr::LOCALHOST, profiler.port())).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!profiler.is_client_connected());

    let started = Instant::now();
    let mut viewer = Viewer::connect(profiler.port());
    assert!(viewer.handshake_response.starts_with("HTTP/1.1 101"));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(wait_for(|| profiler.is_client_connected()));

    // Dropped without a reply once the handshake timeout passed
    silent.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(silent.read(&mut buf).unwrap_or(0), 0);

    profiler.log_text("after timeout");
    let msg = viewer.read_until(|v| v["id"] == "LOG");
    assert_eq!(msg["text"], "after timeout");

    profiler.shutdown();
}
