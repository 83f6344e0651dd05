//! Tests for the control channel client against a scripted peer.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use wardenrun::error::Error;
use wardenrun::sandbox::rpc::{Request, RpcClient};
use wardenrun::CancelToken;

/// Serves exactly one request on `peer` with a canned response line.
fn one_shot_server(peer: UnixStream, response: &'static str) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut writer = peer.try_clone().unwrap();
        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        writer
            .write_all(format!("{response}\n").as_bytes())
            .unwrap();
        line
    })
}

#[test]
fn test_call_round_trip() {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let server = one_shot_server(
        server_end,
        r#"{"status":"ok","data":{"type":"wait_status","status":256}}"#,
    );

    let mut client = RpcClient::from_stream(client_end);
    let data = client
        .call(
            &Request::Wait { cid: "c1".into() },
            &[],
            &CancelToken::new(),
        )
        .unwrap();
    assert!(format!("{data:?}").contains("256"));

    let seen = server.join().unwrap();
    assert!(seen.contains("\"method\":\"wait\""));
    assert!(seen.contains("\"cid\":\"c1\""));
}

#[test]
fn test_error_response_maps_to_taxonomy() {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let _server = one_shot_server(
        server_end,
        r#"{"status":"error","code":"not_found","message":"no such container"}"#,
    );

    let mut client = RpcClient::from_stream(client_end);
    let err = client
        .call(
            &Request::Pause { cid: "ghost".into() },
            &[],
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err}");
}

#[test]
fn test_closed_connection_is_unreachable() {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    drop(server_end);

    let mut client = RpcClient::from_stream(client_end);
    let err = client
        .call(
            &Request::Resume { cid: "c1".into() },
            &[],
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::SandboxUnreachable(_)), "got {err}");
}

#[test]
fn test_cancellation_unblocks_pending_call() {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    // The peer reads the request but never answers.
    let _mute = std::thread::spawn(move || {
        let mut reader = BufReader::new(&server_end);
        let mut line = String::new();
        let _ = reader.read_line(&mut line);
        std::thread::sleep(Duration::from_secs(10));
    });

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        canceller.cancel();
    });

    let started = Instant::now();
    let mut client = RpcClient::from_stream(client_end);
    let err = client
        .call(&Request::Wait { cid: "c1".into() }, &[], &cancel)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err}");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_call_with_donated_files() {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let server = one_shot_server(server_end, r#"{"status":"ok"}"#);

    let file = tempfile::tempfile().unwrap();
    let mut client = RpcClient::from_stream(client_end);
    let data = client
        .call(
            &Request::CreateSubcontainer {
                cid: "c2".into(),
                has_tty: true,
            },
            &[file.as_raw_fd()],
            &CancelToken::new(),
        )
        .unwrap();
    assert!(data.is_none());

    let seen = server.join().unwrap();
    assert!(seen.contains("\"has_tty\":true"));
}
