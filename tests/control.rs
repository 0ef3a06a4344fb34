#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use portmux::control::{self, ControlError, ControlServer};
use portmux::endpoint::{Endpoint, Mapping};
use portmux::engine::Engine;
use portmux::wire::{MAX_FRAME_LEN, Message};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[tokio::test]
async fn manage_mappings_over_the_socket() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");

    // A leftover file from an earlier run is replaced.
    std::fs::write(&path, b"stale").unwrap();

    let engine = Arc::new(Engine::new().unwrap());
    let runner = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.run())
    };

    let server = ControlServer::bind(&path).unwrap();
    let server = tokio::spawn(server.serve(Arc::clone(&engine)));

    let src = Endpoint::tcp("127.0.0.1", 0);
    let dest = Endpoint::tcp("127.0.0.1", 8080);

    control::add(&path, src.clone(), dest.clone()).await.unwrap();
    assert!(matches!(
        control::add(&path, src.clone(), dest.clone()).await,
        Err(ControlError::Rejected)
    ));
    assert!(matches!(
        control::add(&path, Endpoint::udp("127.0.0.1", 0), dest.clone()).await,
        Err(ControlError::Rejected)
    ));

    let mappings = control::list(&path).await.unwrap();
    assert_eq!(
        mappings,
        vec![Mapping {
            src: src.clone(),
            dest
        }]
    );

    control::del(&path, src.clone()).await.unwrap();
    assert!(matches!(
        control::del(&path, src).await,
        Err(ControlError::Rejected)
    ));
    assert!(control::list(&path).await.unwrap().is_empty());

    let reply = control::request(&path, Message::Ack(true)).await.unwrap();
    assert_eq!(reply, Message::Ack(false));

    control::quit(&path).await.unwrap();
    server.await.unwrap();
    assert!(!path.exists());

    runner.join().unwrap().unwrap();
}

#[tokio::test]
async fn malformed_request_only_ends_its_connection() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");

    let engine = Arc::new(Engine::new().unwrap());
    let server = ControlServer::bind(&path).unwrap();
    let server = tokio::spawn(server.serve(Arc::clone(&engine)));

    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(&[0x7f, 0, 0]).await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());

    // Closing without sending anything is not fatal either.
    drop(UnixStream::connect(&path).await.unwrap());

    assert!(control::list(&path).await.unwrap().is_empty());

    server.abort();
    let _ = server.await;
    assert!(!path.exists());
}

#[tokio::test]
async fn endless_request_is_cut_off() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");

    let engine = Arc::new(Engine::new().unwrap());
    let server = ControlServer::bind(&path).unwrap();
    let server = tokio::spawn(server.serve(Arc::clone(&engine)));

    // A listing that announces u32::MAX mappings and keeps sending them.
    let mut endpoint = Vec::new();
    endpoint.extend_from_slice(&0u32.to_be_bytes());
    endpoint.extend_from_slice(&80u32.to_be_bytes());
    endpoint.extend_from_slice(&1u32.to_be_bytes());
    let chunk = endpoint.repeat(2 * 4096);

    let mut stream = UnixStream::connect(&path).await.unwrap();
    let mut header = vec![4];
    header.extend_from_slice(&u32::MAX.to_be_bytes());
    stream.write_all(&header).await.unwrap();

    let sent = tokio::time::timeout(Duration::from_secs(10), async {
        let mut sent = 0;
        while sent < 8 * MAX_FRAME_LEN {
            if stream.write_all(&chunk).await.is_err() {
                return Some(sent);
            }
            sent += chunk.len();
        }
        None
    })
    .await
    .unwrap();

    let sent = sent.expect("the server kept reading");
    assert!(sent < 8 * MAX_FRAME_LEN);

    // The server itself keeps going.
    assert!(control::list(&path).await.unwrap().is_empty());

    server.abort();
    let _ = server.await;
}

