//! Protocol upgrade: 101 negotiation and raw-socket handoff.

mod common;

use common::{connect, send};
use hearth::{
    Daemon, Handler, HandlerAction, Request, Response, StatusCode, ThreadingModel, UpgradedIo,
};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct EchoUpgrader {
    handoffs: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl Handler for EchoUpgrader {
    fn respond(&self, req: &Request<'_>) -> HandlerAction {
        if req.upgrade_requested() && req.header(b"upgrade") == Some(b"echo") {
            HandlerAction::Respond(
                Response::builder(StatusCode::SwitchingProtocols)
                    .header("Upgrade", "echo")
                    .build(),
            )
        } else {
            HandlerAction::Respond(Response::empty(StatusCode::UpgradeRequired))
        }
    }

    fn upgraded(&self, io: UpgradedIo) {
        let UpgradedIo {
            socket,
            tls,
            extra_in,
        } = io;
        assert!(tls.is_none());
        self.handoffs.lock().unwrap().send(extra_in.clone()).unwrap();

        // Speak the "echo protocol" on the raw socket for a moment.
        let mut stream: std::net::TcpStream = socket.into();
        stream.set_nonblocking(false).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        std::thread::spawn(move || {
            if !extra_in.is_empty() {
                let _ = stream.write_all(&extra_in);
            }
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 {
                    break;
                }
                if stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        });
    }
}

#[test]
fn upgrade_hands_socket_and_buffered_bytes_to_callback() {
    let (tx, rx) = mpsc::channel();
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .handler(EchoUpgrader {
            handoffs: Mutex::new(tx),
        })
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    // Bytes past the request must reach the callback exactly once.
    send(
        &mut stream,
        b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\nearly",
    );

    // Read the 101 header block.
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 1024];
    while Instant::now() < deadline {
        if let Ok(n) = stream.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        if out.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&out);
    assert!(
        text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{text}"
    );
    assert!(text.contains("Upgrade: echo\r\n"), "{text}");
    assert!(text.contains("Connection: Upgrade\r\n"), "{text}");

    let extra = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(extra, b"early");

    // The echo thread first replays the buffered bytes, then echoes.
    let mut replay = [0u8; 5];
    stream.read_exact(&mut replay).unwrap();
    assert_eq!(&replay, b"early");

    stream.write_all(b"ping-raw").unwrap();
    let mut echoed = [0u8; 8];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping-raw");

    daemon.stop().unwrap();
}

#[test]
fn upgrade_header_without_connection_token_is_ignored() {
    let (tx, _rx) = mpsc::channel();
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .handler(EchoUpgrader {
            handoffs: Mutex::new(tx),
        })
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    send(&mut stream, b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: echo\r\n\r\n");

    let text = common::read_response(&mut stream);
    assert!(text.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{text}");

    daemon.stop().unwrap();
}
