//! Admission control, timeouts, lifecycle notifications and
//! suspend/resume against a live daemon.

mod common;

use common::{closed_within, connect, read_response, send};
use hearth::{
    ConnectionEvent, Daemon, Handler, HandlerAction, Request, Response, StatusCode,
    TerminationReason, ThreadingModel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

struct Ok200;

impl Handler for Ok200 {
    fn respond(&self, _: &Request<'_>) -> HandlerAction {
        HandlerAction::Respond(Response::bytes(StatusCode::Ok, "ok"))
    }
}

#[test]
fn per_ip_cap_closes_excess_connections() {
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .per_ip_connection_limit(2)
        .handler(Ok200)
        .start()
        .unwrap();

    let mut first = connect(daemon.local_addr());
    let mut second = connect(daemon.local_addr());
    // Make sure both are admitted before the third arrives.
    send(&mut first, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    send(&mut second, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(read_response(&mut first).contains("200 OK"));
    assert!(read_response(&mut second).contains("200 OK"));

    let mut third = connect(daemon.local_addr());
    assert!(
        closed_within(&mut third, Duration::from_secs(2)),
        "third connection from the same IP must be dropped"
    );

    // The first two stay serviceable.
    send(&mut first, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(read_response(&mut first).contains("200 OK"));

    daemon.stop().unwrap();
}

#[test]
fn idle_timeout_fires_notify() {
    let (tx, rx) = mpsc::channel();
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .connection_timeout(Duration::from_secs(1))
        .notify_completed(move |_, reason| {
            let _ = tx.send(reason);
        })
        .handler(Ok200)
        .start()
        .unwrap();

    let mut idle = connect(daemon.local_addr());
    assert!(
        closed_within(&mut idle, Duration::from_secs(2)),
        "idle connection must be closed by the timeout"
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)),
        Ok(TerminationReason::TimedOut)
    );

    daemon.stop().unwrap();
}

#[test]
fn activity_defers_the_timeout() {
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .connection_timeout(Duration::from_secs(2))
        .handler(Ok200)
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(900));
        send(&mut stream, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let text = read_response(&mut stream);
        assert!(text.contains("200 OK"), "{text}");
    }

    daemon.stop().unwrap();
}

#[test]
fn accept_policy_rejects_before_processing() {
    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = rejected.clone();

    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .accept_policy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })
        .handler(Ok200)
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    assert!(closed_within(&mut stream, Duration::from_secs(2)));
    assert!(rejected.load(Ordering::SeqCst) >= 1);

    daemon.stop().unwrap();
}

#[test]
fn lifecycle_notifications_fire() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let completions = Arc::new(Mutex::new(Vec::new()));
    let completion_sink = completions.clone();

    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .notify_connection(move |_, event| sink.lock().unwrap().push(event))
        .notify_completed(move |_, reason| completion_sink.lock().unwrap().push(reason))
        .handler(Ok200)
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    send(&mut stream, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(read_response(&mut stream).contains("200 OK"));
    assert!(closed_within(&mut stream, Duration::from_secs(2)));

    // Allow the cleanup queue a turn.
    std::thread::sleep(Duration::from_millis(200));
    daemon.stop().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.first(), Some(&ConnectionEvent::Started));
    assert!(events.contains(&ConnectionEvent::Closed));

    let completions = completions.lock().unwrap();
    assert_eq!(completions.as_slice(), &[TerminationReason::CompletedOk]);
}

#[test]
fn suspend_then_resume_completes_request() {
    struct Suspender {
        announced: Arc<Mutex<mpsc::Sender<hearth::ConnectionId>>>,
        resumed: AtomicUsize,
    }

    impl Handler for Suspender {
        fn respond(&self, req: &Request<'_>) -> HandlerAction {
            if self.resumed.fetch_add(1, Ordering::SeqCst) == 0 {
                self.announced.lock().unwrap().send(req.id()).unwrap();
                HandlerAction::Suspend
            } else {
                HandlerAction::Respond(Response::bytes(StatusCode::Ok, "resumed"))
            }
        }
    }

    let (tx, rx) = mpsc::channel();
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .per_ip_connection_limit(1)
        .handler(Suspender {
            announced: Arc::new(Mutex::new(tx)),
            resumed: AtomicUsize::new(0),
        })
        .start()
        .unwrap();

    let mut stream = connect(daemon.local_addr());
    send(&mut stream, b"GET /parked HTTP/1.1\r\nHost: x\r\n\r\n");

    let id = rx.recv_timeout(Duration::from_secs(3)).expect("suspend id");

    // While suspended, nothing comes back and stop() must refuse.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(daemon.suspended_connections(), 1);
    assert!(daemon.stop().is_err());

    // The parked connection no longer occupies its per-IP slot, so a
    // second connection from the same address gets through a cap of one.
    let mut second = connect(daemon.local_addr());
    send(&mut second, b"GET /other HTTP/1.1\r\nHost: x\r\n\r\n");
    let text = read_response(&mut second);
    assert!(text.ends_with("resumed"), "{text}");
    drop(second);

    daemon.resume(id);
    let text = read_response(&mut stream);
    assert!(text.ends_with("resumed"), "{text}");

    assert_eq!(daemon.suspended_connections(), 0);
    daemon.stop().unwrap();
}

#[test]
fn connection_limit_drops_excess() {
    let mut daemon = Daemon::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .threading(ThreadingModel::InternalThread)
        .connection_limit(1)
        .handler(Ok200)
        .start()
        .unwrap();

    let mut first = connect(daemon.local_addr());
    send(&mut first, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(read_response(&mut first).contains("200 OK"));

    let mut second = connect(daemon.local_addr());
    assert!(closed_within(&mut second, Duration::from_secs(2)));

    daemon.stop().unwrap();
}
