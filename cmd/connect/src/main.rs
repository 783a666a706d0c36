//! Loopback connect demo for the IOManager
//!
//! One coroutine accepts on a non-blocking listener, sleeping until the
//! listener is readable; another connects, waits for write readiness and
//! sends a line. A third arms a read it never gets and is woken by
//! `cancel_event` instead.
//!
//! # Environment Variables
//!
//! - `COSCHED_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `COSCHED_EPOLL_TIMEOUT_MS=100` - Reactor wait bound

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cosched::{kerror, kinfo, sleep_now, Direction, IOManager, TaskResult};

/// Arm `dir` on `fd` for the running coroutine and sleep until it fires
fn wait_for(fd: i32, dir: Direction) -> TaskResult {
    let iom = IOManager::current().ok_or("not running on an IOManager")?;
    iom.add_event(fd, dir, None)?;
    sleep_now();
    Ok(())
}

fn accept_one(listener: TcpListener) -> TaskResult {
    let (mut conn, peer) = loop {
        match listener.accept() {
            Ok(pair) => break pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                wait_for(listener.as_raw_fd(), Direction::Read)?
            }
            Err(e) => return Err(e.into()),
        }
    };
    kinfo!("accepted {}", peer);
    conn.set_nonblocking(true)?;

    let mut buf = [0u8; 64];
    let n = loop {
        match conn.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                wait_for(conn.as_raw_fd(), Direction::Read)?
            }
            Err(e) => return Err(e.into()),
        }
    };
    println!("server got: {}", String::from_utf8_lossy(&buf[..n]).trim_end());
    Ok(())
}

fn send_one(addr: std::net::SocketAddr) -> TaskResult {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_nonblocking(true)?;
    wait_for(stream.as_raw_fd(), Direction::Write)?;
    stream.write_all(b"hello from a coroutine\n")?;
    kinfo!("client sent");
    Ok(())
}

fn main() {
    println!("=== cosched Connect Example ===\n");

    let iom = match IOManager::new(2, false, "io") {
        Ok(iom) => iom,
        Err(e) => {
            eprintln!("IOManager: {}", e);
            return;
        }
    };

    let listener = match TcpListener::bind("127.0.0.1:0").and_then(|l| {
        l.set_nonblocking(true)?;
        Ok(l)
    }) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bind: {}", e);
            iom.stop();
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("local_addr: {}", e);
            iom.stop();
            return;
        }
    };
    println!("listening on {}", addr);

    iom.spawn(move || {
        if let Err(e) = accept_one(listener) {
            kerror!("server: {}", e);
        }
    });
    iom.spawn(move || {
        if let Err(e) = send_one(addr) {
            kerror!("client: {}", e);
        }
    });

    // A read that never arrives, cancelled from outside
    let (idle_rx, _idle_tx) = match std::os::unix::net::UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("socketpair: {}", e);
            iom.stop();
            return;
        }
    };
    let fd = idle_rx.as_raw_fd();
    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    let armed = iom.add_event(
        fd,
        Direction::Read,
        Some(cosched::Task::new(move || w.store(true, Ordering::SeqCst))),
    );
    if let Err(e) = armed {
        eprintln!("add_event: {}", e);
    } else {
        println!("armed fd {}: {}", fd, iom.armed(fd));
        println!("cancel_event -> {}", iom.cancel_event(fd, Direction::Read));
    }

    iom.stop();
    println!("cancelled waiter ran: {}", woke.load(Ordering::SeqCst));
    println!("\n=== Example Complete ===");
}
