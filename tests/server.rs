use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use httpd::{server, HandlerError, Request, Response, Server, ServerConfig};

fn local() -> ServerConfig { ServerConfig::new(([127, 0, 0, 1], 0)).with_workers(2) }

fn echo(req: Request) -> Result<Response, HandlerError> {
    let body = match req.method() {
        "GET" => req.target().as_bytes().to_vec(),
        _ => req.into_body(),
    };
    Ok(Response::with_status(200).with_body(body))
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Reads a single response framed with `Content-Length`, returning its head and body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = vec![];
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|len| len.parse::<usize>().unwrap())
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![];
    stream.read_to_end(&mut buf).unwrap();
    buf
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn exact_response_bytes() {
    let mut server = Server::new(local(), |_: Request| -> Result<Response, HandlerError> {
        Ok(Response::new(200, "OK")
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Length", "3")
            .with_body("bar"))
    });
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client.write_all(b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert_eq!(
        read_all(&mut client),
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nbar"
    );
    server.stop();
}

#[test]
fn handler_error_yields_500() {
    let mut server = Server::new(local(), |req: Request| -> Result<Response, HandlerError> {
        Err(format!("no route to {}", req.target()).into())
    });
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
    let response = String::from_utf8(read_all(&mut client)).unwrap();
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
    assert!(response.ends_with("no route to /missing\n"), "{response}");
}

#[test]
fn handler_panic_yields_500_and_worker_survives() {
    let mut server = Server::new(local(), |req: Request| -> Result<Response, HandlerError> {
        if req.target() == "/panic" {
            panic!("handler bug");
        }
        echo(req)
    });
    let addr = server.start().unwrap();

    for _ in 0..4 {
        let mut client = connect(addr);
        client.write_all(b"GET /panic HTTP/1.1\r\n\r\n").unwrap();
        let response = String::from_utf8(read_all(&mut client)).unwrap();
        assert!(response.starts_with("HTTP/1.1 500 "), "{response}");
        assert!(response.contains("handler bug"));
    }
    let mut client = connect(addr);
    client.write_all(b"GET /ok HTTP/1.1\r\n\r\n").unwrap();
    assert!(read_all(&mut client).ends_with(b"\r\n\r\n/ok"));
    assert_eq!(server.live_workers(), 2);
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    for n in 0..5 {
        write!(client, "GET /{n} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, format!("/{n}").into_bytes());
    }
    assert_eq!(server.connections(), 1);

    client.write_all(b"POST /last HTTP/1.1\r\nConnection: close\r\nContent-Length: 4\r\n\r\ndone").unwrap();
    let (_, body) = read_response(&mut client);
    assert_eq!(body, b"done");
    // The server closes the connection after the response.
    assert!(read_all(&mut client).is_empty());
    wait_for("connection to be released", || server.connections() == 0);
}

#[test]
fn connection_without_keep_alive_is_closed() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client.write_all(b"GET /once HTTP/1.1\r\n\r\n").unwrap();
    let (_, body) = read_response(&mut client);
    assert_eq!(body, b"/once");
    assert!(read_all(&mut client).is_empty());
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client
        .write_all(
            b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              PUT /b HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nbody!\
              GET /c HTTP/1.1\r\n\r\n",
        )
        .unwrap();
    let bodies = (0..3).map(|_| read_response(&mut client).1).collect::<Vec<_>>();
    assert_eq!(bodies, vec![b"/a".to_vec(), b"body!".to_vec(), b"/c".to_vec()]);
    assert!(read_all(&mut client).is_empty());
}

#[test]
fn request_split_into_fragments() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client.set_nodelay(true).unwrap();
    let request = b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
    for chunk in request.chunks(7) {
        client.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let (_, body) = read_response(&mut client);
    assert_eq!(body, b"0123456789");
}

#[test]
fn large_bodies_survive_partial_io() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let payload = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let mut client = connect(addr);
    let mut writer = client.try_clone().unwrap();
    let sent = payload.clone();
    let upload = thread::spawn(move || {
        write!(writer, "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", sent.len()).unwrap();
        writer.write_all(&sent).unwrap();
    });
    let (_, body) = read_response(&mut client);
    upload.join().unwrap();
    assert!(body == payload);
}

#[test]
fn malformed_request_gets_no_response() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    for garbage in [
        &b"THIS IS NOT HTTP\r\n\r\n"[..],
        b"GET / HTTP/1.1\r\nno colon here\r\n\r\n",
        b"GET / HTTP/2.0\r\n\r\n",
        b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
    ] {
        let mut client = connect(addr);
        client.write_all(garbage).unwrap();
        let mut buf = vec![];
        // The server may reset the connection instead of closing it gracefully.
        let _ = client.read_to_end(&mut buf);
        assert!(buf.is_empty(), "{}", String::from_utf8_lossy(&buf));
    }
    wait_for("connections to be released", || server.connections() == 0);
}

#[test]
fn peer_disconnect_releases_connection() {
    let mut server = Server::new(local(), echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    client.write_all(b"GET /never-finished HTTP/1.1\r\nHost:").unwrap();
    wait_for("connection to be registered", || server.connections() == 1);
    client.shutdown(Shutdown::Both).unwrap();
    drop(client);
    wait_for("connection to be released", || server.connections() == 0);
}

#[test]
fn idle_connections_are_reaped() {
    let config = local()
        .with_idle_timeout(Some(Duration::from_millis(300)))
        .with_reap_interval(Duration::from_millis(20));
    let mut server = Server::new(config, echo);
    let addr = server.start().unwrap();

    let mut silent = connect(addr);
    let mut active = connect(addr);
    wait_for("connections to be registered", || server.connections() == 2);

    // Keep one connection busy past the threshold.
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(600) {
        active.write_all(b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert_eq!(read_response(&mut active).1, b"/ping");
        thread::sleep(Duration::from_millis(50));
    }

    // The silent one was closed without any response.
    assert!(read_all(&mut silent).is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.connections(), 1);

    // Now the active one goes silent as well.
    assert!(read_all(&mut active).is_empty());
    wait_for("all connections to be reaped", || server.connections() == 0);
}

#[test]
fn disabled_reaper_keeps_connections() {
    let config = local().with_idle_timeout(None);
    let mut server = Server::new(config, echo);
    let addr = server.start().unwrap();

    let mut client = connect(addr);
    thread::sleep(Duration::from_millis(300));
    client.write_all(b"GET /late HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut client).1, b"/late");
}

#[test]
fn slow_handler_does_not_block_other_workers() {
    let mut server = Server::new(local(), |req: Request| -> Result<Response, HandlerError> {
        if req.target() == "/slow" {
            thread::sleep(Duration::from_millis(1500));
        }
        echo(req)
    });
    let addr = server.start().unwrap();

    // Round-robin puts the two connections on different workers.
    let mut slow = connect(addr);
    let mut fast = connect(addr);
    wait_for("connections to be registered", || server.connections() == 2);

    slow.write_all(b"GET /slow HTTP/1.1\r\n\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    fast.write_all(b"GET /fast HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut fast).1, b"/fast");
    assert!(started.elapsed() < Duration::from_millis(1000));

    assert_eq!(read_response(&mut slow).1, b"/slow");
}

#[test]
fn concurrent_clients() {
    let mut server = Server::new(local().with_workers(3), echo);
    let addr = server.start().unwrap();

    let clients = (0..8)
        .map(|c| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                for n in 0..25 {
                    write!(stream, "GET /{c}/{n} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
                    assert_eq!(read_response(&mut stream).1, format!("/{c}/{n}").into_bytes());
                }
            })
        })
        .collect::<Vec<_>>();
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn lifecycle() {
    let mut server = Server::new(local(), echo);
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);

    let addr = server.start().unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(server.local_addr(), Some(addr));
    assert!(matches!(server.start(), Err(server::Error::AlreadyRunning)));

    let mut client = connect(addr);
    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.connections(), 0);
    // Open connections are dropped on stop.
    let mut buf = vec![];
    let _ = client.read_to_end(&mut buf);
    assert!(buf.is_empty());
    assert!(TcpStream::connect(addr).is_err());

    // The server can be started again.
    let addr = server.start().unwrap();
    let mut client = connect(addr);
    client.write_all(b"GET /again HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut client).1, b"/again");
}

#[test]
fn bind_failure_is_reported() {
    let mut first = Server::new(local(), echo);
    let addr = first.start().unwrap();

    let mut second = Server::new(ServerConfig::new(addr), echo);
    assert!(matches!(second.start(), Err(server::Error::Bind(a, _)) if a == addr));
}
