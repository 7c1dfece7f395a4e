//! Non-blocking accept/read/write event loop: owns listening and client
//! sockets, enforces the size/time limits from §4.7, and routes completed
//! requests through the HTTP parser into the method handlers.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::socket::{bind, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};

use crate::config::Container;
use crate::http::{self, handlers::RequestContext, response};

/// Header block size ceiling before headers are complete, per §4.7.2.
const MAX_HEADER_SIZE: usize = 4 * 1024;
/// Total request size ceiling once headers are complete, per §4.7.3.
const MAX_REQUEST_SIZE: usize = 68 * 1024;
/// Non-chunked body size ceiling, per §4.7.3.
const MAX_BODY_SIZE: usize = 64 * 1024;
/// Idle-with-incomplete-headers timeout, per §5.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll wait quantum, used to drive the idle sweep even under no traffic.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Listen backlog, per §4.7 "Startup".
const LISTEN_BACKLOG: usize = 10;

/// Client tokens live above this offset; listener tokens are `0..listeners.len()`.
const CLIENT_TOKEN_OFFSET: usize = 1 << 20;

struct ListenerEntry {
    listener: TcpListener,
    port: u16,
    addr: String,
}

struct Client {
    stream: mio::net::TcpStream,
    peer_addr: String,
    local_port: u16,
    local_addr: String,
    ingress: Vec<u8>,
    egress: Vec<u8>,
    last_activity: Instant,
    headers_complete: bool,
}

fn client_token(fd: RawFd) -> Token {
    Token(CLIENT_TOKEN_OFFSET + fd as usize)
}

/// Bind a single listening socket with `SO_REUSEADDR`, matching §4.7
/// "Startup": create, set SO_REUSEADDR, bind, listen(backlog=10). The
/// socket is created with `SOCK_CLOEXEC` so it never leaks into a spawned
/// CGI child, substituting for the "close every inherited fd" step of
/// §4.6's spawn protocol.
fn bind_listener(port: u16, addr: &str) -> io::Result<TcpListener> {
    let ip: Ipv4Addr = if addr.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        addr.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    };

    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(io::Error::from)?;
    setsockopt(&sock, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    let sockaddr = SockaddrIn::from(SocketAddrV4::new(ip, port));
    bind(sock.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
    listen(&sock, LISTEN_BACKLOG).map_err(io::Error::from)?;

    let std_listener = std::net::TcpListener::from(sock);
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener))
}

/// Collect the unique `(port, addr)` pairs across every configured server,
/// skipping duplicates so repeated `listen` directives reuse one socket.
fn unique_listen_endpoints(container: &Container) -> Vec<(u16, String)> {
    let mut out: Vec<(u16, String)> = Vec::new();
    for server in &container.servers {
        for (port, addr) in &server.listens {
            if !out.iter().any(|(p, a)| p == port && a == addr) {
                out.push((*port, addr.clone()));
            }
        }
    }
    out
}

/// Bind every configured listener and drive the event loop until the
/// process is killed. Returns an error only when no listener could be
/// bound at all, per §7 "the loop itself treats ... failed to bind every
/// listener ... as fatal".
pub fn run(container: Container) -> io::Result<()> {
    // Writing to a peer that has already closed its read side raises
    // SIGPIPE by default; ignoring it once at startup lets every write
    // path below report a normal `Err` instead of killing the process,
    // standing in for per-call `MSG_NOSIGNAL` from §4.7.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(256);

    let mut listeners = Vec::new();
    for (index, (port, addr)) in unique_listen_endpoints(&container).into_iter().enumerate() {
        let mut listener = bind_listener(port, &addr)?;
        log::info!(
            "listening on {}:{port}",
            if addr.is_empty() { "0.0.0.0" } else { addr.as_str() }
        );
        poll.registry().register(&mut listener, Token(index), Interest::READABLE)?;
        listeners.push(ListenerEntry { listener, port, addr });
    }
    if listeners.is_empty() {
        return Err(io::Error::other("failed to bind any listener"));
    }

    let mut clients: HashMap<RawFd, Client> = HashMap::new();

    loop {
        poll.poll(&mut events, Some(POLL_TIMEOUT))?;

        for event in events.iter() {
            let token = event.token();
            if token.0 < listeners.len() {
                accept_all(&listeners[token.0], &mut poll, &mut clients);
                continue;
            }

            let fd = (token.0 - CLIENT_TOKEN_OFFSET) as RawFd;
            if event.is_error() {
                close_client(&mut poll, &mut clients, fd);
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                handle_readable(&container, &mut poll, &mut clients, fd);
            }
            if clients.contains_key(&fd) && event.is_writable() {
                handle_writable(&mut poll, &mut clients, fd);
            }
        }

        sweep_idle(&mut poll, &mut clients);
    }
}

fn accept_all(entry: &ListenerEntry, poll: &mut Poll, clients: &mut HashMap<RawFd, Client>) {
    loop {
        match entry.listener.accept() {
            Ok((mut stream, peer)) => {
                let fd = stream.as_raw_fd();
                let local_addr = stream
                    .local_addr()
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|_| entry.addr.clone());
                let token = client_token(fd);
                // Registered for both read and write readiness up front,
                // per §4.7 Loop: "accept and register the new client for
                // both read and write readiness".
                if let Err(e) = poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                {
                    log::debug!("failed to register accepted client: {e}");
                    continue;
                }
                log::debug!("accepted client {peer} on port {}", entry.port);
                clients.insert(
                    fd,
                    Client {
                        stream,
                        peer_addr: peer.ip().to_string(),
                        local_port: entry.port,
                        local_addr,
                        ingress: Vec::new(),
                        egress: Vec::new(),
                        last_activity: Instant::now(),
                        headers_complete: false,
                    },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::debug!("accept failed: {e}");
                break;
            }
        }
    }
}

fn close_client(poll: &mut Poll, clients: &mut HashMap<RawFd, Client>, fd: RawFd) {
    if let Some(mut client) = clients.remove(&fd) {
        let _ = poll.registry().deregister(&mut client.stream);
        log::debug!("closed client {}", client.peer_addr);
    }
}

fn handle_readable(container: &Container, poll: &mut Poll, clients: &mut HashMap<RawFd, Client>, fd: RawFd) {
    let mut buf = [0u8; 8192];
    loop {
        let Some(client) = clients.get_mut(&fd) else { return };
        match client.stream.read(&mut buf) {
            Ok(0) => {
                close_client(poll, clients, fd);
                return;
            }
            Ok(n) => {
                client.ingress.extend_from_slice(&buf[..n]);
                client.last_activity = Instant::now();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => {
                close_client(poll, clients, fd);
                return;
            }
        }
    }

    let Some(client) = clients.get_mut(&fd) else { return };
    if let Some(response) = validate_and_respond(container, client) {
        client.egress.extend_from_slice(&response.build());
        flush_or_close(poll, clients, fd);
    }
}

/// Progressive ingress validation (§4.7): checks run in order as bytes
/// arrive, producing at most one response per readable event.
fn validate_and_respond(container: &Container, client: &mut Client) -> Option<http::Response> {
    let fallback_server = container.select_server(client.local_port, &client.local_addr);

    if let Some(line_end) = find_subslice(&client.ingress, b"\r\n") {
        if let Err(status) = validate_request_line(&client.ingress[..line_end]) {
            return Some(response::error_response(status, None, fallback_server));
        }
    }

    let header_end = http::request::header_end(&client.ingress);
    let Some(head_end) = header_end else {
        if client.ingress.len() > MAX_HEADER_SIZE {
            return Some(response::error_response(431, None, fallback_server));
        }
        return None;
    };
    client.headers_complete = true;

    if client.ingress.len() > MAX_REQUEST_SIZE {
        return Some(response::error_response(413, None, fallback_server));
    }

    let head_lower = String::from_utf8_lossy(&client.ingress[..head_end]).to_ascii_lowercase();
    let is_chunked = head_lower.contains("transfer-encoding") && head_lower.contains("chunked");

    if is_chunked {
        // Chunked requests bypass size enforcement here entirely, per §9:
        // only the terminating chunk gates when we attempt to parse.
        if find_subslice(&client.ingress[head_end..], b"0\r\n\r\n").is_none() {
            return None;
        }
    } else {
        let declared = declared_content_length(&client.ingress[..head_end]);
        let received = client.ingress.len().saturating_sub(head_end);
        if declared.map(|d| d > MAX_BODY_SIZE as u64).unwrap_or(false) || received > MAX_BODY_SIZE {
            return Some(response::error_response(413, None, fallback_server));
        }
        if let Some(declared) = declared {
            if received < declared as usize {
                return None;
            }
        }
    }

    let request = match http::parse_request(&client.ingress) {
        Ok(r) => r,
        Err(e) => return Some(response::error_response(e.status_code(), None, fallback_server)),
    };

    let ctx = RequestContext::bind(container, client.local_port, &client.local_addr, &request.path);
    let response = http::handlers::dispatch(&ctx, &request, &client.peer_addr, client.local_port);
    log::info!(
        "{} {} {} -> {}",
        client.peer_addr,
        request.method.as_str(),
        request.path,
        response.status
    );
    Some(response)
}

fn declared_content_length(head: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

/// Request-line sanity check run as soon as the first CRLF is seen, per
/// §4.7.1: three non-empty whitespace-separated fields, a supported
/// version, no non-printable bytes, well-formed `%HH` escapes.
fn validate_request_line(line: &[u8]) -> Result<(), u16> {
    if line.iter().any(|b| *b < 0x20 && *b != b'\t') {
        return Err(400);
    }
    let text = std::str::from_utf8(line).map_err(|_| 400u16)?;
    let fields: Vec<&str> = text.split(' ').collect();
    if fields.len() != 3 || fields.iter().any(|f| f.is_empty()) {
        return Err(400);
    }
    if fields[2] != "HTTP/1.0" && fields[2] != "HTTP/1.1" {
        return Err(400);
    }
    if !crate::utils::has_valid_percent_encoding(fields[1]) {
        return Err(400);
    }
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn flush_or_close(poll: &mut Poll, clients: &mut HashMap<RawFd, Client>, fd: RawFd) {
    handle_writable(poll, clients, fd);
}

fn handle_writable(poll: &mut Poll, clients: &mut HashMap<RawFd, Client>, fd: RawFd) {
    let Some(client) = clients.get_mut(&fd) else { return };
    if client.egress.is_empty() {
        return;
    }
    match client.stream.write(&client.egress) {
        Ok(0) => close_client(poll, clients, fd),
        Ok(n) => {
            client.egress.drain(..n);
            if client.egress.is_empty() {
                // Responses always advertise HTTP/1.0, implying connection
                // close, per §4.7.
                close_client(poll, clients, fd);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(_) => close_client(poll, clients, fd),
    }
}

fn sweep_idle(poll: &mut Poll, clients: &mut HashMap<RawFd, Client>) {
    let now = Instant::now();
    let timed_out: Vec<RawFd> = clients
        .iter()
        .filter(|(_, c)| !c.headers_complete && now.duration_since(c.last_activity) > IDLE_TIMEOUT)
        .map(|(fd, _)| *fd)
        .collect();

    for fd in timed_out {
        if let Some(client) = clients.get_mut(&fd) {
            log::debug!("timing out idle client {}", client.peer_addr);
            let resp = http::Response::new(408)
                .header("Content-Type", "text/html")
                .body("<html><body><h1>Error 408</h1></body></html>".as_bytes());
            client.egress.extend_from_slice(&resp.build());
        }
        handle_writable(poll, clients, fd);
        close_client(poll, clients, fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_rejects_wrong_field_count() {
        assert_eq!(validate_request_line(b"GET / HTTP/1.1 extra"), Err(400));
    }

    #[test]
    fn request_line_rejects_bad_version() {
        assert_eq!(validate_request_line(b"GET / HTTP/2.0"), Err(400));
    }

    #[test]
    fn request_line_accepts_well_formed_line() {
        assert_eq!(validate_request_line(b"GET /a%20b HTTP/1.1"), Ok(()));
    }

    #[test]
    fn request_line_rejects_malformed_percent_escape() {
        assert_eq!(validate_request_line(b"GET /a%2g HTTP/1.1"), Err(400));
    }

    #[test]
    fn declared_content_length_reads_header_case_insensitively() {
        let head = b"GET / HTTP/1.1\r\nContent-Length: 42\r\n\r\n";
        assert_eq!(declared_content_length(head), Some(42));
    }

    #[test]
    fn find_subslice_locates_terminator() {
        assert_eq!(find_subslice(b"abc0\r\n\r\ndef", b"0\r\n\r\n"), Some(3));
        assert_eq!(find_subslice(b"abc", b"0\r\n\r\n"), None);
    }
}
