use crate::auth::{Auth, Connection};
use crate::config::{resolve_to_socketaddr, Config};
use crate::error::AuthError;
use crate::http::{self, Request, MAX_HEAD_SIZE};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for inactive connections (15 minutes).
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Timeout for connecting to the requested host (5 seconds).
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for data relay.
const RELAY_BUF_SIZE: usize = 16 * 1024;

/// How long and how much to drain from a client before closing it.
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);
const LINGER_LIMIT: u64 = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// An accepted client socket with its addresses captured at accept time.
pub struct ClientConn {
    stream: TcpStream,
    remote: SocketAddr,
    local: SocketAddr,
}

impl ClientConn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(ClientConn {
            stream,
            remote,
            local,
        })
    }
}

impl Read for ClientConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ClientConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for ClientConn {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Bind every configured listen address, then serve them all until the
/// accept loops end.
pub fn run_server(config: Arc<Config>, auth: Arc<Auth>) -> io::Result<()> {
    let mut listeners = Vec::new();
    for addr in config.listen_addrs() {
        // SO_REUSEADDR is set automatically by TcpListener::bind on Unix
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", listener.local_addr()?);
        listeners.push(listener);
    }
    if auth.is_required() {
        info!("proxy authentication enabled");
    }

    let handles: Vec<_> = listeners
        .into_iter()
        .map(|listener| {
            let config = Arc::clone(&config);
            let auth = Arc::clone(&auth);
            thread::spawn(move || accept_loop(listener, config, auth))
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn accept_loop(listener: TcpListener, config: Arc<Config>, auth: Arc<Auth>) {
    for stream in listener.incoming() {
        match stream {
            Ok(client_stream) => {
                let config = Arc::clone(&config);
                let auth = Arc::clone(&auth);
                thread::spawn(move || {
                    handle_client(client_stream, &config, &auth);
                });
            }
            Err(e) => {
                warn!("failed to accept connection: {e}");
                thread::sleep(Duration::from_micros(64));
            }
        }
    }
}

/// Handle a single client connection.
fn handle_client(stream: TcpStream, config: &Config, auth: &Auth) {
    let _ = stream.set_read_timeout(Some(INACTIVITY_TIMEOUT));
    let mut conn = match ClientConn::new(stream) {
        Ok(conn) => conn,
        Err(_) => return,
    };
    if let Err(e) = serve(&mut conn, config, auth) {
        debug!(client = %conn.remote, "connection closed: {e}");
    }
    close_gracefully(&conn.stream);
}

/// Send FIN and drain what the client still has in flight, so a final
/// response is not lost to a reset caused by unread input.
fn close_gracefully(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    let _ = stream.set_read_timeout(Some(LINGER_TIMEOUT));
    let _ = io::copy(&mut stream.take(LINGER_LIMIT), &mut io::sink());
}

/// Request loop. Unauthenticated requests are answered with a 407 and the
/// connection stays open for the retry; the first admitted request takes
/// the connection over.
fn serve(conn: &mut ClientConn, config: &Config, auth: &Auth) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        let Some((req, head_len)) = read_request_head(conn, &mut buf)? else {
            return Ok(());
        };
        buf.drain(..head_len);

        match auth.authenticate(conn, &req) {
            Ok(()) => return dispatch(conn, config, &req, buf),
            // A chunked body cannot be skipped without decoding it.
            Err(AuthError::AuthRequired) if req.is_chunked() => return Ok(()),
            Err(AuthError::AuthRequired) => discard_body(conn, &mut buf, req.content_length())?,
            Err(e) if e.is_bad_request() => {
                warn!(client = %conn.remote, "bad authorization request: {e}");
                let page = http::error_page(400, "Bad Request", "Bad authorization request", &e.to_string());
                conn.write_all(page.as_bytes())?;
                return Ok(());
            }
            Err(e) => return Err(io::Error::other(e)),
        }
    }
}

/// Read until `buf` holds a complete request head. `Ok(None)` means the
/// client closed the connection between requests.
fn read_request_head(
    conn: &mut ClientConn,
    buf: &mut Vec<u8>,
) -> io::Result<Option<(Request, usize)>> {
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            match http::parse_request_head(buf) {
                Ok(Some(parsed)) => return Ok(Some(parsed)),
                Ok(None) if buf.len() >= MAX_HEAD_SIZE => {
                    return Err(bad_request(conn, "request head too large"));
                }
                Ok(None) => {}
                Err(e) => return Err(bad_request(conn, &e.to_string())),
            }
        }

        let n = conn.read(&mut chunk)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drop the body of a refused request so the next head starts clean.
fn discard_body(conn: &mut ClientConn, buf: &mut Vec<u8>, len: usize) -> io::Result<()> {
    let buffered = len.min(buf.len());
    buf.drain(..buffered);
    let remaining = (len - buffered) as u64;
    if remaining > 0 {
        let skipped = io::copy(&mut Read::by_ref(conn).take(remaining), &mut io::sink())?;
        if skipped < remaining {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request body",
            ));
        }
    }
    Ok(())
}

/// Send a 400 and return the error that ends the connection.
fn bad_request(conn: &mut ClientConn, detail: &str) -> io::Error {
    let page = http::error_page(400, "Bad Request", "Invalid request", detail);
    let _ = conn.write_all(page.as_bytes());
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

/// Send a 502 for a host we could not reach.
fn bad_gateway(conn: &mut ClientConn, host: &str, port: u16, err: io::Error) -> io::Error {
    let detail = format!("{host}:{port}: {err}");
    let page = http::error_page(502, "Bad Gateway", "Cannot connect to host", &detail);
    let _ = conn.write_all(page.as_bytes());
    err
}

/// Serve an admitted request: CONNECT becomes a tunnel, an absolute-form
/// request is forwarded alone with the proxy headers stripped, and its
/// response ends the connection.
fn dispatch(conn: &mut ClientConn, config: &Config, req: &Request, leftover: Vec<u8>) -> io::Result<()> {
    let client = conn.remote;

    if req.is_connect() {
        let Some((host, port)) = http::parse_host_port(&req.uri, 443) else {
            return Err(bad_request(conn, "invalid CONNECT target"));
        };
        let mut remote = match connect_target(&host, port, config.bind_addr) {
            Ok(stream) => stream,
            Err(e) => return Err(bad_gateway(conn, &host, port, e)),
        };
        info!(%client, "CONNECT {host}:{port}");
        conn.write_all(CONNECT_ESTABLISHED)?;
        if !leftover.is_empty() {
            remote.write_all(&leftover)?;
        }
        copyloop(&mut conn.stream, remote);
        return Ok(());
    }

    let Some((host, port, path)) = http::split_absolute_uri(&req.uri) else {
        return Err(bad_request(conn, "request target must be an absolute http URI"));
    };
    if req.is_chunked() {
        let page = http::error_page(411, "Length Required", "Chunked request bodies are not supported", "");
        conn.write_all(page.as_bytes())?;
        return Ok(());
    }
    let mut remote = match connect_target(&host, port, config.bind_addr) {
        Ok(stream) => stream,
        Err(e) => return Err(bad_gateway(conn, &host, port, e)),
    };
    info!(%client, "{} http://{host}:{port}{path}", req.method);
    remote.write_all(&req.forward_head(&path))?;
    forward_body(conn, &mut remote, &leftover, req.content_length())?;
    relay_response(remote, &mut conn.stream);
    Ok(())
}

/// Send exactly `len` body bytes upstream, buffered ones first. Anything
/// the client sent after the body is dropped.
fn forward_body(
    conn: &mut ClientConn,
    remote: &mut TcpStream,
    leftover: &[u8],
    len: usize,
) -> io::Result<()> {
    let buffered = len.min(leftover.len());
    remote.write_all(&leftover[..buffered])?;
    let remaining = (len - buffered) as u64;
    if remaining > 0 {
        let sent = io::copy(&mut Read::by_ref(conn).take(remaining), remote)?;
        if sent < remaining {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request body",
            ));
        }
    }
    Ok(())
}

/// Copy the origin's response to the client until the origin closes.
fn relay_response(mut remote: TcpStream, client: &mut TcpStream) {
    let _ = remote.set_read_timeout(Some(INACTIVITY_TIMEOUT));
    let _ = io::copy(&mut remote, client);
    let _ = remote.shutdown(Shutdown::Both);
}

/// Connect to a target host, respecting the bind address.
/// When multiple addresses are resolved (e.g. IPv6 + IPv4 for "localhost"),
/// each is tried in order until one succeeds.
fn connect_target(host: &str, port: u16, bind_addr: Option<IpAddr>) -> io::Result<TcpStream> {
    let addrs = resolve_to_socketaddr(host, port)?;

    let stream = if let Some(bind_ip) = bind_addr {
        // Pick the first address whose family matches the bind address.
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4() == bind_ip.is_ipv4())
            .or(addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addr"))?;
        connect_with_bind(addr, bind_ip)?
    } else {
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses");
        let mut connected = None;
        for &addr in &addrs {
            match TcpStream::connect_timeout(&addr, UPSTREAM_TIMEOUT) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        connected.ok_or(last_err)?
    };
    stream.set_write_timeout(Some(UPSTREAM_TIMEOUT))?;
    Ok(stream)
}

/// Connect to a target address, binding to a specific local IP first.
fn connect_with_bind(target: SocketAddr, bind_ip: IpAddr) -> io::Result<TcpStream> {
    let domain = if target.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.bind(&socket2::SockAddr::from(SocketAddr::new(bind_ip, 0)))?;
    socket.connect_timeout(&socket2::SockAddr::from(target), UPSTREAM_TIMEOUT)?;
    Ok(TcpStream::from(socket))
}

/// Bidirectional data relay between two TCP streams.
/// Uses two threads with read timeouts for inactivity detection.
fn copyloop(client: &mut TcpStream, remote: TcpStream) {
    let mut client_read = match client.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut remote_read = match remote.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };

    let _ = client_read.set_read_timeout(Some(INACTIVITY_TIMEOUT));
    let _ = remote_read.set_read_timeout(Some(INACTIVITY_TIMEOUT));

    let mut remote_write = remote;

    // client -> remote
    let handle = thread::spawn(move || {
        let mut buf = [0u8; RELAY_BUF_SIZE];
        loop {
            match client_read.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if remote_write.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = remote_write.shutdown(Shutdown::Write);
    });

    // remote -> client in the current thread
    let mut buf = [0u8; RELAY_BUF_SIZE];
    loop {
        match remote_read.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if client.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = client.shutdown(Shutdown::Write);
    let _ = remote_read.shutdown(Shutdown::Both);
    let _ = client.shutdown(Shutdown::Both);
    let _ = handle.join();
}
