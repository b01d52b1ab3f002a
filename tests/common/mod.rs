//! Loopback stub servers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_rustls::TlsAcceptor;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What an origin stub answers with.
#[derive(Clone, Copy)]
pub enum Reply {
    Ok(&'static str),
    Status(u16, &'static str),
    /// Close the connection without answering.
    Hangup,
    /// Keep the connection open and never answer.
    Stall,
    /// Send the head and the first bytes of the body, then stall.
    PartialBody,
}

/// A TLS acceptor with a self-signed certificate for `localhost` and `example.com`.
pub fn tls_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut &include_bytes!("../data/cert.pem")[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &include_bytes!("../data/key.pem")[..])
        .unwrap()
        .unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Read one HTTP/1.1 request (head plus `Content-Length` body).
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf).to_string())
}

pub async fn answer<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    reply: Reply,
    seen: &UnboundedSender<String>,
) {
    let (code, body) = match reply {
        Reply::Hangup => return,
        Reply::Stall => {
            let _ = read_request(stream).await;
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            return;
        }
        Reply::PartialBody => {
            let Some(request) = read_request(stream).await else {
                return;
            };
            let _ = seen.send(request);
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .await;
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            return;
        }
        Reply::Ok(body) => (200, body),
        Reply::Status(code, body) => (code, body),
    };
    let Some(request) = read_request(stream).await else {
        return;
    };
    let _ = seen.send(request);
    let response = format!(
        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// An origin (or plain HTTP forward proxy) serving `replies` in order; the
/// last reply repeats. Returns its address, the received requests and the
/// number of accepted connections.
pub async fn origin(
    replies: Vec<Reply>,
) -> (SocketAddr, UnboundedReceiver<String>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let reply = replies[n.min(replies.len() - 1)];
            let tx = tx.clone();
            tokio::spawn(async move {
                answer(&mut stream, reply, &tx).await;
            });
        }
    });

    (addr, rx, accepted)
}

/// Handshake bytes a SOCKS stub received, and the HTTP request that followed.
#[derive(Debug, Default)]
pub struct SocksSession {
    pub greeting: Vec<u8>,
    pub auth: Vec<u8>,
    pub connect: Vec<u8>,
    pub request: String,
}

/// A SOCKS5 proxy that answers HTTP itself after the tunnel is "opened".
///
/// `credentials` makes it require username/password authentication.
pub async fn socks5_stub(
    credentials: Option<(&'static str, &'static str)>,
    body: &'static str,
) -> (SocketAddr, UnboundedReceiver<SocksSession>) {
    socks5_stub_with_tls(credentials, body, None).await
}

/// Like [`socks5_stub`], speaking TLS inside the tunnel when `tls` is set.
pub async fn socks5_stub_with_tls(
    credentials: Option<(&'static str, &'static str)>,
    body: &'static str,
    tls: Option<TlsAcceptor>,
) -> (SocketAddr, UnboundedReceiver<SocksSession>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                if let Some(session) = serve_socks5(stream, credentials, body, tls).await {
                    let _ = tx.send(session);
                }
            });
        }
    });

    (addr, rx)
}

async fn serve_socks5(
    mut stream: TcpStream,
    credentials: Option<(&'static str, &'static str)>,
    body: &'static str,
    tls: Option<TlsAcceptor>,
) -> Option<SocksSession> {
    let mut session = SocksSession::default();

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.ok()?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await.ok()?;
    session.greeting = [head.to_vec(), methods.clone()].concat();

    match credentials {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                stream.write_all(&[0x05, 0xFF]).await.ok()?;
                return Some(session);
            }
            stream.write_all(&[0x05, 0x02]).await.ok()?;

            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await.ok()?;
            let mut uname = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut uname).await.ok()?;
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.ok()?;
            let mut passwd = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut passwd).await.ok()?;
            session.auth = [ver_ulen.to_vec(), uname.clone(), plen.to_vec(), passwd.clone()].concat();

            let ok = uname == user.as_bytes() && passwd == pass.as_bytes();
            stream
                .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
                .await
                .ok()?;
            if !ok {
                return Some(session);
            }
        }
        None => stream.write_all(&[0x05, 0x00]).await.ok()?,
    }

    let mut req = [0u8; 5];
    stream.read_exact(&mut req).await.ok()?;
    let mut rest = vec![0u8; req[4] as usize + 2];
    stream.read_exact(&mut rest).await.ok()?;
    session.connect = [req.to_vec(), rest].concat();
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x00])
        .await
        .ok()?;

    match tls {
        Some(acceptor) => {
            let mut tls_stream = acceptor.accept(stream).await.ok()?;
            serve_tunneled(&mut tls_stream, body, &mut session).await;
        }
        None => serve_tunneled(&mut stream, body, &mut session).await,
    }
    Some(session)
}

/// A SOCKS4/4a proxy that answers HTTP itself after granting the tunnel.
pub async fn socks4_stub(body: &'static str) -> (SocketAddr, UnboundedReceiver<SocksSession>) {
    socks4_stub_with_reply(0x5A, body).await
}

/// A SOCKS4/4a proxy answering every request with `reply`; only `0x5A` opens the tunnel.
pub async fn socks4_stub_with_reply(
    reply: u8,
    body: &'static str,
) -> (SocketAddr, UnboundedReceiver<SocksSession>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut session = SocksSession::default();
                let mut head = [0u8; 8];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                session.connect = head.to_vec();
                let Some(user_id) = read_until_nul(&mut stream).await else {
                    return;
                };
                session.connect.extend_from_slice(&user_id);
                if head[4..7] == [0, 0, 0] && head[7] != 0 {
                    let Some(host) = read_until_nul(&mut stream).await else {
                        return;
                    };
                    session.connect.extend_from_slice(&host);
                }
                if stream
                    .write_all(&[0x00, reply, 0, 0, 0, 0, 0, 0])
                    .await
                    .is_err()
                {
                    return;
                }
                if reply != 0x5A {
                    let _ = tx.send(session);
                    return;
                }
                serve_tunneled(&mut stream, body, &mut session).await;
                let _ = tx.send(session);
            });
        }
    });

    (addr, rx)
}

async fn read_until_nul(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut b = [0u8; 1];
        stream.read_exact(&mut b).await.ok()?;
        out.push(b[0]);
        if b[0] == 0 {
            return Some(out);
        }
    }
}

async fn serve_tunneled<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    body: &'static str,
    session: &mut SocksSession,
) {
    let Some(request) = read_request(stream).await else {
        return;
    };
    session.request = request;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// What an HTTP proxy received on `CONNECT`, and the request sent through the tunnel.
#[derive(Debug, Default)]
pub struct ConnectSession {
    pub connect: String,
    pub request: String,
}

/// An HTTP proxy that accepts `CONNECT`, then terminates TLS itself and
/// answers the tunneled request with `body`.
pub async fn connect_proxy_stub(body: &'static str) -> (SocketAddr, UnboundedReceiver<ConnectSession>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = unbounded_channel();
    let acceptor = tls_acceptor();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut session = ConnectSession::default();
                let Some(connect) = read_request(&mut stream).await else {
                    return;
                };
                session.connect = connect;
                if stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut socks = SocksSession::default();
                serve_tunneled(&mut tls, body, &mut socks).await;
                session.request = socks.request;
                let _ = tx.send(session);
            });
        }
    });

    (addr, rx)
}

/// An address nothing listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
