//! SOCKS4 CONNECT, switching to SOCKS4a when the destination is not an
//! IPv4 literal.

use super::TargetAddr;
use crate::error::{Error, Result};

use log::debug;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS4_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const REP_GRANTED: u8 = 0x5A;

/// 0.0.0.x with x != 0 tells the proxy a host name follows the user id.
const SOCKS4A_PLACEHOLDER: [u8; 4] = [0, 0, 0, 1];

/// Negotiate a SOCKS4/4a tunnel to `target` over `stream`.
///
/// `user_id` is sent as the SOCKS4 user id; there is no password.
pub async fn handshake<S>(stream: &mut S, target: &TargetAddr, user_id: Option<&str>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if target.port == 0 {
        return Err(Error::InvalidTargetPort("0".into()));
    }
    let user_id = user_id.unwrap_or("");
    let ipv4 = target.host.parse::<Ipv4Addr>().ok();

    let mut request = Vec::with_capacity(9 + user_id.len() + target.host.len() + 1);
    request.push(SOCKS4_VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&target.port.to_be_bytes());
    match ipv4 {
        Some(ip) => request.extend_from_slice(&ip.octets()),
        None => request.extend_from_slice(&SOCKS4A_PLACEHOLDER),
    }
    request.extend_from_slice(user_id.as_bytes());
    request.push(0x00);
    if ipv4.is_none() {
        request.extend_from_slice(target.host.as_bytes());
        request.push(0x00);
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != REP_GRANTED {
        return Err(Error::ProxyConnectFailed {
            protocol: "socks4",
            reply: reply[1],
        });
    }

    debug!(
        "{}: tunnel to {} established",
        if ipv4.is_some() { "socks4" } else { "socks4a" },
        target
    );
    Ok(())
}
