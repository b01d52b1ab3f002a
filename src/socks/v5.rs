//! SOCKS5 CONNECT (RFC 1928) with username/password authentication (RFC 1929).
//!
//! The destination is always sent as a domain name so that the proxy
//! resolves it.

use super::TargetAddr;
use crate::error::{Error, Result};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Negotiate a SOCKS5 tunnel to `target` over `stream`.
///
/// Username/password authentication is offered when either credential is
/// non-empty. Both must fit in 255 bytes, as must the destination host.
pub async fn handshake<S>(
    stream: &mut S,
    target: &TargetAddr,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = username.unwrap_or("");
    let password = password.unwrap_or("");
    let with_auth = !username.is_empty() || !password.is_empty();

    if target.port == 0 {
        return Err(Error::InvalidTargetPort("0".into()));
    }
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::CredentialsTooLong);
    }
    if target.host.len() > 255 {
        return Err(Error::InvalidTarget(target.to_string()));
    }

    // greeting
    let greeting: &[u8] = if with_auth {
        &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::UnexpectedVersion {
            protocol: "socks5",
            version: choice[0],
        });
    }

    match choice[1] {
        AUTH_NONE => debug!("socks5: no authentication required"),
        AUTH_PASSWORD if with_auth => {
            debug!("socks5: using password authentication");
            authenticate(stream, username, password).await?;
        }
        // includes 0xFF, no acceptable method
        other => return Err(Error::UnsupportedAuthMethod(other)),
    }

    // connect request, destination as a domain name
    let host = target.host.as_bytes();
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    read_reply(stream).await?;
    debug!("socks5: tunnel to {} established", target);
    Ok(())
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(Error::AuthenticationFailed {
            status: response[1],
        });
    }
    Ok(())
}

/// Read the connect reply and discard the bound address.
async fn read_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::UnexpectedVersion {
            protocol: "socks5",
            version: head[0],
        });
    }
    if head[1] != REP_SUCCESS {
        return Err(Error::ProxyConnectFailed {
            protocol: "socks5",
            reply: head[1],
        });
    }

    // bound address plus 2 port bytes
    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(Error::UnknownAddressType(other)),
    };
    let mut bound = [0u8; 255 + 2];
    stream.read_exact(&mut bound[..remaining]).await?;
    Ok(())
}
