//! Inbound SOCKS5 negotiation (RFC 1928)
//!
//! Only what the tunnel entrance needs: no-auth method selection and the
//! CONNECT command. The parsed target address is handed to the caller;
//! the actual connection is established at the far end of the tunnel, so
//! the success reply is sent before any dialing happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Address, ProxyError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// SOCKS protocol version
const SOCKS_VERSION: u8 = 0x05;

/// No-authentication method code
const AUTH_NONE: u8 = 0x00;

/// No acceptable method marker
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

/// CONNECT command code
const CMD_CONNECT: u8 = 0x01;

/// Reply code: succeeded
const REPLY_SUCCEEDED: u8 = 0x00;

/// Reply code: command not supported
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Negotiate with an inbound SOCKS5 client and return the requested
/// target address.
pub async fn handshake<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 262];

    // greeting: version and offered methods
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    if !buf[..nmethods].contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(ProxyError::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    // request: version, command, reserved, address type
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidVersion(buf[0]));
    }
    let command = buf[1];
    let atyp = buf[3];

    let address = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Ipv4(ip, u16::from_be_bytes(port))
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Domain(domain, u16::from_be_bytes(port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Ipv6(ip, u16::from_be_bytes(port))
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };

    if command != CMD_CONNECT {
        let reply = make_reply(REPLY_COMMAND_NOT_SUPPORTED, &address);
        stream.write_all(&reply).await?;
        return Err(ProxyError::UnsupportedCommand(command));
    }

    debug!("SOCKS5 CONNECT to {}", address);
    let reply = make_reply(REPLY_SUCCEEDED, &address);
    stream.write_all(&reply).await?;

    Ok(address)
}

fn make_reply(code: u8, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, code, 0x00];
    buf.extend_from_slice(&addr.encode());
    buf
}
