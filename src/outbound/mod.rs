//! Upstream SOCKS5 client (RFC 1928)
//!
//! Dials a target `host:port` through one upstream SOCKS5 proxy,
//! authenticating with username/password (RFC 1929) when credentials
//! are configured. Used by both the health-check probe and the client
//! dial path.

use crate::common::net::{configure_tcp_stream, split_host_port, Address};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Client-side SOCKS5 dialer bound to one upstream proxy
pub struct Socks5Dialer {
    server: String,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Dialer {
    /// Validate the upstream address and credentials and build a dialer.
    ///
    /// The username, when present, must be non-empty; a `None` username
    /// selects the no-auth method regardless of the password.
    pub fn new(
        server: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        split_host_port(server)
            .map_err(|e| Error::dialer(format!("invalid upstream address '{}': {}", server, e)))?;

        let username = username.filter(|u| !u.is_empty());
        if let Some(u) = username {
            if u.len() > 255 {
                return Err(Error::dialer("username too long"));
            }
            if password.map_or(0, |p| p.len()) > 255 {
                return Err(Error::dialer("password too long"));
            }
        }

        Ok(Socks5Dialer {
            server: server.to_string(),
            username: username.map(|u| u.to_string()),
            password: password.map(|p| p.to_string()),
        })
    }

    /// Upstream proxy address this dialer is bound to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Open a TCP tunnel to `target` (`host:port`) through the upstream.
    ///
    /// The returned stream is positioned just past the SOCKS5 reply; all
    /// subsequent bytes belong to the tunneled connection.
    pub async fn dial(&self, network: &str, target: &str) -> Result<TcpStream> {
        if network != "tcp" {
            return Err(Error::unsupported(format!(
                "network '{}' not supported by SOCKS5 CONNECT",
                network
            )));
        }

        let (host, port) = split_host_port(target)
            .map_err(|e| Error::address(format!("invalid target '{}': {}", target, e)))?;

        let mut stream = TcpStream::connect(&self.server)
            .await
            .map_err(|e| Error::connection(format!("connect to upstream {}: {}", self.server, e)))?;
        configure_tcp_stream(&stream);

        self.handshake(&mut stream, host, port).await?;

        debug!(upstream = %self.server, target = %target, "SOCKS5 tunnel established");
        Ok(stream)
    }

    /// Perform the SOCKS5 greeting, authentication, and CONNECT exchange.
    async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<()> {
        // Greeting with offered auth methods
        let greeting: &[u8] = if self.username.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream
            .write_all(greeting)
            .await
            .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

        let mut response = [0u8; 2];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::protocol("Invalid SOCKS5 version"));
        }

        match response[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD => self.authenticate_password(stream).await?,
            AUTH_NO_ACCEPTABLE => {
                return Err(Error::auth("No acceptable authentication method"));
            }
            m => {
                return Err(Error::protocol(format!(
                    "Unsupported authentication method: {}",
                    m
                )));
            }
        }

        // CONNECT request
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match Address::from(host) {
            Address::Ipv4(ip) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                if domain.len() > 255 {
                    return Err(Error::address("Domain name too long"));
                }
                request.push(ATYP_DOMAIN);
                request.push(domain.len() as u8);
                request.extend_from_slice(domain.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());

        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::connection(format!("Failed to send SOCKS5 connect request: {}", e)))?;

        // Reply
        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;

        if reply[0] != SOCKS5_VERSION {
            return Err(Error::protocol("Invalid SOCKS5 version in reply"));
        }
        if reply[1] != REP_SUCCESS {
            return Err(Error::connection(reply_error_message(reply[1])));
        }

        // Skip the bound address
        match reply[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4 + 2];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16 + 2];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut buf = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut buf).await?;
            }
            _ => {
                return Err(Error::protocol("Invalid address type in reply"));
            }
        }

        Ok(())
    }

    /// RFC 1929 username/password authentication
    async fn authenticate_password<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<()> {
        let username = self
            .username
            .as_deref()
            .ok_or_else(|| Error::auth("Upstream requires authentication, no username configured"))?;
        let password = self.password.as_deref().unwrap_or_default();

        let mut auth_request = vec![0x01];
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());

        stream.write_all(&auth_request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[1] != 0x00 {
            return Err(Error::auth("Upstream rejected credentials"));
        }

        Ok(())
    }
}

/// Convert reply code to error message
fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_validates_address() {
        assert!(Socks5Dialer::new("10.0.0.1:1080", None, None).is_ok());
        assert!(Socks5Dialer::new("10.0.0.1", None, None).is_err());
        assert!(Socks5Dialer::new("", None, None).is_err());
    }

    #[test]
    fn test_empty_username_means_no_auth() {
        let d = Socks5Dialer::new("10.0.0.1:1080", Some(""), Some("secret")).unwrap();
        assert!(d.username.is_none());
    }

    #[test]
    fn test_reply_error_messages() {
        assert_eq!(
            reply_error_message(REP_CONNECTION_REFUSED),
            "Connection refused"
        );
        assert_eq!(
            reply_error_message(REP_NETWORK_UNREACHABLE),
            "Network unreachable"
        );
    }

    #[tokio::test]
    async fn test_dial_rejects_non_tcp() {
        let d = Socks5Dialer::new("10.0.0.1:1080", None, None).unwrap();
        assert!(matches!(
            d.dial("udp", "example.com:80").await,
            Err(Error::Unsupported(_))
        ));
    }
}
