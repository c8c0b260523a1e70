//! SOCKS5 front end
//!
//! Accepts client connections, requires username/password
//! authentication against the credential store, and tunnels CONNECT
//! requests through the dial orchestrator. BIND and UDP ASSOCIATE are
//! rejected.

use super::InboundListener;
use crate::auth::UserStore;
use crate::common::net::{configure_tcp_stream, copy_bidirectional_owned, Address};
use crate::common::socks::{
    AuthMethodFlags, AuthResponse, Command, Request, Response, UsernamePasswordAuth,
    AUTH_NO_ACCEPTABLE, AUTH_USERNAME_PASSWORD, REP_COMMAND_NOT_SUPPORTED,
    REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE, REP_HOST_UNREACHABLE,
};
use crate::dialer::Dialer;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// SOCKS5 proxy listener
pub struct Socks5Listener {
    listen: String,
    users: Arc<UserStore>,
    dialer: Arc<Dialer>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Socks5Listener {
    pub fn new(
        listen: impl Into<String>,
        users: Arc<UserStore>,
        dialer: Arc<Dialer>,
        shutdown: CancellationToken,
    ) -> Self {
        Socks5Listener {
            listen: listen.into(),
            users,
            dialer,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    async fn handle_connection(
        users: Arc<UserStore>,
        dialer: Arc<Dialer>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        scope: CancellationToken,
    ) {
        if let Err(e) =
            Self::process_connection(&users, &dialer, stream, peer_addr, &scope).await
        {
            debug!(peer = %peer_addr, err = %e, "SOCKS5 connection error");
        }
    }

    async fn process_connection(
        users: &UserStore,
        dialer: &Dialer,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        scope: &CancellationToken,
    ) -> Result<()> {
        // Authentication negotiation: username/password is mandatory.
        let methods = AuthMethodFlags::read_from(&mut stream).await?;
        if !methods.username_password {
            AuthResponse::new(AUTH_NO_ACCEPTABLE)
                .write_to(&mut stream)
                .await?;
            return Err(Error::auth("No acceptable authentication method"));
        }
        AuthResponse::new(AUTH_USERNAME_PASSWORD)
            .write_to(&mut stream)
            .await?;

        let auth = UsernamePasswordAuth::read_from(&mut stream).await?;
        if !users.verify(&auth.username, &auth.password) {
            UsernamePasswordAuth::write_response(&mut stream, false).await?;
            return Err(Error::auth(format!(
                "invalid credentials for '{}'",
                auth.username
            )));
        }
        UsernamePasswordAuth::write_response(&mut stream, true).await?;

        let request = Request::read_from(&mut stream).await?;
        match request.command {
            Command::Connect => {
                Self::handle_connect(dialer, stream, peer_addr, request, scope).await
            }
            Command::Bind | Command::UdpAssociate => {
                Response::failure(REP_COMMAND_NOT_SUPPORTED)
                    .write_to(&mut stream)
                    .await?;
                Err(Error::unsupported("only CONNECT is supported"))
            }
        }
    }

    async fn handle_connect(
        dialer: &Dialer,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        request: Request,
        scope: &CancellationToken,
    ) -> Result<()> {
        let target = request.address.to_string_with_port(request.port);
        debug!(peer = %peer_addr, target = %target, "SOCKS5 CONNECT");

        match dialer.dial(scope, "tcp", &target).await {
            Ok(remote) => {
                let local_addr = stream
                    .local_addr()
                    .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                Response::success(Address::from(local_addr.ip()), local_addr.port())
                    .write_to(&mut stream)
                    .await?;

                let (sent, received) = copy_bidirectional_owned(stream, remote).await?;
                debug!(
                    peer = %peer_addr,
                    target = %target,
                    sent,
                    received,
                    "SOCKS5 CONNECT completed"
                );
                Ok(())
            }
            Err(e) => {
                let reply = match &e {
                    Error::NoActiveProxy => REP_GENERAL_FAILURE,
                    _ if e.to_string().contains("refused") => REP_CONNECTION_REFUSED,
                    _ if e.to_string().contains("unreachable") => REP_HOST_UNREACHABLE,
                    _ => REP_GENERAL_FAILURE,
                };
                Response::failure(reply).write_to(&mut stream).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl InboundListener for Socks5Listener {
    fn name(&self) -> &str {
        "SOCKS5"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        info!(listen = %addr, "SOCKS5 server listening");

        self.running.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        configure_tcp_stream(&stream);
                        let users = self.users.clone();
                        let dialer = self.dialer.clone();
                        let scope = self.shutdown.child_token();
                        tokio::spawn(async move {
                            Self::handle_connection(users, dialer, stream, peer_addr, scope)
                                .await;
                        });
                    }
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            error!(err = %e, "SOCKS5 accept error");
                        }
                    }
                },
                _ = self.shutdown.cancelled() => {
                    info!("SOCKS5 server stopping");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        Ok(())
    }
}
