//! One port reachability attempt.
//!
//! The session owns a short-lived listener task together with the readiness
//! and shutdown signals of that task. Signals are created per session, so two
//! sessions never observe each other.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, error, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ECHO_BUFFER_SIZE: usize = 1024;
const ECHO_LINGER: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: u32 = 16;

/// Lifecycle of a [`PortProbeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSessionState {
    Created,
    ListenerStarting,
    ListenerReady,
    AcceptingOrShuttingDown,
    Closed,
}

/// Listener task plus its readiness and shutdown signals.
pub struct PortProbeSession {
    port: u16,
    state: ProbeSessionState,
    shutdown: CancellationToken,
    ready_rx: Option<oneshot::Receiver<()>>,
    listener: Option<JoinHandle<()>>,
}

impl PortProbeSession {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: ProbeSessionState::Created,
            shutdown: CancellationToken::new(),
            ready_rx: None,
            listener: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ProbeSessionState {
        self.state
    }

    /// Spawn the listener task on the current runtime.
    pub fn start(&mut self) {
        if self.state != ProbeSessionState::Created {
            debug!("Probe session for port {} was already started.", self.port);
            return;
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.ready_rx = Some(ready_rx);
        self.listener = Some(tokio::spawn(run_listener(
            self.port,
            ready_tx,
            self.shutdown.clone(),
        )));
        self.transition(ProbeSessionState::ListenerStarting);
    }

    /// Wait until the listener accepts connections.
    ///
    /// Returns `false` if the listener failed to bind or did not report
    /// readiness within `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> bool {
        let Some(ready_rx) = self.ready_rx.take() else {
            return false;
        };

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => {
                self.transition(ProbeSessionState::ListenerReady);
                true
            }
            Ok(Err(_)) => {
                error!(
                    "Port listener for port {} stopped before getting ready.",
                    self.port
                );
                false
            }
            Err(_) => {
                error!(
                    "Port listener for port {} did not get ready within {:?}.",
                    self.port, timeout
                );
                false
            }
        }
    }

    /// Raise the shutdown signal and join the listener task.
    ///
    /// Returns `false` if the task did not finish within `join_timeout`; it is
    /// aborted in that case. The session is closed either way.
    pub async fn shutdown(&mut self, join_timeout: Duration) -> bool {
        if self.state == ProbeSessionState::Closed {
            return true;
        }

        self.transition(ProbeSessionState::AcceptingOrShuttingDown);
        self.shutdown.cancel();

        let joined = match self.listener.take() {
            Some(mut handle) => match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("Port listener task for port {} failed: {}", self.port, e);
                    true
                }
                Err(_) => {
                    error!(
                        "Port listener for port {} failed to finish within {:?}.",
                        self.port, join_timeout
                    );
                    handle.abort();
                    false
                }
            },
            None => true,
        };

        self.transition(ProbeSessionState::Closed);
        joined
    }

    fn transition(&mut self, next: ProbeSessionState) {
        trace!(
            "Probe session for port {}: {:?} -> {:?}",
            self.port, self.state, next
        );
        self.state = next;
    }
}

impl Drop for PortProbeSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

/// Listener task: bind, report readiness, echo at most one client, then wait
/// for the shutdown signal and close the socket.
async fn run_listener(port: u16, ready_tx: oneshot::Sender<()>, shutdown: CancellationToken) {
    trace!("(port:{})", port);

    let listener = match bind_listener(port) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on TCP port {}: {}", port, e);
            trace!("(-)[BIND_FAILED]");
            return;
        }
    };

    if ready_tx.send(()).is_err() {
        debug!("Nobody is waiting for the listener on port {} anymore.", port);
        trace!("(-)[ABANDONED]");
        return;
    }

    debug!("Waiting for new client on port {}.", port);
    tokio::select! {
        _ = shutdown.cancelled() => trace!("Shutdown event detected."),
        accepted = listener.accept() => {
            match accepted {
                Ok((stream, peer)) => {
                    debug!("Client {} connected to port {}.", peer, port);
                    tokio::select! {
                        _ = shutdown.cancelled() => trace!("Shutdown event detected during echo."),
                        res = echo_once(stream) => {
                            if let Err(e) = res {
                                error!("Echo to client {} on port {} failed: {}", peer, port, e);
                            }
                        }
                    }
                }
                Err(e) => error!("Accepting client on port {} failed: {}", port, e),
            }
            shutdown.cancelled().await;
        }
    }

    trace!("Stopping listener.");
    drop(listener);
    trace!("(-)");
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[allow(deprecated)]
    socket.set_linger(Some(Duration::ZERO))?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    socket.listen(LISTEN_BACKLOG)
}

/// Read one buffer from the client and send it back.
async fn echo_once(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buffer = [0u8; ECHO_BUFFER_SIZE];
    let count = stream.read(&mut buffer).await?;
    if count == 0 {
        trace!("Connection to client has been terminated.");
        return Ok(());
    }

    trace!(
        "Received {} bytes of data:\n{}",
        count,
        String::from_utf8_lossy(&buffer[..count])
    );
    trace!("Sending the data back to client.");
    stream.write_all(&buffer[..count]).await?;
    stream.flush().await?;
    tokio::time::sleep(ECHO_LINGER).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
        listener.local_addr().expect("local addr").port()
    }

    #[tokio::test]
    async fn session_walks_through_its_states() {
        let mut session = PortProbeSession::new(free_port());
        assert_eq!(session.state(), ProbeSessionState::Created);

        session.start();
        assert_eq!(session.state(), ProbeSessionState::ListenerStarting);

        assert!(session.wait_ready(Duration::from_secs(5)).await);
        assert_eq!(session.state(), ProbeSessionState::ListenerReady);

        assert!(session.shutdown(Duration::from_secs(5)).await);
        assert_eq!(session.state(), ProbeSessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_failure_is_reported_as_not_ready() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
        let port = occupied.local_addr().expect("local addr").port();

        let mut session = PortProbeSession::new(port);
        session.start();
        assert!(!session.wait_ready(Duration::from_secs(5)).await);
        assert!(session.shutdown(Duration::from_secs(5)).await);
        assert_eq!(session.state(), ProbeSessionState::Closed);
    }

    #[tokio::test]
    async fn echoes_first_client_only_once() {
        let port = free_port();
        let mut session = PortProbeSession::new(port);
        session.start();
        assert!(session.wait_ready(Duration::from_secs(5)).await);

        let mut client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to listener");
        client.write_all(b"ping").await.expect("send");
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.expect("echo");
        assert_eq!(&reply, b"ping");

        assert!(session.shutdown(Duration::from_secs(5)).await);
    }
}
