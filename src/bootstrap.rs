//! Connection bootstrap between two parties
//!
//! Every pair `{i, j}` is joined by two TCP streams, one per direction.
//! The stream carrying bytes from `s` to `r` uses port
//! `base_port + s * n + r`; `s` listens on it and `r` connects to it. Both
//! sides compute the same ports and roles from their ids alone, so no
//! rendezvous service is needed.
//!
//! To keep two parties from both sitting in `accept`, the lower id accepts
//! its outgoing stream before dialing its incoming one and the higher id
//! does the reverse.
//!
//! Once a stream is up, the initiator announces its party id and the
//! listener answers with its own. Either side seeing an id other than the
//! one it derived the port for fails with [`Error::RoleCollision`]. Two
//! processes misconfigured so that nobody ever dials (both sitting in
//! `accept`) never reach that exchange; they are only caught when
//! [`NetworkConfig::accept_timeout`] is set.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEndpointInfo, ChannelRole};
use crate::config::{GroupDescriptor, NetworkConfig, PartyId, RetryPolicy};
use crate::error::{Error, Result};

/// Address listeners bind to.
pub const LISTEN_HOST: &str = "0.0.0.0";

/// Attempts between two "still waiting" log lines while dialing.
const RETRY_LOG_INTERVAL: u32 = 50;

/// Which stream of a pair an endpoint describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Local party sends
    Outgoing,
    /// Local party receives
    Incoming,
}

/// Role of `local` for the `direction` stream towards `remote`.
pub fn role_for(local: PartyId, remote: PartyId, direction: Direction) -> ChannelRole {
    if local == remote {
        return ChannelRole::Loopback;
    }
    match direction {
        Direction::Outgoing => ChannelRole::Listener,
        Direction::Incoming => ChannelRole::Initiator,
    }
}

/// Whether `local` performs its listener step before its initiator step.
pub fn listens_first(local: PartyId, remote: PartyId) -> bool {
    local < remote
}

/// Port of the stream carrying bytes from `sender` to `receiver`.
pub fn pair_port(
    base_port: u16,
    size: usize,
    sender: PartyId,
    receiver: PartyId,
) -> Result<u16> {
    if sender >= size || receiver >= size {
        return Err(Error::Misuse(format!(
            "pair ({}, {}) out of range for group of size {}",
            sender, receiver, size
        )));
    }
    sender
        .checked_mul(size)
        .and_then(|offset| offset.checked_add(receiver))
        .and_then(|offset| u16::try_from(offset).ok())
        .and_then(|offset| base_port.checked_add(offset))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "port for pair ({}, {}) overflows from base {}",
                sender, receiver, base_port
            ))
        })
}

/// Endpoint info for `direction` between the local party and `remote`.
pub fn endpoint_info(
    group: &GroupDescriptor,
    base_port: u16,
    remote: PartyId,
    direction: Direction,
) -> Result<ChannelEndpointInfo> {
    let local = group.local_id();
    let hostname = group.address(remote).ok_or_else(|| {
        Error::Misuse(format!(
            "peer {} out of range for group of size {}",
            remote,
            group.size()
        ))
    })?;

    let role = role_for(local, remote, direction);
    if role == ChannelRole::Loopback {
        return Ok(ChannelEndpointInfo::loopback(local));
    }

    let (port, hostname) = match direction {
        Direction::Outgoing => (
            pair_port(base_port, group.size(), local, remote)?,
            LISTEN_HOST.to_string(),
        ),
        Direction::Incoming => (
            pair_port(base_port, group.size(), remote, local)?,
            hostname.to_string(),
        ),
    };

    Ok(ChannelEndpointInfo {
        local_id: local,
        remote_id: remote,
        port: Some(port),
        hostname,
        role,
    })
}

/// Check that the two halves of a socket channel agree with each other.
pub fn validate_pair(outgoing: &ChannelEndpointInfo, incoming: &ChannelEndpointInfo) -> Result<()> {
    if outgoing.local_id != incoming.local_id || outgoing.remote_id != incoming.remote_id {
        return Err(Error::Misuse(format!(
            "channel halves disagree on the pair: {} vs {}",
            outgoing, incoming
        )));
    }
    if outgoing.local_id == outgoing.remote_id {
        return Err(Error::Misuse(format!(
            "party {} must use a loopback channel to reach itself",
            outgoing.local_id
        )));
    }
    if outgoing.role == incoming.role
        || outgoing.role != ChannelRole::Listener
        || incoming.role != ChannelRole::Initiator
    {
        return Err(Error::RoleCollision {
            local: outgoing.local_id,
            remote: outgoing.remote_id,
        });
    }
    if outgoing.port.is_none() || incoming.port.is_none() {
        return Err(Error::Misuse(format!(
            "socket channel to {} without a port",
            outgoing.remote_id
        )));
    }
    Ok(())
}

/// Bring up both streams of a pair. Returns `(outgoing, incoming)`.
pub async fn establish(
    outgoing: &ChannelEndpointInfo,
    incoming: &ChannelEndpointInfo,
    config: &NetworkConfig,
) -> Result<(TcpStream, TcpStream)> {
    validate_pair(outgoing, incoming)?;

    let timeout = config.accept_timeout;
    if listens_first(outgoing.local_id, outgoing.remote_id) {
        let mut out = accept_on(outgoing, timeout).await?;
        answer_hello(&mut out, outgoing, timeout).await?;
        let mut inc = dial(incoming, &config.retry).await?;
        send_hello(&mut inc, incoming, timeout).await?;
        Ok((out, inc))
    } else {
        let mut inc = dial(incoming, &config.retry).await?;
        send_hello(&mut inc, incoming, timeout).await?;
        let mut out = accept_on(outgoing, timeout).await?;
        answer_hello(&mut out, outgoing, timeout).await?;
        Ok((out, inc))
    }
}

/// Initiator side of the id exchange: announce ourselves, then check who
/// answered.
pub async fn send_hello(
    stream: &mut TcpStream,
    info: &ChannelEndpointInfo,
    timeout: Option<Duration>,
) -> Result<()> {
    let port = endpoint_port(info)?;
    let own = wire_id(info.local_id)?;
    let fail = |reason: String| connection_error(info, port, reason);

    with_timeout(timeout, async {
        write_id(stream, own)
            .await
            .map_err(|e| fail(format!("hello: {e}")))?;
        let announced = read_id(stream)
            .await
            .map_err(|e| fail(format!("hello reply: {e}")))?;
        check_announced(info, announced)
    })
    .await
    .unwrap_or_else(|| Err(fail("no hello reply in time".into())))
}

/// Listener side of the id exchange: check who connected, then answer.
pub async fn answer_hello(
    stream: &mut TcpStream,
    info: &ChannelEndpointInfo,
    timeout: Option<Duration>,
) -> Result<()> {
    let port = endpoint_port(info)?;
    let own = wire_id(info.local_id)?;
    let fail = |reason: String| connection_error(info, port, reason);

    with_timeout(timeout, async {
        let announced = read_id(stream)
            .await
            .map_err(|e| fail(format!("hello: {e}")))?;
        check_announced(info, announced)?;
        write_id(stream, own)
            .await
            .map_err(|e| fail(format!("hello reply: {e}")))
    })
    .await
    .unwrap_or_else(|| Err(fail("no hello in time".into())))
}

/// `None` when the deadline passed first.
async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn wire_id(id: PartyId) -> Result<u32> {
    u32::try_from(id).map_err(|_| Error::Configuration(format!("party id {} too large", id)))
}

/// Party id as 4 big-endian bytes.
async fn write_id(stream: &mut TcpStream, id: u32) -> io::Result<()> {
    stream.write_all(&id.to_be_bytes()).await?;
    stream.flush().await
}

async fn read_id(stream: &mut TcpStream) -> io::Result<u32> {
    let mut id_bytes = [0u8; 4];
    stream.read_exact(&mut id_bytes).await?;
    Ok(u32::from_be_bytes(id_bytes))
}

fn check_announced(info: &ChannelEndpointInfo, announced: u32) -> Result<()> {
    if usize::try_from(announced).ok() == Some(info.remote_id) {
        return Ok(());
    }
    warn!(
        "{} reached party {} instead of {}",
        info, announced, info.remote_id
    );
    Err(Error::RoleCollision {
        local: info.local_id,
        remote: info.remote_id,
    })
}

/// Bind the endpoint's port and wait for the remote initiator.
pub async fn accept_on(
    info: &ChannelEndpointInfo,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let port = endpoint_port(info)?;
    let fail = |reason: String| connection_error(info, port, reason);

    let socket = TcpSocket::new_v4().map_err(|e| fail(format!("socket: {e}")))?;
    socket
        .set_reuseaddr(true)
        .map_err(|e| fail(format!("setsockopt: {e}")))?;
    socket
        .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .map_err(|e| fail(format!("bind: {e}")))?;
    let listener = socket.listen(1).map_err(|e| fail(format!("listen: {e}")))?;

    debug!("{} waiting for peer", info);
    let accepted = match timeout {
        Some(limit) => tokio::time::timeout(limit, listener.accept())
            .await
            .map_err(|_| fail(format!("no connection within {:?}", limit)))?,
        None => listener.accept().await,
    };
    let (stream, addr) = accepted.map_err(|e| fail(format!("accept: {e}")))?;

    stream
        .set_nodelay(true)
        .map_err(|e| fail(format!("set_nodelay: {e}")))?;
    debug!("{} accepted connection from {}", info, addr);
    Ok(stream)
}

/// Connect to the remote listener, retrying while it is not up yet.
pub async fn dial(info: &ChannelEndpointInfo, retry: &RetryPolicy) -> Result<TcpStream> {
    let port = endpoint_port(info)?;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match TcpStream::connect((info.hostname.as_str(), port)).await {
            Ok(stream) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| connection_error(info, port, format!("set_nodelay: {e}")))?;
                debug!("{} connected in {} attempts", info, attempts);
                return Ok(stream);
            }
            Err(e) if is_transient(&e) => {
                if retry.exhausted(attempts) {
                    return Err(connection_error(
                        info,
                        port,
                        format!("gave up after {} attempts: {}", attempts, e),
                    ));
                }
                if attempts % RETRY_LOG_INTERVAL == 0 {
                    info!("{} still waiting for peer ({} attempts)", info, attempts);
                }
                tokio::time::sleep(retry.backoff).await;
            }
            Err(e) => return Err(connection_error(info, port, format!("connect: {e}"))),
        }
    }
}

/// Errors that show up while the remote has not reached `listen` yet.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

fn endpoint_port(info: &ChannelEndpointInfo) -> Result<u16> {
    info.port
        .ok_or_else(|| Error::Misuse(format!("{} has no port to connect on", info)))
}

fn connection_error(info: &ChannelEndpointInfo, port: u16, reason: String) -> Error {
    Error::Connection {
        local: info.local_id,
        remote: info.remote_id,
        port,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_roles_are_complementary() {
        for i in 0..5 {
            for j in 0..5 {
                if i == j {
                    assert_eq!(role_for(i, j, Direction::Outgoing), ChannelRole::Loopback);
                    continue;
                }
                // i's outgoing stream is j's incoming stream
                let mine = role_for(i, j, Direction::Outgoing);
                let theirs = role_for(j, i, Direction::Incoming);
                assert_ne!(mine, theirs);
                assert_ne!(listens_first(i, j), listens_first(j, i));
            }
        }
    }

    #[test]
    fn test_pair_port_is_injective() {
        let n = 7;
        let mut seen = HashSet::new();
        for s in 0..n {
            for r in 0..n {
                assert!(seen.insert(pair_port(5000, n, s, r).unwrap()));
            }
        }
        assert_eq!(pair_port(5000, 3, 0, 1).unwrap(), 5001);
        assert_eq!(pair_port(5000, 3, 2, 1).unwrap(), 5007);
    }

    #[test]
    fn test_pair_port_bounds() {
        assert!(matches!(pair_port(5000, 3, 3, 0), Err(Error::Misuse(_))));
        assert!(matches!(
            pair_port(65530, 3, 2, 2),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_endpoint_info_matches_remote_view() {
        let zero = GroupDescriptor::new(0, vec!["10.0.0.1".into(), "10.0.0.2".into()]).unwrap();
        let one = GroupDescriptor::new(1, vec!["10.0.0.1".into(), "10.0.0.2".into()]).unwrap();

        let out0 = endpoint_info(&zero, 5000, 1, Direction::Outgoing).unwrap();
        let in1 = endpoint_info(&one, 5000, 0, Direction::Incoming).unwrap();
        assert_eq!(out0.port, in1.port);
        assert_eq!(out0.role, ChannelRole::Listener);
        assert_eq!(out0.hostname, LISTEN_HOST);
        assert_eq!(in1.role, ChannelRole::Initiator);
        assert_eq!(in1.hostname, "10.0.0.1");

        let own = endpoint_info(&zero, 5000, 0, Direction::Incoming).unwrap();
        assert_eq!(own, ChannelEndpointInfo::loopback(0));

        assert!(endpoint_info(&zero, 5000, 2, Direction::Outgoing).is_err());
    }

    #[test]
    fn test_validate_pair_detects_collision() {
        let group = GroupDescriptor::localhost(0, 2).unwrap();
        let out = endpoint_info(&group, 5000, 1, Direction::Outgoing).unwrap();
        let inc = endpoint_info(&group, 5000, 1, Direction::Incoming).unwrap();
        assert!(validate_pair(&out, &inc).is_ok());

        assert!(matches!(
            validate_pair(&out, &out),
            Err(Error::RoleCollision { local: 0, remote: 1 })
        ));
        assert!(matches!(
            validate_pair(&inc, &out),
            Err(Error::RoleCollision { .. })
        ));

        let self_info = ChannelEndpointInfo::loopback(0);
        assert!(validate_pair(&self_info, &self_info).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dial_gives_up() {
        // nobody listens on this port
        let info = ChannelEndpointInfo {
            local_id: 1,
            remote_id: 0,
            port: Some(24999),
            hostname: "127.0.0.1".into(),
            role: ChannelRole::Initiator,
        };
        let retry = RetryPolicy {
            backoff: Duration::from_millis(5),
            max_attempts: Some(3),
        };
        match dial(&info, &retry).await {
            Err(Error::Connection { port, remote, .. }) => {
                assert_eq!(port, 24999);
                assert_eq!(remote, 0);
            }
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_accept_times_out() {
        let info = ChannelEndpointInfo {
            local_id: 0,
            remote_id: 1,
            port: Some(24998),
            hostname: LISTEN_HOST.into(),
            role: ChannelRole::Listener,
        };
        let res = accept_on(&info, Some(Duration::from_millis(50))).await;
        assert!(matches!(res, Err(Error::Connection { port: 24998, .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_establish_pair() {
        let config = NetworkConfig::default()
            .with_base_port(24900)
            .with_retry(RetryPolicy {
                backoff: Duration::from_millis(10),
                max_attempts: Some(500),
            });
        let zero = GroupDescriptor::localhost(0, 2).unwrap();
        let one = GroupDescriptor::localhost(1, 2).unwrap();

        let side = |group: GroupDescriptor, remote: PartyId| {
            let config = config.clone();
            async move {
                let out = endpoint_info(&group, config.base_port, remote, Direction::Outgoing)?;
                let inc = endpoint_info(&group, config.base_port, remote, Direction::Incoming)?;
                establish(&out, &inc, &config).await
            }
        };

        let (a, b) = tokio::join!(side(zero, 1), side(one, 0));
        let (a_out, a_in) = a.unwrap();
        let (b_out, b_in) = b.unwrap();

        assert!(a_out.nodelay().unwrap());
        assert!(a_in.nodelay().unwrap());
        assert_eq!(a_out.local_addr().unwrap().port(), 24901);
        assert_eq!(b_in.peer_addr().unwrap().port(), 24901);
        assert_eq!(b_out.local_addr().unwrap().port(), 24902);
        assert_eq!(a_in.peer_addr().unwrap().port(), 24902);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_peer_is_role_collision() {
        // party 0 expects party 1 on this port, but party 2 dials it
        let listener = ChannelEndpointInfo {
            local_id: 0,
            remote_id: 1,
            port: Some(24910),
            hostname: LISTEN_HOST.into(),
            role: ChannelRole::Listener,
        };
        let stranger = ChannelEndpointInfo {
            local_id: 2,
            remote_id: 0,
            port: Some(24910),
            hostname: "127.0.0.1".into(),
            role: ChannelRole::Initiator,
        };
        let retry = RetryPolicy {
            backoff: Duration::from_millis(10),
            max_attempts: Some(500),
        };
        let timeout = Some(Duration::from_secs(5));

        let (accepted, dialed) = tokio::join!(
            async {
                let mut stream = accept_on(&listener, timeout).await?;
                answer_hello(&mut stream, &listener, timeout).await
            },
            async {
                let mut stream = dial(&stranger, &retry).await?;
                send_hello(&mut stream, &stranger, timeout).await
            }
        );

        assert!(matches!(
            accepted,
            Err(Error::RoleCollision { local: 0, remote: 1 })
        ));
        // the listener hung up without answering
        let dialed = dialed.unwrap_err();
        assert!(dialed.is_fatal_setup());
        assert_eq!(dialed.peer(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_initiator_times_out() {
        let listener = ChannelEndpointInfo {
            local_id: 0,
            remote_id: 1,
            port: Some(24911),
            hostname: LISTEN_HOST.into(),
            role: ChannelRole::Listener,
        };
        let timeout = Some(Duration::from_millis(100));

        let (accepted, raw) = tokio::join!(
            async {
                let mut stream = accept_on(&listener, Some(Duration::from_secs(5))).await?;
                answer_hello(&mut stream, &listener, timeout).await
            },
            async {
                // connects but never says who it is
                let mut attempts = 0;
                loop {
                    match TcpStream::connect(("127.0.0.1", 24911)).await {
                        Ok(stream) => break stream,
                        Err(_) if attempts < 500 => {
                            attempts += 1;
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        Err(e) => panic!("could not connect: {}", e),
                    }
                }
            }
        );
        drop(raw);

        assert!(matches!(
            accepted,
            Err(Error::Connection { port: 24911, .. })
        ));
    }
}
