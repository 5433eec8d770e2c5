use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use iop_installer::port_check::{CheckerOptions, PortReachabilityChecker};
use iop_installer::seed::{PortVerdict, SeedNodeClient};
use iop_installer::task::AsyncTask;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Connect to `ip:port`, send a greeting and expect it echoed back.
async fn echo_probe(ip: IpAddr, port: u16) -> bool {
    let Ok(Ok(mut stream)) =
        tokio::time::timeout(Duration::from_secs(5), TcpStream::connect((ip, port))).await
    else {
        return false;
    };
    if stream.write_all(b"hello").await.is_err() {
        return false;
    }
    let mut reply = [0u8; 5];
    matches!(
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply)).await,
        Ok(Ok(_))
    ) && &reply == b"hello"
}

#[tokio::test]
async fn reachable_port_is_open_and_released_afterwards() {
    let port = free_port();
    let checker = PortReachabilityChecker::new(
        |ip: IpAddr, port: u16| AsyncTask::from_future(echo_probe(ip, port)),
        LOCALHOST,
    );

    assert!(checker.check_port_open(port).await);

    // The listener is gone once the check returns.
    std::net::TcpListener::bind(("0.0.0.0", port)).expect("port is free again");
}

#[tokio::test]
async fn failing_probe_reports_closed_within_bounds() {
    let port = free_port();
    let checker =
        PortReachabilityChecker::new(|_: IpAddr, _: u16| AsyncTask::ready(false), LOCALHOST);

    let started = Instant::now();
    assert!(!checker.check_port_open(port).await);
    let options = CheckerOptions::default();
    assert!(started.elapsed() < options.ready_timeout + options.join_timeout);
}

#[tokio::test]
async fn occupied_port_is_reported_closed_without_probing() {
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
    let port = occupied.local_addr().expect("local addr").port();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let checker = PortReachabilityChecker::new(
        move |_: IpAddr, _: u16| {
            counter.fetch_add(1, Ordering::SeqCst);
            AsyncTask::ready(true)
        },
        LOCALHOST,
    );

    // Windows lets SO_REUSEADDR sockets share the port.
    if cfg!(unix) {
        assert!(!checker.check_port_open(port).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn repeated_checks_do_not_share_state() {
    let port = free_port();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let checker = PortReachabilityChecker::new(
        move |_: IpAddr, _: u16| AsyncTask::ready(counter.fetch_add(1, Ordering::SeqCst) % 2 == 1),
        LOCALHOST,
    );

    for expected in [false, true, false, true] {
        assert_eq!(checker.check_port_open(port).await, expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn overlapping_checks_on_different_ports() {
    let checker = PortReachabilityChecker::new(
        |ip: IpAddr, port: u16| AsyncTask::from_future(echo_probe(ip, port)),
        LOCALHOST,
    );
    let (first, second) = (free_port(), free_port());

    let (a, b) = tokio::join!(checker.check_port_open(first), checker.check_port_open(second));
    assert!(a);
    assert!(b);
}

#[tokio::test]
async fn probe_that_does_not_talk_still_decides() {
    let port = free_port();
    // Connects and hangs up without sending anything.
    let checker = PortReachabilityChecker::new(
        |ip: IpAddr, port: u16| {
            AsyncTask::from_future(async move { TcpStream::connect((ip, port)).await.is_ok() })
        },
        LOCALHOST,
    );
    assert!(checker.check_port_open(port).await);
}

/// Minimal seed node: `/getip` answers 127.0.0.1, `/portcheck` connects to
/// the requested endpoint and answers `OK` if the greeting came back.
/// With `broken` set every answer is garbage.
async fn spawn_seed_node(broken: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind seed node");
    let addr = listener.local_addr().expect("seed node addr");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/");
                let url = Url::parse(&format!("http://seed{path}")).expect("request url");

                let body = if broken {
                    "<html>maintenance</html>".to_string()
                } else if url.path() == "/getip" {
                    "127.0.0.1".to_string()
                } else {
                    let query = |key: &str| {
                        url.query_pairs()
                            .find(|(k, _)| k == key)
                            .map(|(_, v)| v.into_owned())
                            .unwrap_or_default()
                    };
                    let ip: IpAddr = query("ip").parse().expect("ip parameter");
                    let port: u16 = query("port").parse().expect("port parameter");
                    let reachable = echo_probe(ip, port).await;
                    (if reachable { "OK" } else { "FAILED" }).to_string()
                };

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn seed_node_decides_reachability() {
    let seed_addr = spawn_seed_node(false).await;
    let seed = SeedNodeClient::new(&[format!("http://{seed_addr}")], Duration::from_secs(10))
        .expect("seed client");

    let ip = seed.external_ip().await.expect("external ip");
    assert_eq!(ip, LOCALHOST);

    let port = free_port();
    let checker = PortReachabilityChecker::new(seed.clone(), ip);
    assert!(checker.check_port_open(port).await);

    // Nobody listens there without a check in progress.
    assert_eq!(seed.port_verdict(ip, free_port()).await, PortVerdict::Closed);
}

#[tokio::test]
async fn unusable_seed_answers_leave_verdict_undetermined() {
    let broken = spawn_seed_node(true).await;
    let seed = SeedNodeClient::new(&[format!("http://{broken}")], Duration::from_secs(10))
        .expect("seed client");

    assert_eq!(seed.external_ip().await, None);
    assert_eq!(
        seed.port_verdict(LOCALHOST, free_port()).await,
        PortVerdict::Undetermined
    );

    let checker = PortReachabilityChecker::new(seed, LOCALHOST);
    assert!(!checker.check_port_open(free_port()).await);
}
