//! End-to-end relay over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use marksync_core::config::ServerConfig;
use marksync_core::{KindClasses, ProjectName, UserName};
use marksync_server::{ProtocolRegistry, Server};
use marksync_store::Store;

const WAIT: Duration = Duration::from_secs(5);

struct TcpClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TcpClient {
    async fn connect(addr: SocketAddr, user: &str, password: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        client.send(&format!("bootrom:::{user}:::{password}")).await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write");
    }

    async fn recv(&mut self) -> Option<String> {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out")
            .expect("read")
    }
}

async fn start() -> (SocketAddr, marksync_server::ServerHandle, tokio::task::JoinHandle<()>) {
    let store = Store::in_memory(KindClasses::default()).await.expect("store");
    store
        .create_project(&ProjectName::from("bootrom"))
        .await
        .expect("project");
    store
        .add_user(&UserName::from("alice"), "pw-a", Some("Alice"))
        .await
        .expect("alice");
    store
        .add_user(&UserName::from("bob"), "pw-b", None)
        .await
        .expect("bob");

    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::bind(
        &config,
        store.clone(),
        Arc::new(store),
        &ProtocolRegistry::default(),
    )
    .await
    .expect("bind");
    let addr = server.local_addr();
    let handle = server.handle();
    let serving = tokio::spawn(async move {
        server.serve().await.expect("serve");
    });
    (addr, handle, serving)
}

#[tokio::test]
async fn two_clients_exchange_changes_and_stop_cleanly() {
    let (addr, handle, serving) = start().await;

    let mut alice = TcpClient::connect(addr, "alice", "pw-a").await;
    assert_eq!(alice.recv().await.as_deref(), Some("ready:::bootrom:::0"));
    let mut bob = TcpClient::connect(addr, "bob", "pw-b").await;
    assert_eq!(bob.recv().await.as_deref(), Some("ready:::bootrom:::0"));

    alice.send("0:::1:::401000:::start*_start").await;
    assert_eq!(
        bob.recv().await.as_deref(),
        Some("1:::1:::00401000:::start*_start")
    );

    let status = handle.status();
    assert_eq!(status.sessions, 2);
    assert_eq!(status.projects.len(), 1);
    assert_eq!(status.projects[0].project, "bootrom");
    assert_eq!(status.relay.published, 1);

    handle.shutdown();
    for client in [&mut alice, &mut bob] {
        let line = client.recv().await.expect("error frame");
        assert!(line.starts_with("error:::protocol:::"), "got: {line}");
        assert_eq!(client.recv().await, None);
    }
    timeout(WAIT, serving)
        .await
        .expect("serve did not return")
        .expect("serve task");
    assert_eq!(handle.status().sessions, 0);
}

#[tokio::test]
async fn late_joiner_catches_up_over_tcp() {
    let (addr, handle, serving) = start().await;

    let mut alice = TcpClient::connect(addr, "alice", "pw-a").await;
    assert_eq!(alice.recv().await.as_deref(), Some("ready:::bootrom:::0"));
    alice.send("0:::1:::10:::a*b").await;
    alice.send("0:::3:::10:::first").await;
    alice.send("0:::4:::10:::second").await;

    // Wait until all three are stored.
    timeout(WAIT, async {
        while handle.status().relay.published < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("appends");

    let mut bob = TcpClient::connect(addr, "bob", "pw-b").await;
    assert_eq!(bob.recv().await.as_deref(), Some("ready:::bootrom:::2"));
    assert_eq!(bob.recv().await.as_deref(), Some("1:::1:::00000010:::a*b"));
    bob.writer.write_all(b"k").await.unwrap();
    assert_eq!(bob.recv().await.as_deref(), Some("3:::4:::00000010:::second"));
    bob.writer.write_all(b"k").await.unwrap();

    handle.shutdown();
    timeout(WAIT, serving).await.expect("serve").expect("task");
}
