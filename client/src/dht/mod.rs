//! Minimal mainline DHT client (BEP 5): enough to bootstrap a node list and
//! ask the closest nodes for peers of one info hash.

use omni_core::bencoding::{Bencode, decode, dict};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use tokio::net::UdpSocket;

pub const DEFAULT_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

const MAX_NODES: usize = 512;
const QUERY_FANOUT: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: [u8; 20],
    pub addr: SocketAddr,
}

#[derive(Default)]
struct Routing {
    nodes: Vec<Node>,
    peers: Vec<SocketAddrV4>,
}

pub struct Dht {
    socket: UdpSocket,
    node_id: [u8; 20],
    routing: Mutex<Routing>,
}

impl Dht {
    /// Binds the DHT socket; port 0 picks an ephemeral one.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(Self {
            socket,
            node_id: rand::random(),
            routing: Mutex::new(Routing::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Runs until the owning task is dropped.
    pub async fn listen(&self) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("DHT receive error: {e}");
                    continue;
                }
            };
            let Ok(msg) = decode(&buf[..len], &mut 0) else {
                continue;
            };
            if let Some(reply) = self.handle_message(&msg) {
                let _ = self.socket.send_to(&reply, src).await;
            }
        }
    }

    /// Folds a message into the routing state; returns a reply for queries
    /// we answer (only `ping`).
    fn handle_message(&self, msg: &Bencode) -> Option<Vec<u8>> {
        let t = msg.get(b"t")?.as_bytes()?;
        match msg.get(b"y")?.as_bytes()? {
            b"r" => {
                let r = msg.get(b"r")?;
                let mut routing = self.routing.lock().ok()?;
                if let Some(nodes) = r.get(b"nodes").and_then(Bencode::as_bytes) {
                    for node in parse_nodes(nodes) {
                        if routing.nodes.len() < MAX_NODES
                            && !routing.nodes.iter().any(|n| n.addr == node.addr)
                        {
                            routing.nodes.push(node);
                        }
                    }
                }
                if let Some(values) = r.get(b"values").and_then(Bencode::as_list) {
                    for peer in parse_values(values) {
                        if !routing.peers.contains(&peer) {
                            routing.peers.push(peer);
                        }
                    }
                }
                None
            }
            b"q" if msg.get(b"q")?.as_bytes()? == b"ping" => Some(
                dict([
                    ("t", Bencode::Bytes(t.to_vec())),
                    ("y", Bencode::Bytes(b"r".to_vec())),
                    ("r", dict([("id", Bencode::Bytes(self.node_id.to_vec()))])),
                ])
                .encode(),
            ),
            _ => None,
        }
    }

    /// Asks the given routers for nodes near our own id.
    pub async fn bootstrap(&self, routers: &[String]) {
        for router in routers {
            match tokio::net::lookup_host(router.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs.filter(SocketAddr::is_ipv4) {
                        let msg = self.query("find_node", ("target", self.node_id));
                        let _ = self.socket.send_to(&msg, addr).await;
                    }
                }
                Err(e) => tracing::debug!(router = %router, "DHT router lookup failed: {e}"),
            }
        }
    }

    /// Sends `get_peers` to the known nodes closest to `info_hash`. Answers
    /// arrive through [`Dht::listen`].
    pub async fn get_peers(&self, info_hash: [u8; 20]) {
        let msg = self.query("get_peers", ("info_hash", info_hash));
        for node in self.closest(&info_hash, QUERY_FANOUT) {
            let _ = self.socket.send_to(&msg, node.addr).await;
        }
    }

    /// Drains peers collected since the last call.
    pub fn take_found_peers(&self) -> Vec<SocketAddrV4> {
        self.routing
            .lock()
            .map(|mut r| std::mem::take(&mut r.peers))
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.routing.lock().map(|r| r.nodes.len()).unwrap_or(0)
    }

    fn closest(&self, target: &[u8; 20], n: usize) -> Vec<Node> {
        let Ok(routing) = self.routing.lock() else {
            return Vec::new();
        };
        let mut nodes = routing.nodes.clone();
        nodes.sort_by_key(|node| xor_distance(&node.id, target));
        nodes.truncate(n);
        nodes
    }

    fn query(&self, kind: &str, (key, value): (&str, [u8; 20])) -> Vec<u8> {
        let t: [u8; 2] = rand::random();
        dict([
            ("t", Bencode::Bytes(t.to_vec())),
            ("y", Bencode::Bytes(b"q".to_vec())),
            ("q", Bencode::Bytes(kind.as_bytes().to_vec())),
            (
                "a",
                dict([
                    ("id", Bencode::Bytes(self.node_id.to_vec())),
                    (key, Bencode::Bytes(value.to_vec())),
                ]),
            ),
        ])
        .encode()
    }
}

fn xor_distance(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

/// Compact node info: 20-byte id + 4-byte IPv4 + 2-byte port.
pub fn parse_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(26)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[0..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Node {
                id,
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
            }
        })
        .collect()
}

fn parse_values(values: &[Bencode]) -> Vec<SocketAddrV4> {
    values
        .iter()
        .filter_map(Bencode::as_bytes)
        .filter(|b| b.len() == 6)
        .flat_map(tracker::parse_compact_peers)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact_node(id: u8, port: u16) -> Vec<u8> {
        let mut out = vec![id; 20];
        out.extend_from_slice(&[127, 0, 0, 1]);
        out.extend_from_slice(&port.to_be_bytes());
        out
    }

    #[test]
    fn test_parse_nodes() {
        let mut data = compact_node(1, 6881);
        data.extend(compact_node(2, 6882));
        data.push(0xff);
        let nodes = parse_nodes(&data);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].id, [2; 20]);
        assert_eq!(nodes[1].addr, "127.0.0.1:6882".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_xor_distance_orders_closest_first() {
        let target = [0u8; 20];
        let mut near = [0u8; 20];
        near[19] = 1;
        let far = [0x80u8; 20];
        assert!(xor_distance(&near, &target) < xor_distance(&far, &target));
    }

    #[tokio::test]
    async fn test_get_peers_collects_values_from_node() {
        let dht = Dht::bind(0).await.unwrap();
        let dht_port = dht.local_addr().unwrap().port();
        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node_port = node.local_addr().unwrap().port();

        // Seed the routing table as if a find_node answer had arrived.
        let seeded = dict([
            ("t", Bencode::Bytes(b"aa".to_vec())),
            ("y", Bencode::Bytes(b"r".to_vec())),
            ("r", dict([("nodes", Bencode::Bytes(compact_node(9, node_port)))])),
        ]);
        dht.handle_message(&seeded);
        assert_eq!(dht.node_count(), 1);

        let fake_node = async {
            let mut buf = [0u8; 1500];
            let (len, src) = node.recv_from(&mut buf).await.unwrap();
            let query = decode(&buf[..len], &mut 0).unwrap();
            assert_eq!(query.get(b"q").and_then(Bencode::as_bytes), Some(&b"get_peers"[..]));
            assert_eq!(src.port(), dht_port);
            let reply = dict([
                ("t", Bencode::Bytes(query.get(b"t").unwrap().as_bytes().unwrap().to_vec())),
                ("y", Bencode::Bytes(b"r".to_vec())),
                (
                    "r",
                    dict([(
                        "values",
                        Bencode::List(vec![Bencode::Bytes(vec![10, 0, 0, 7, 0x1a, 0xe1])]),
                    )]),
                ),
            ]);
            node.send_to(&reply.encode(), src).await.unwrap();
        };

        let lookup = async {
            dht.get_peers([3; 20]).await;
            loop {
                let found = dht.take_found_peers();
                if !found.is_empty() {
                    return found;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        };

        let found = tokio::select! {
            _ = dht.listen() => unreachable!(),
            (found, ()) = async { tokio::join!(lookup, fake_node) } => found,
        };
        assert_eq!(found, vec!["10.0.0.7:6881".parse::<SocketAddrV4>().unwrap()]);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let dht = Dht::bind(0).await.unwrap();
        let ping = dict([
            ("t", Bencode::Bytes(b"xy".to_vec())),
            ("y", Bencode::Bytes(b"q".to_vec())),
            ("q", Bencode::Bytes(b"ping".to_vec())),
        ]);
        let reply = dht.handle_message(&ping).unwrap();
        let reply = decode(&reply, &mut 0).unwrap();
        assert_eq!(reply.get(b"t").and_then(Bencode::as_bytes), Some(&b"xy"[..]));
    }
}
