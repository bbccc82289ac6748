//! Test-only helpers: scripted loopback resolvers for exercising the
//! detection and routing paths without real upstreams.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use crate::dns::packet;
use crate::dns::types::RecordType;

/// What a scripted resolver answers for a given hostname.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// NOERROR with an empty answer section
    Empty,
    /// Single A record for the queried name
    A(Ipv4Addr),
    /// CNAME pointing at the given target, no address record
    Cname(String),
    /// CNAME plus an A record for the target (the common real-world shape)
    CnameWithA(String, Ipv4Addr),
    /// Swallow the query so the client times out
    Drop,
    /// Empty answer with the TC bit set, forcing a TCP retry
    Truncated,
}

pub struct MockDns {
    pub addr: SocketAddr,
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl MockDns {
    /// Scripted UDP resolver on an ephemeral loopback port.
    pub async fn spawn(rules: HashMap<String, MockReply>) -> MockDns {
        Self::spawn_full(rules, None).await
    }

    /// Scripted resolver that also answers over TCP on the same port,
    /// using `tcp_rules` for the TCP side.
    pub async fn spawn_full(
        rules: HashMap<String, MockReply>,
        tcp_rules: Option<HashMap<String, MockReply>>,
    ) -> MockDns {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let counts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));

        if let Some(tcp_rules) = tcp_rules {
            let listener = TcpListener::bind(addr).await.unwrap();
            let tcp_counts = counts.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        break;
                    };
                    let rules = tcp_rules.clone();
                    let counts = tcp_counts.clone();
                    tokio::spawn(async move {
                        loop {
                            let mut len_buf = [0u8; 2];
                            if stream.read_exact(&mut len_buf).await.is_err() {
                                break;
                            }
                            let msg_len = u16::from_be_bytes(len_buf) as usize;
                            let mut query = vec![0u8; msg_len];
                            if stream.read_exact(&mut query).await.is_err() {
                                break;
                            }
                            let Some(response) = answer_query(&query, &rules, &counts) else {
                                continue;
                            };
                            let resp_len = (response.len() as u16).to_be_bytes();
                            if stream.write_all(&resp_len).await.is_err() {
                                break;
                            }
                            if stream.write_all(&response).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });
        }

        let udp_counts = counts.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let query = buf[..len].to_vec();
                if let Some(response) = answer_query(&query, &rules, &udp_counts) {
                    let _ = socket.send_to(&response, peer).await;
                }
            }
        });

        MockDns { addr, counts }
    }

    /// Scripted DNS-over-TLS resolver using the self-signed testdata cert.
    pub async fn spawn_tls(rules: HashMap<String, MockReply>) -> MockDns {
        let certs: Vec<_> = rustls_pemfile::certs(&mut &include_bytes!("../testdata/cert.pem")[..])
            .collect::<Result<_, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut &include_bytes!("../testdata/key.pem")[..])
            .unwrap()
            .unwrap();
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));

        let tls_counts = counts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let rules = rules.clone();
                let counts = tls_counts.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    loop {
                        let mut len_buf = [0u8; 2];
                        if tls.read_exact(&mut len_buf).await.is_err() {
                            break;
                        }
                        let msg_len = u16::from_be_bytes(len_buf) as usize;
                        let mut query = vec![0u8; msg_len];
                        if tls.read_exact(&mut query).await.is_err() {
                            break;
                        }
                        let Some(response) = answer_query(&query, &rules, &counts) else {
                            continue;
                        };
                        let resp_len = (response.len() as u16).to_be_bytes();
                        if tls.write_all(&resp_len).await.is_err() {
                            break;
                        }
                        if tls.write_all(&response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        MockDns { addr, counts }
    }

    /// How many queries this resolver saw for `name`.
    pub fn query_count(&self, name: &str) -> u64 {
        *self.counts.lock().get(name).unwrap_or(&0)
    }

    pub fn total_queries(&self) -> u64 {
        self.counts.lock().values().sum()
    }
}

fn answer_query(
    query: &[u8],
    rules: &HashMap<String, MockReply>,
    counts: &Arc<Mutex<HashMap<String, u64>>>,
) -> Option<Vec<u8>> {
    let (qname, _) = packet::extract_query_info(query).ok()?;
    *counts.lock().entry(qname.clone()).or_insert(0) += 1;

    let rule = rules.get(&qname).cloned().unwrap_or(MockReply::Empty);
    if matches!(rule, MockReply::Drop) {
        return None;
    }
    Some(build_reply(query, &qname, &rule))
}

fn build_reply(query: &[u8], qname: &str, reply: &MockReply) -> Vec<u8> {
    let mut flags: u16 = 0x8180; // QR|RD|RA
    let answers: Vec<(String, RecordType, Vec<u8>)> = match reply {
        MockReply::Empty => vec![],
        MockReply::A(ip) => vec![(qname.to_string(), RecordType::A, ip.octets().to_vec())],
        MockReply::Cname(target) => vec![(
            qname.to_string(),
            RecordType::CNAME,
            packet::encode_name(target),
        )],
        MockReply::CnameWithA(target, ip) => vec![
            (
                qname.to_string(),
                RecordType::CNAME,
                packet::encode_name(target),
            ),
            (target.clone(), RecordType::A, ip.octets().to_vec()),
        ],
        MockReply::Truncated => {
            flags |= 0x0200; // TC
            vec![]
        }
        MockReply::Drop => unreachable!("Drop is handled before reply building"),
    };

    let (qtype, qclass) = {
        let parsed = packet::parse_packet(query).unwrap();
        let q = &parsed.questions[0];
        (q.qtype.to_u16(), q.qclass.to_u16())
    };

    let mut response = Vec::with_capacity(512);
    response.extend_from_slice(&query[0..2]); // transaction ID
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());

    // Echo the question
    response.extend_from_slice(&packet::encode_name(qname));
    response.extend_from_slice(&qtype.to_be_bytes());
    response.extend_from_slice(&qclass.to_be_bytes());

    for (name, rtype, rdata) in answers {
        response.extend_from_slice(&packet::encode_name(&name));
        response.extend_from_slice(&rtype.to_u16().to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // IN
        response.extend_from_slice(&60u32.to_be_bytes());
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(&rdata);
    }

    response
}

/// Rule-map construction shorthand for tests.
pub fn rules(pairs: &[(&str, MockReply)]) -> HashMap<String, MockReply> {
    pairs
        .iter()
        .map(|(name, reply)| (name.to_string(), reply.clone()))
        .collect()
}
