//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

/// Address carried by answers that must never be accepted.
pub const DECOY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 66));

/// How a [`FakeBootstrapServer`] answers.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Answer with this address for the matching record type, empty otherwise.
    Answer(IpAddr),
    /// Answer with this response code and no records.
    Rcode(ResponseCode),
    /// Send a reply with the wrong ID first, then the real answer.
    StrayThenAnswer(IpAddr),
    /// Send an undecodable datagram first, then the real answer.
    JunkThenAnswer(IpAddr),
    /// Answer a different question under the same ID first, then the real answer.
    OtherQuestionThenAnswer(IpAddr),
    /// Never reply.
    Silent,
}

/// Plain-DNS server on a local UDP socket, standing in for a bootstrap server.
pub struct FakeBootstrapServer {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl FakeBootstrapServer {
    pub async fn start(behavior: Behavior) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let query = Message::from_bytes(&buf[..len]).unwrap();

                match behavior {
                    Behavior::Silent => {}
                    Behavior::Rcode(code) => {
                        let reply = answer(&query, code, None);
                        socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
                    }
                    Behavior::Answer(ip) => {
                        let reply = answer(&query, ResponseCode::NoError, Some(ip));
                        socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
                    }
                    Behavior::StrayThenAnswer(ip) => {
                        let mut stray = answer(&query, ResponseCode::NoError, Some(ip));
                        stray.set_id(query.id().wrapping_add(1));
                        socket.send_to(&stray.to_vec().unwrap(), peer).await.unwrap();
                        let reply = answer(&query, ResponseCode::NoError, Some(ip));
                        socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
                    }
                    Behavior::JunkThenAnswer(ip) => {
                        socket.send_to(&[0xde, 0xad], peer).await.unwrap();
                        let reply = answer(&query, ResponseCode::NoError, Some(ip));
                        socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
                    }
                    Behavior::OtherQuestionThenAnswer(ip) => {
                        let mut decoy_query = query.clone();
                        decoy_query.take_queries();
                        for q in query.queries() {
                            decoy_query.add_query(Query::query(
                                Name::from_str("decoy.example.").unwrap(),
                                q.query_type(),
                            ));
                        }
                        let decoy = answer(&decoy_query, ResponseCode::NoError, Some(DECOY_IP));
                        socket.send_to(&decoy.to_vec().unwrap(), peer).await.unwrap();
                        let reply = answer(&query, ResponseCode::NoError, Some(ip));
                        socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
                    }
                }
            }
        });

        Self { addr, requests }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn answer(query: &Message, code: ResponseCode, ip: Option<IpAddr>) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(code);

    for q in query.queries() {
        reply.add_query(q.clone());
        let rdata = match (q.query_type(), ip) {
            (RecordType::A, Some(IpAddr::V4(v4))) => Some(RData::A(A(v4))),
            (RecordType::AAAA, Some(IpAddr::V6(v6))) => Some(RData::AAAA(AAAA(v6))),
            _ => None,
        };
        if let Some(rdata) = rdata {
            reply.add_answer(Record::from_rdata(q.name().clone(), 60, rdata));
        }
    }
    reply
}

/// Build a recursive query for `domain`.
pub fn create_query(domain: &str, query_type: RecordType, id: u16) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(domain).unwrap(), query_type));
    message
}
