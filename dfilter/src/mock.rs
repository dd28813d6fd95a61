// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This module is NOT intended to be used by regular users. It is used for
//! mocking purpose only.

use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, name::ToDname, Dname, Message, MessageBuilder, Rtype};
use domain::rdata::A;
use std::{net::Ipv4Addr, str::FromStr};
use tokio::net::UdpSocket;

use crate::MAX_LEN;

/// Build a query message the way a stub resolver would.
pub fn build_query(name: &str, rtype: Rtype, id: u16) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(name).unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder.push((&name, rtype)).unwrap();
    builder.into_message()
}

/// Mock upstream resolver answering every A query with a fixed address.
pub struct Server {
    socket: UdpSocket,
    answer: Ipv4Addr,
    ttl: u32,
}

impl Server {
    /// Create a new mock server answering with the given address and TTL.
    pub fn new(socket: UdpSocket, answer: Ipv4Addr, ttl: u32) -> Self {
        Self {
            socket,
            answer,
            ttl,
        }
    }

    /// Run it
    pub async fn run(self) -> Result<(), std::io::Error> {
        let mut buf = vec![0u8; MAX_LEN];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let query = match Message::from_octets(Bytes::copy_from_slice(&buf[..len])) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let question = match query.first_question() {
                Some(q) => q,
                None => continue,
            };
            let name = question.qname().to_bytes();
            let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
                .unwrap()
                .start_answer(&query, Rcode::NoError)
                .unwrap();
            builder.header_mut().set_ra(true);
            builder.push((name, self.ttl, A::new(self.answer))).unwrap();
            let resp = builder.into_message();
            self.socket.send_to(resp.as_slice(), &peer).await?;
        }
    }
}
