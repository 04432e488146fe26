// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A tracked connection.
use flowoffload::api::Direction;
use flowoffload::api::Protocol;
use flowoffload::api::TcpState;
use flowoffload::engine::conntrack::Conn;
use flowoffload::engine::conntrack::ConnStatus;
use flowoffload::engine::conntrack::ConnTuple;
use flowoffload::engine::conntrack::CtStatus;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

pub struct MockConn {
    orig: ConnTuple,
    pub state: Mutex<TcpState>,
    pub helper: AtomicBool,
    pub status: ConnStatus,
    pub liberal: AtomicBool,
    /// How many times the tracker was asked to go liberal.
    pub liberal_calls: AtomicU32,
}

impl MockConn {
    /// A confirmed connection which has seen traffic both ways.
    pub fn new(orig: ConnTuple) -> Arc<Self> {
        Arc::new(Self {
            orig,
            state: Mutex::new(TcpState::Established),
            helper: AtomicBool::new(false),
            status: ConnStatus::new(CtStatus::CONFIRMED | CtStatus::SEEN_REPLY),
            liberal: AtomicBool::new(false),
            liberal_calls: AtomicU32::new(0),
        })
    }

    pub fn tcp(src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Arc<Self> {
        Self::new(ConnTuple {
            src,
            dst,
            src_port: sport,
            dst_port: dport,
            proto: Protocol::Tcp,
        })
    }

    pub fn udp(src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Arc<Self> {
        Self::new(ConnTuple {
            src,
            dst,
            src_port: sport,
            dst_port: dport,
            proto: Protocol::Udp,
        })
    }

    pub fn set_state(&self, state: TcpState) {
        *self.state.lock().unwrap() = state;
    }
}

impl Conn for MockConn {
    fn tuple(&self, dir: Direction) -> ConnTuple {
        match dir {
            Direction::Original => self.orig,
            Direction::Reply => ConnTuple {
                src: self.orig.dst,
                dst: self.orig.src,
                src_port: self.orig.dst_port,
                dst_port: self.orig.src_port,
                proto: self.orig.proto,
            },
        }
    }

    fn tcp_state(&self) -> TcpState {
        *self.state.lock().unwrap()
    }

    fn has_helper(&self) -> bool {
        self.helper.load(Ordering::Relaxed)
    }

    fn status(&self) -> &ConnStatus {
        &self.status
    }

    fn set_tcp_be_liberal(&self) {
        self.liberal.store(true, Ordering::Relaxed);
        self.liberal_calls.fetch_add(1, Ordering::Relaxed);
    }
}
