// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow store behind an offload table.
//!
//! The store owns the offloaded entries and the packet matching fast
//! path. The engine allocates entries, fills in their forwarding
//! information and inserts them; from then on it only walks them.
use super::Direction;
use super::conntrack::ConnRef;
use super::hook::Frame;
use super::hook::HookVerdict;
use super::netdev::DevRef;
use super::netdev::NetDevice;
use super::route::DstRef;
use super::route::FlowRoute;
use super::route::XmitType;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use flowoffload_api::AddrFamily;
use flowoffload_api::ENCAP_MAX;
use flowoffload_api::Encap;
use flowoffload_api::MacAddr;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FlowStoreError {
    /// Iteration was interrupted; the rest of the entries will be
    /// visited by a later walk.
    #[error("iteration interrupted")]
    Again,
    #[error("flow already offloaded")]
    Exists,
    #[error("out of memory")]
    NoMem,
    #[error("no destination for {0} direction")]
    NoDst(Direction),
    #[error("flow block setup failed on {dev}: {msg}")]
    Setup { dev: String, msg: String },
    #[error("{0}")]
    Other(String),
}

/// Bind or unbind a device from hardware flow programming.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowBlockCommand {
    Bind,
    Unbind,
}

impl fmt::Display for FlowBlockCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Unbind => write!(f, "unbind"),
        }
    }
}

/// One direction of an offloaded flow.
#[derive(Clone, Debug, Default)]
pub struct FlowOffloadTuple {
    /// The interface packets of this direction arrive on.
    pub iifidx: u32,
    pub encap: heapless::Vec<Encap, ENCAP_MAX>,
    pub in_vlan_ingress: u8,
    pub xmit_type: XmitType,
    pub oifidx: u32,
    pub hw_ifidx: u32,
    pub h_source: MacAddr,
    pub h_dest: MacAddr,
    /// The destination used for neighbour and IPsec transmission.
    /// This is the entry's own reference.
    pub dst_cache: Option<DstRef>,
}

/// An offloaded flow.
#[derive(Clone)]
pub struct FlowOffloadEntry {
    pub ct: ConnRef,
    pub tuplehash: [FlowOffloadTuple; 2],
}

impl fmt::Debug for FlowOffloadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOffloadEntry")
            .field("flow", &self.ct.tuple(Direction::Original))
            .field("tuplehash", &self.tuplehash)
            .finish()
    }
}

impl FlowOffloadEntry {
    pub fn new(ct: ConnRef) -> Self {
        Self { ct, tuplehash: Default::default() }
    }

    pub fn tuple(&self, dir: Direction) -> &FlowOffloadTuple {
        &self.tuplehash[dir.idx()]
    }

    /// Copy the forwarding information of `route` into the entry.
    ///
    /// Directions transmitted through the neighbour layer or an IPsec
    /// transform take their own reference on the destination.
    pub fn route_init(&mut self, route: &FlowRoute) -> Result<(), FlowStoreError> {
        for dir in [Direction::Original, Direction::Reply] {
            let rt = &route[dir];
            let dst = rt.dst.as_ref().ok_or(FlowStoreError::NoDst(dir))?;
            let tuple = &mut self.tuplehash[dir.idx()];

            tuple.iifidx = rt.in_.ifindex;
            tuple.encap = rt.in_.encap.clone();
            tuple.in_vlan_ingress = rt.in_.ingress_vlans;
            tuple.xmit_type = rt.xmit_type;

            match rt.xmit_type {
                XmitType::Direct => {
                    tuple.h_source = rt.out.h_source;
                    tuple.h_dest = rt.out.h_dest;
                    tuple.oifidx = rt.out.ifindex;
                    tuple.hw_ifidx = rt.out.hw_ifindex;
                    tuple.dst_cache = None;
                }

                XmitType::Neigh | XmitType::Xfrm => {
                    tuple.oifidx = rt.out.ifindex;
                    tuple.dst_cache = Some(Arc::clone(dst));
                }
            }
        }

        Ok(())
    }

    /// Does either direction of the flow arrive on `ifindex`?
    pub fn uses_ifindex(&self, ifindex: u32) -> bool {
        self.tuplehash.iter().any(|t| t.iifidx == ifindex)
    }
}

/// The storage and matching engine of one offload table.
///
/// Implementations synchronize internally; every method may be called
/// concurrently from packet processing and the sweep.
pub trait FlowStore: Send + Sync {
    /// Bring the store up. `hw` marks the store backing the hardware
    /// offload table.
    fn init(&self, hw: bool) -> Result<(), FlowStoreError>;

    fn free(&self);

    /// Allocate an entry for `ct`.
    fn alloc(&self, ct: &ConnRef) -> Option<FlowOffloadEntry> {
        Some(FlowOffloadEntry::new(Arc::clone(ct)))
    }

    fn route_init(
        &self,
        flow: &mut FlowOffloadEntry,
        route: &FlowRoute,
    ) -> Result<(), FlowStoreError> {
        flow.route_init(route)
    }

    /// Insert `flow`. On error the entry is dropped by the store.
    fn add(&self, flow: FlowOffloadEntry) -> Result<(), FlowStoreError>;

    /// Visit every stored entry. [`FlowStoreError::Again`] reports a
    /// walk cut short.
    fn iterate(
        &self,
        f: &mut dyn FnMut(&FlowOffloadEntry),
    ) -> Result<(), FlowStoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry that references `dev`.
    fn cleanup(&self, dev: &NetDevice);

    /// Bind or unbind `dev` from hardware flow programming.
    fn setup(
        &self,
        dev: &DevRef,
        cmd: FlowBlockCommand,
    ) -> Result<(), FlowStoreError>;

    /// Run the fast path over an ingress frame of family `family`.
    fn fast_path(&self, family: AddrFamily, frame: &mut Frame<'_>) -> HookVerdict;
}

pub type StoreRef = Arc<dyn FlowStore>;
