/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-query context shared across plugin invocations.

use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Default per-query processing budget.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sequence walk state.
///
/// `Broken` means the whole walk stops (e.g. `accept`); `ReachedTail` means
/// the current chain ran out of nodes, which lets a `jump` caller resume its
/// own remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFlowState {
    Running,
    Broken,
    ReachedTail,
}

/// Mutable state carried by one DNS query from inbound parse to outbound
/// serialization. Not shared across queries; lazy cache refresh works on an
/// explicit copy.
#[derive(Debug)]
pub struct DnsContext {
    pub src_addr: SocketAddr,

    /// Inbound query message. Executors that prepare the outbound query
    /// (ECS handlers) mutate this in place before forwarding.
    pub request: Message,

    /// Current response, if any plugin produced one.
    pub response: Option<Message>,

    pub exec_flow_state: ExecFlowState,

    /// Absolute deadline for this query. Upstream and cache backend calls
    /// must not outlive it.
    pub deadline: Instant,

    response_rev: u64,
    black_hole_orig_resp: Option<Message>,
    black_hole_tag: Option<String>,
}

impl DnsContext {
    pub fn new(src_addr: SocketAddr, request: Message) -> Self {
        DnsContext {
            src_addr,
            request,
            response: None,
            exec_flow_state: ExecFlowState::Running,
            deadline: Instant::now() + DEFAULT_QUERY_TIMEOUT,
            response_rev: 0,
            black_hole_orig_resp: None,
            black_hole_tag: None,
        }
    }

    /// Set the current response and bump the revision counter.
    ///
    /// The revision counter is how a wrapping cache distinguishes "downstream
    /// produced a fresh response" from "downstream left the cached one in
    /// place": record the revision after installing the cached copy, compare
    /// after the chain returns.
    pub fn set_response(&mut self, response: Message) {
        self.response = Some(response);
        self.response_rev += 1;
    }

    pub fn response_rev(&self) -> u64 {
        self.response_rev
    }

    /// Mutable handle to the query's EDNS option list, created on demand.
    #[allow(unused)]
    pub fn query_opt_mut(&mut self) -> &mut hickory_proto::rr::rdata::OPT {
        crate::core::dns_utils::ensure_opt_record(&mut self.request)
    }

    /// Preserve the response a black-hole interceptor is about to replace.
    pub fn set_black_hole_orig_resp(&mut self, resp: Message) {
        self.black_hole_orig_resp = Some(resp);
    }

    pub fn black_hole_orig_resp(&self) -> Option<&Message> {
        self.black_hole_orig_resp.as_ref()
    }

    pub fn set_black_hole_tag(&mut self, tag: &str) {
        self.black_hole_tag = Some(tag.to_string());
    }

    pub fn black_hole_tag(&self) -> Option<&str> {
        self.black_hole_tag.as_deref()
    }

    /// Independent copy for an asynchronous lazy cache update.
    ///
    /// The copy shares no mutable state with the original, starts a fresh
    /// walk and gets its own deadline.
    pub fn copy_for_update(&self, budget: Duration) -> DnsContext {
        DnsContext {
            src_addr: self.src_addr,
            request: self.request.clone(),
            response: None,
            exec_flow_state: ExecFlowState::Running,
            deadline: Instant::now() + budget,
            response_rev: 0,
            black_hole_orig_resp: None,
            black_hole_tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};

    fn make_context() -> DnsContext {
        let mut request = Message::new();
        request.set_id(0x1234);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        DnsContext::new("127.0.0.1:5353".parse().unwrap(), request)
    }

    #[test]
    fn test_response_rev_tracks_set_response() {
        let mut ctx = make_context();
        assert_eq!(ctx.response_rev(), 0);

        ctx.set_response(Message::new());
        let rev = ctx.response_rev();
        assert_eq!(rev, 1);

        // Touching the response in place does not change the revision.
        if let Some(resp) = ctx.response.as_mut() {
            resp.set_id(9);
        }
        assert_eq!(ctx.response_rev(), rev);

        ctx.set_response(Message::new());
        assert_eq!(ctx.response_rev(), rev + 1);
    }

    #[test]
    fn test_copy_for_update_is_independent() {
        let mut ctx = make_context();
        ctx.set_response(Message::new());
        ctx.set_black_hole_tag("bh");

        let copy = ctx.copy_for_update(Duration::from_secs(5));
        assert!(copy.response.is_none());
        assert!(copy.black_hole_tag().is_none());
        assert_eq!(copy.request.id(), ctx.request.id());
        assert_eq!(copy.exec_flow_state, ExecFlowState::Running);
    }
}
