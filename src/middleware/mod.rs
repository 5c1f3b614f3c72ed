//! C9 — the request-phase/response-phase middleware chain.
//!
//! Replaces `proxy/filter/`'s two-way `Continue`/`Reject` contract with the
//! spec's three-way outcome: a request-phase handler can also `fail` with a
//! `GatewayError`, letting the handler map to a status code through the same
//! `§7` table every other failure uses, instead of each filter building its
//! own response. The enum-of-variants shape (static dispatch, no `dyn`) is
//! kept from the teacher's `proxy/filter::Filter`.

pub mod auth;
pub mod cors;
pub mod rate_limit;

use crate::error::GatewayError;
use crate::proxy::context::BoxBody;

pub enum FilterResult {
    Continue,
    Respond(hyper::Response<BoxBody>),
    Fail(GatewayError),
}
