//! Concurrent pipeline engine.
//!
//! Building blocks, leaves first:
//! - [`Valve`]: synchronous, closable, single-value hand-off
//! - [`Ref`] / [`Lease`]: join counter and its RAII unit of interest
//! - [`Producer`], [`Filter`], [`Consumer`], [`Hub`]: stage roles
//! - [`Pipe`] / [`Handle`]: the closed set of stages and counted handles to them
//! - connectors ([`connect_pc`], [`connect_pf`], [`connect_fc`], [`connect_ff`],
//!   [`in_out`]): composition into larger stages
//!
//! Stages are generic over the payload type; the interpreter instantiates
//! them with its dynamic value type.

mod connect;
mod consumer;
mod filter;
mod hub;
mod pipe;
mod producer;
mod refcount;
mod stage;
mod valve;

pub use connect::{connect, connect_fc, connect_ff, connect_pc, connect_pf, in_out};
pub use consumer::Consumer;
pub use filter::Filter;
pub use hub::Hub;
pub use pipe::{Composite, Handle, Pipe, Role};
pub use producer::Producer;
pub use refcount::{Counted, Lease, Ref};
pub use stage::Payload;
pub use valve::{Frame, Frames, Valve};

/// Errors raised while assembling pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("{role} stage does not support {op}")]
    Unsupported { op: &'static str, role: Role },

    #[error("{side} side of connection must be a {wanted}, found {found}")]
    Mismatch {
        side: &'static str,
        wanted: Role,
        found: Role,
    },

    #[error("cannot connect {left} to {right}")]
    Incompatible { left: Role, right: Role },
}

/// A convenience alias for `Result<T, PipeError>`.
pub type Result<T> = std::result::Result<T, PipeError>;
