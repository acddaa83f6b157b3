#![deny(missing_debug_implementations)]

//! # vgw-core
//!
//! `vgw-core` maintains one long-lived HTTP/2 session to a cloud voice
//! gateway: a server-push downchannel for directives, a multiplexed event
//! stream for client-originated messages with binary attachments, and an
//! idle-ping liveness cadence, all behind automatic reconnect with
//! exponential backoff.
//!
//! The public entry point is [`GatewayConnectionManager`]; construct one
//! with your own [`ConnectionFactory`], [`AuthDelegate`], [`AttachmentManager`],
//! and [`PostConnectFactory`], then `enable()` it and `send()` [`MessageRequest`]s.
//!
//! This crate does not open sockets itself — [`ConnectionFactory`] is the
//! seam a caller uses to supply a TLS-terminated connection to the gateway.

mod attachment;
mod auth;
mod common;
mod error;
mod handler;
mod manager;
mod message;
mod mime;
mod postconnect;
mod router;
pub mod rt;
mod transport;

pub use crate::attachment::{AttachmentManager, AttachmentWriter, ReadOutcome, AttachmentReader, WriteOutcome};
pub use crate::auth::AuthDelegate;
pub use crate::error::{Error, Result};
pub use crate::manager::GatewayConnectionManager;
pub use crate::message::{
    ChangedReason, ConnectionStatus, ConnectionStatusObserver, ConnectionStatusUpdate, MessageObserver, MessageRequest,
    MessageRequestObserver, MessageSender, OutboundAttachment, Status,
};
pub use crate::postconnect::{ContextProvider, DefaultPostConnectFactory, PostConnectFactory, PostConnectOperation};
pub use crate::transport::{ConnectionFactory, TransportConfig};
