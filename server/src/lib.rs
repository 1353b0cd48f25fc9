//! Eventcast Server - Real-time event notification hub.
//!
//! This crate provides the realtime core of Eventcast, responsible for:
//! - Tracking live WebSocket connections
//! - Broadcasting event change notifications to every connection
//! - Keeping the connection registry consistent as clients come and go
//!
//! # Architecture
//!
//! Clients connect over WebSocket and are registered in a shared
//! [`registry::ConnectionRegistry`]. Business operations in
//! [`catalog::EventCatalog`] commit a change and then publish a
//! [`protocol::Notification`] through [`dispatch::BroadcastDispatcher`], which
//! fans it out to every registered connection. Each connection is driven by
//! [`lifecycle::ConnectionLifecycleHandler`] until it closes. Nothing is
//! persisted.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod routes;
