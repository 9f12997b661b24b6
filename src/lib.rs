//! **ringpool** is a client-side connection pool for distributed key-value
//! datastores whose clusters are organized as a token ring with replication
//! across racks and datacenters.
//!
//! The pool keeps one bounded sub-pool of connections per backend host,
//! continuously refreshes its view of the cluster from a
//! [`HostSupplier`](crate::hosts::HostSupplier), and executes operations with
//! token-aware host selection, failover and retry. Unhealthy hosts are
//! detected from operation feedback (and pings, for async pools) and their
//! sub-pools recycled.
//!
//! ## Getting started
//!
//! Wire a transport, a connection factory and the membership suppliers, then
//! run operations through the pool:
//!
//! ```no_run
//! use futures::FutureExt;
//! use ringpool::config::ConnectionPoolConfig;
//! use ringpool::connection::{ConnectionFactory, ConnectionTransport};
//! use ringpool::future::BoxFuture;
//! use ringpool::host::{Host, HostToken, Token};
//! use ringpool::hosts::{HostSupplier, TokenSupplier};
//! use ringpool::monitor::CountingConnectionPoolMonitor;
//! use ringpool::operation::{BaseOperation, Operation};
//! use ringpool::pool::ConnectionPool;
//! use ringpool::Result;
//! use std::sync::Arc;
//!
//! struct KvTransport;
//!
//! #[async_trait::async_trait]
//! impl ConnectionTransport for KvTransport {
//!     fn is_broken(&self) -> bool { false }
//!     async fn ping(&self) -> Result<()> { Ok(()) }
//!     async fn close(&self) {}
//! }
//!
//! struct KvConnectionFactory;
//!
//! impl ConnectionFactory<KvTransport> for KvConnectionFactory {
//!     fn create_connection<'a>(&'a self, _host: &'a Host) -> BoxFuture<'a, Result<KvTransport>> {
//!         async move { Ok(KvTransport) }.boxed()
//!     }
//! }
//!
//! struct SeedSupplier;
//!
//! #[async_trait::async_trait]
//! impl HostSupplier for SeedSupplier {
//!     async fn get_hosts(&self) -> Result<Vec<Host>> {
//!         Ok(vec![
//!             Host::new("kv-1", 8102).with_token(Token(0)),
//!             Host::new("kv-2", 8102).with_token(Token(1 << 62)),
//!         ])
//!     }
//! }
//!
//! struct SeedTokens;
//!
//! impl TokenSupplier for SeedTokens {
//!     fn get_tokens(&self, hosts: &[Arc<Host>]) -> Vec<HostToken> {
//!         hosts
//!             .iter()
//!             .filter_map(|host| host.token().map(|token| HostToken::new(token, host.clone())))
//!             .collect()
//!     }
//! }
//!
//! struct Get {
//!     key: String,
//! }
//!
//! impl BaseOperation for Get {
//!     fn name(&self) -> &str { "get" }
//!     fn key(&self) -> Option<&str> { Some(&self.key) }
//! }
//!
//! #[async_trait::async_trait]
//! impl Operation<KvTransport> for Get {
//!     type Output = Option<String>;
//!
//!     async fn execute(&self, _transport: &KvTransport) -> Result<Option<String>> {
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ConnectionPoolConfig::new("sessions")
//!         .with_host_supplier(Arc::new(SeedSupplier))
//!         .with_token_supplier(Arc::new(SeedTokens));
//!
//!     let pool = ConnectionPool::new(
//!         KvConnectionFactory,
//!         config,
//!         Arc::new(CountingConnectionPoolMonitor::default()),
//!     )?;
//!     pool.start().await?;
//!
//!     let result = pool
//!         .execute_with_failover(&Get { key: "user-1".into() })
//!         .await?;
//!     println!("served by {:?}", result.node());
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Host selection
//!
//! The default [`TokenAwareSelection`](crate::selection::TokenAwareSelection)
//! routes keyed operations to the token owner and falls back to rack and
//! datacenter peers during failover. Clusters fronted by a proxy tier can use
//! [`RoundRobinSelection`](crate::selection::RoundRobinSelection), or plug in
//! their own [`HostSelectionStrategy`](crate::selection::HostSelectionStrategy).

pub mod config;
pub mod connection;
pub mod error;
pub mod future;
pub mod health;
pub mod host;
pub mod host_pool;
pub mod hosts;
pub mod monitor;
pub mod operation;
pub mod pool;
pub mod retry;
pub mod selection;

#[cfg(test)]
pub(crate) mod testing;

pub type Error = error::Error;
pub type Result<T> = error::Result<T>;
