//! # LwM2M Client Core - Server Registration and Connection Lifecycle
//!
//! Client-side management of LwM2M server registrations: which servers are
//! active, how their transports are connected, when Register, Update and
//! De-register are sent, and how failures are retried.
//!
//! ## Features
//!
//! - **Registration state machine**: Register, periodic Update, De-register,
//!   re-registration on rejection or expiry
//! - **Connection lifecycle**: UDP and SMS transports per server, binding
//!   mode driven, with queue mode and local port reuse
//! - **Deterministic scheduling**: typed jobs on a single queue, at most one
//!   pending action per server, exponential backoff on transient failures
//! - **Actor runtime**: one tokio task owns all state; other tasks use a
//!   cloneable handle
//!
//! ## Architecture
//!
//! ```text
//!   ClientHandle ──▶ Lwm2mClient ──▶ ServerManager ──▶ Scheduler
//!                                       │    │
//!                      ┌────────────────┘    └──────────────────┐
//!                      ▼                                        ▼
//!                  DataModel                 SocketFactory + RegistrationExchange
//!        (Server / Security objects)               (UDP, mock, ...)
//! ```
//!
//! ### Server Lifecycle
//!
//! ```text
//!                Activate            Register ok
//!   [Inactive] ───────────▶ connect ────────────▶ [Active]
//!       ▲                      │                     │ SendUpdate
//!       │ Deactivate           │ failure             ▼
//!       │ (De-register)        ▼               refresh + Update
//!       └───────────── retry with backoff ◀── rejected / expired
//! ```
//!
//! ### Update Timing
//!
//! | Lifetime | MAX_TRANSMIT_WAIT | Margin | Next Update after |
//! |----------|-------------------|--------|-------------------|
//! | 60 s     | 5 s               | 5 s    | 55 s              |
//! | 60 s     | 93 s              | 30 s   | 30 s              |
//! | 86400 s  | 93 s              | 93 s   | 86307 s           |
//! | 2 s      | 93 s              | 1 s    | 1 s               |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use lwm2m::{ClientConfig, InMemoryDataModel, Lwm2mClient, ServerManager, Target};
//! use lwm2m::transport::{mock::MockNetwork, UdpSocketFactory};
//!
//! let config = ClientConfig::from_file("client.toml")?;
//! let dm = Arc::new(InMemoryDataModel::from_config(&config)?);
//! let sockets = Arc::new(UdpSocketFactory::new(config.udp.address_family));
//! let exchange = MockNetwork::new().exchange(); // plug a CoAP exchange here
//!
//! let manager = ServerManager::new(config, dm, sockets, exchange)?;
//! let (client, handle) = Lwm2mClient::new(manager);
//! tokio::spawn(client.run());
//!
//! handle.schedule_registration_update(Target::All).await?;
//! for server in handle.status().await? {
//!     println!("{}", serde_json::to_string(&server)?);
//! }
//! handle.shutdown().await?;
//! ```
//!
//! ## Modules
//!
//! - [`servers`]: Registration state machine and connection lifecycle
//! - [`sched`]: Job queue with retry backoff
//! - [`client`]: Task runtime and handle
//! - [`dm`]: Server and Security objects, data model trait
//! - [`transport`]: Socket and exchange contracts, UDP and mock transports
//! - [`protocol`]: SSIDs, binding modes, request parameters
//! - [`notify`]: Bootstrap and notification hooks
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod dm;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod sched;
pub mod servers;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientHandle, Lwm2mClient};
pub use config::ClientConfig;
pub use dm::{DataModel, InMemoryDataModel, SecurityInstance, ServerInstance, ServerObject};
pub use error::{Lwm2mError, Result};
pub use protocol::{BindingMode, ConnectionMode, ConnectionType, Ssid, Target};
pub use sched::{Job, RetryPolicy, Scheduler};
pub use servers::{RegistrationInfo, ServerManager, ServerStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
