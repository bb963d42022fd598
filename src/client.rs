//! Task owning the [`ServerManager`].
//!
//! All registration logic runs on one task. Other tasks talk to it through
//! a cloneable [`ClientHandle`]; every request carries a oneshot reply
//! channel.
//!
//! ```text
//!   ClientHandle ──mpsc──▶ Lwm2mClient::run ──▶ ServerManager
//!        ▲                      │    ▲
//!        └────── oneshot ───────┘    └── sleep_until(next job deadline)
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Lwm2mError, Result};
use crate::protocol::{Ssid, Target};
use crate::servers::{ServerManager, ServerStatus};

/// Pending requests the client task buffers before senders wait
const COMMAND_BUFFER: usize = 32;

enum Command {
    ScheduleUpdate(Target, oneshot::Sender<Result<()>>),
    Reconnect(Target, oneshot::Sender<Result<()>>),
    Reregister(Ssid, oneshot::Sender<Result<()>>),
    EnterOffline(oneshot::Sender<Result<()>>),
    ExitOffline(oneshot::Sender<Result<()>>),
    Enable(Ssid, oneshot::Sender<Result<()>>),
    Disable(Ssid, Option<Option<Duration>>, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<Vec<ServerStatus>>),
    Shutdown(oneshot::Sender<()>),
}

/// Runs a [`ServerManager`] until shut down
#[derive(Debug)]
pub struct Lwm2mClient {
    manager: ServerManager,
    commands: mpsc::Receiver<Command>,
}

impl Lwm2mClient {
    /// Wrap a manager; drive it with [`run`](Self::run)
    pub fn new(manager: ServerManager) -> (Self, ClientHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let client = Self {
            manager,
            commands: rx,
        };
        (client, ClientHandle { commands: tx })
    }

    /// Run scheduled jobs and serve requests.
    ///
    /// Returns after [`ClientHandle::shutdown`], or once every handle is
    /// dropped and no job is left.
    pub async fn run(mut self) {
        tracing::info!("LwM2M client starting");
        self.manager.start();
        let mut accepting = true;

        loop {
            self.manager.run_pending().await;

            let deadline = self.manager.next_deadline();
            if !accepting && deadline.is_none() {
                break;
            }
            let wake = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.manager.shutdown().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => handle(&mut self.manager, command),
                    None => {
                        tracing::debug!("all client handles dropped");
                        accepting = false;
                    },
                },
                () = wake => {},
            }
        }
        tracing::info!("LwM2M client stopped");
    }
}

fn handle(manager: &mut ServerManager, command: Command) {
    match command {
        Command::ScheduleUpdate(target, reply) => {
            let _ = reply.send(manager.schedule_registration_update(target));
        },
        Command::Reconnect(target, reply) => {
            let _ = reply.send(manager.schedule_reconnect(target));
        },
        Command::Reregister(ssid, reply) => {
            let _ = reply.send(manager.schedule_reregister(ssid));
        },
        Command::EnterOffline(reply) => {
            manager.enter_offline();
            let _ = reply.send(Ok(()));
        },
        Command::ExitOffline(reply) => {
            manager.exit_offline();
            let _ = reply.send(Ok(()));
        },
        Command::Enable(ssid, reply) => {
            let _ = reply.send(manager.enable_server(ssid));
        },
        Command::Disable(ssid, timeout, reply) => {
            let result = match timeout {
                Some(timeout) => manager.disable_server_with_timeout(ssid, timeout),
                None => manager.disable_server(ssid),
            };
            let _ = reply.send(result);
        },
        Command::Status(reply) => {
            let _ = reply.send(manager.status());
        },
        Command::Shutdown(_) => {},
    }
}

/// Cloneable handle to a running [`Lwm2mClient`]
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
}

impl ClientHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Lwm2mError::Internal("client task is not running".to_string()))?;
        rx.await
            .map_err(|_| Lwm2mError::Internal("client task dropped the request".to_string()))
    }

    /// Send an Update now to one or every active server
    pub async fn schedule_registration_update(&self, target: Target) -> Result<()> {
        self.request(|tx| Command::ScheduleUpdate(target, tx)).await?
    }

    /// Reconnect one or every active server
    pub async fn reconnect(&self, target: Target) -> Result<()> {
        self.request(|tx| Command::Reconnect(target, tx)).await?
    }

    /// Force a fresh Register with `ssid`
    pub async fn reregister(&self, ssid: Ssid) -> Result<()> {
        self.request(|tx| Command::Reregister(ssid, tx)).await?
    }

    /// Stop all traffic
    pub async fn enter_offline(&self) -> Result<()> {
        self.request(Command::EnterOffline).await?
    }

    /// Resume traffic
    pub async fn exit_offline(&self) -> Result<()> {
        self.request(Command::ExitOffline).await?
    }

    /// Re-enable a disabled server
    pub async fn enable_server(&self, ssid: Ssid) -> Result<()> {
        self.request(|tx| Command::Enable(ssid, tx)).await?
    }

    /// Disable a server for its Disable Timeout
    pub async fn disable_server(&self, ssid: Ssid) -> Result<()> {
        self.request(|tx| Command::Disable(ssid, None, tx)).await?
    }

    /// Disable a server for `timeout` (`None` until re-enabled)
    pub async fn disable_server_with_timeout(&self, ssid: Ssid, timeout: Option<Duration>) -> Result<()> {
        self.request(|tx| Command::Disable(ssid, Some(timeout), tx)).await?
    }

    /// Per-server status report
    pub async fn status(&self) -> Result<Vec<ServerStatus>> {
        self.request(Command::Status).await
    }

    /// De-register from every server and stop the client task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientConfig;
    use crate::dm::{InMemoryDataModel, SecurityInstance, ServerInstance, ServerObject};
    use crate::transport::mock::MockNetwork;

    fn client(network: &MockNetwork) -> (Lwm2mClient, ClientHandle) {
        let servers = ServerObject::new(vec![ServerInstance::new(1, 60, "U")]).unwrap();
        let dm = InMemoryDataModel::new(
            servers,
            vec![SecurityInstance::server(1, "coap://server.example.com")],
        )
        .unwrap();
        let manager = ServerManager::new(
            ClientConfig::default(),
            Arc::new(dm),
            network.socket_factory(),
            network.exchange(),
        )
        .unwrap();
        Lwm2mClient::new(manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_registers_and_shuts_down() {
        let network = MockNetwork::new();
        let (client, handle) = client(&network);
        let task = tokio::spawn(client.run());

        let status = handle.status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[0].active);
        assert_eq!(network.register_count(), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(network.deregister_count(), 1);
        assert!(matches!(handle.status().await, Err(Lwm2mError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_reports_api_errors() {
        let network = MockNetwork::new();
        let (client, handle) = client(&network);
        let task = tokio::spawn(client.run());

        let missing = Ssid::new(7).unwrap();
        assert!(matches!(
            handle.schedule_registration_update(Target::Server(missing)).await,
            Err(Lwm2mError::ServerNotFound(_))
        ));
        handle.enter_offline().await.unwrap();
        assert!(matches!(
            handle.schedule_registration_update(Target::All).await,
            Err(Lwm2mError::Offline)
        ));

        drop(handle);
        // nothing scheduled while offline, so the task ends
        task.await.unwrap();
    }
}
