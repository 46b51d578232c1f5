//! Launcher manager
//!
//! Owns the listener, the broker, both D-Bus links and the service registry,
//! and drives them through one run:
//!
//! 1. acquire the listener socket
//! 2. spawn the broker with one end of the controller socket pair
//! 3. load service files and register each name with the broker
//! 4. install listener and policy with the broker (waits for the reply)
//! 5. connect the regular link through the listener
//! 6. loop until the broker exits or a termination signal arrives
//!
//! Teardown closes the regular link, then the controller link, then the
//! listener (unlinking its path if it was bound), then drops the registry.

mod signals;

pub use signals::{LaunchSignal, SignalHandler};

use std::os::fd::OwnedFd;

use futures_lite::StreamExt;
use zbus::connection::Builder;
use zbus::{Connection, Message, MessageStream};

use crate::config::{LaunchConfig, ListenTarget};
use crate::dbus::{self, ControllerEvent, ServiceManagerCall};
use crate::error::{bus_err, LaunchError};
use crate::listener::Listener;
use crate::policy;
use crate::services::{self, ServiceRegistry};
use crate::supervisor::{self, Broker};

pub struct Manager {
    config: LaunchConfig,
    listener: Listener,
    registry: ServiceRegistry,
}

impl Manager {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            listener: Listener::new(),
            registry: ServiceRegistry::new(),
        }
    }

    /// Run the launcher until the broker exits or a termination signal
    /// arrives. The broker's failure is the launcher's failure.
    pub async fn run(mut self) -> Result<(), LaunchError> {
        self.acquire_listener()?;

        let result = self.serve().await;

        if let Err(e) = self.listener.close() {
            log::warn!("Failed to clean up listener: {}", e);
        }
        self.release_services();

        result
    }

    fn acquire_listener(&mut self) -> Result<(), LaunchError> {
        match &self.config.listen {
            ListenTarget::Inherit => self.listener.acquire_inherited()?,
            ListenTarget::Path(path) => self.listener.acquire_path(path, self.config.force)?,
        }

        match self.listener.path() {
            Some(path) => log::info!("Listening on {}", path.display()),
            None => log::info!("Listening on inherited socket"),
        }
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), LaunchError> {
        let mut signals = SignalHandler::new().map_err(LaunchError::Signal)?;

        let (ours, theirs) = supervisor::controller_pair()?;
        let mut broker = Broker::spawn(&self.config.broker, theirs)?;

        // A broker dying during startup decides the outcome
        let (controller, mut inbound, regular) = tokio::select! {
            links = self.bootstrap(ours) => links?,
            exit = broker.wait() => {
                log::warn!("Broker exited during startup: {:?}", exit);
                return exit.into_result();
            }
        };
        log::info!("Ready");

        let mut controller_open = true;
        let outcome = loop {
            tokio::select! {
                exit = broker.wait() => {
                    log::info!("Broker exited: {:?}", exit);
                    break exit.into_result();
                }
                sig = signals.wait() => {
                    log::info!("Caught {:?}, shutting down", sig);
                    break Ok(());
                }
                msg = inbound.next(), if controller_open => match msg {
                    Some(Ok(msg)) => self.dispatch(&regular, &msg).await,
                    Some(Err(e)) => log::warn!("Controller link error: {}", e),
                    None => {
                        log::warn!("Controller link closed by broker");
                        controller_open = false;
                    }
                },
            }
        };

        if let Err(e) = regular.close().await {
            log::debug!("Closing regular link: {}", e);
        }
        if let Err(e) = controller.close().await {
            log::debug!("Closing controller link: {}", e);
        }

        outcome
    }

    /// Controller link, its inbound stream, and the regular link
    async fn bootstrap(
        &mut self,
        ours: OwnedFd,
    ) -> Result<(Connection, MessageStream, Connection), LaunchError> {
        let controller = connect_controller(ours).await?;
        let inbound = MessageStream::from(&controller);

        self.load_services(&controller).await?;
        self.add_listener(&controller).await?;

        let regular = self.connect_regular().await?;
        Ok((controller, inbound, regular))
    }

    fn release_services(&mut self) {
        let ids: Vec<String> = self.registry.ids().map(str::to_owned).collect();
        for id in ids {
            if let Some(service) = self.registry.remove(&id) {
                log::debug!("Released service {} '{}'", id, service.name());
            }
        }
    }

    async fn load_services(&mut self, controller: &Connection) -> Result<(), LaunchError> {
        let loaded = services::load_services(&mut self.registry, &self.config.service_dir).await;

        for (id, name) in &loaded {
            dbus::add_name(controller, id, name).await?;
        }

        log::info!(
            "Loaded {} activatable services from {}",
            loaded.len(),
            self.config.service_dir.display()
        );
        Ok(())
    }

    async fn add_listener(&self, controller: &Connection) -> Result<(), LaunchError> {
        let policy = policy::load(&self.config.policy_path)?;
        let wire = policy.export()?;

        let fd = self.listener.fd().ok_or(LaunchError::ListenerUnset)?;
        dbus::add_listener(controller, fd, &self.config.policy_path, &wire).await
    }

    async fn connect_regular(&self) -> Result<Connection, LaunchError> {
        let stream = self.listener.connect()?;
        let stream = tokio::net::UnixStream::from_std(stream)
            .map_err(|e| bus_err("regular connection", e.into()))?;

        Builder::unix_stream(stream)
            .build()
            .await
            .map_err(|e| bus_err("regular connection", e))
    }

    /// Act on one controller-link message. Failures here are logged, never
    /// fatal.
    async fn dispatch(&self, regular: &Connection, msg: &Message) {
        let event = match ControllerEvent::from_message(msg) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Malformed controller message: {}", e);
                return;
            }
        };

        let Some(call) = dbus::route(&self.registry, event) else {
            return;
        };

        if let Err(e) = send_call(regular, &call).await {
            log::error!("{}", e);
        }
    }
}

async fn connect_controller(fd: OwnedFd) -> Result<Connection, LaunchError> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    let stream = tokio::net::UnixStream::from_std(stream)
        .map_err(|e| bus_err("controller connection", e.into()))?;

    Builder::unix_stream(stream)
        .p2p()
        .build()
        .await
        .map_err(|e| bus_err("controller connection", e))
}

/// Send a call to systemd without waiting for any reply
async fn send_call(regular: &Connection, call: &ServiceManagerCall) -> Result<(), LaunchError> {
    let msg = call.to_message().map_err(|e| bus_err(call.member(), e))?;
    regular
        .send(&msg)
        .await
        .map_err(|e| bus_err(call.member(), e))
}
