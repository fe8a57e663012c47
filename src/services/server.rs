use log::{debug, error, info, warn};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::connection::{ConnectionHandler, RegisterWriteListener};
use super::datum_bridge::{apply_updates, resolve_updates, DatumBridge, MeasurementListener, MeasurementUpdate, OperationalModes};
use super::scheduler::{ScheduledFuture, ScheduledTask, TaskScheduler};
use crate::config::model::find_control;
use crate::config::settings::ServerConfig;
use crate::modbus::encoding::parse_boolean;
use crate::modbus::types::{ModbusDataType, RegisterBlockType};
use crate::registers::RegisterStore;
use crate::storage::dao::{RegisterDao, RegisterPersister};
use crate::utils::error::ServerError;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Listening,
    RetryScheduled,
}

struct Lifecycle {
    status: ServerStatus,
    accept_task: Option<JoinHandle<()>>,
    pending_start: Option<ScheduledTask>,
    local_addr: Option<SocketAddr>,
    /// Bumped on every stop so stale scheduled starts can tell they were superseded.
    generation: u64,
}

type ConnectionMap = Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>;

/// Modbus TCP server instance: owns the listening socket, the live
/// connections and the register store they share.
#[derive(Clone)]
pub struct ModbusServer {
    config: Arc<RwLock<Arc<ServerConfig>>>,
    store: RegisterStore,
    dao: Option<Arc<dyn RegisterDao>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    operational_modes: Option<Arc<dyn OperationalModes>>,
    bridge: DatumBridge,
    lifecycle: Arc<tokio::sync::Mutex<Lifecycle>>,
    running: Arc<AtomicBool>,
    connections: ConnectionMap,
}

impl ModbusServer {
    /// Create a stopped server. Must be called within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let store = RegisterStore::new();
        Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            bridge: DatumBridge::spawn(store.clone()),
            store,
            dao: None,
            scheduler: None,
            operational_modes: None,
            lifecycle: Arc::new(tokio::sync::Mutex::new(Lifecycle {
                status: ServerStatus::Stopped,
                accept_task: None,
                pending_start: None,
                local_addr: None,
                generation: 0,
            })),
            running: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_dao(mut self, dao: Arc<dyn RegisterDao>) -> Self {
        self.dao = Some(dao);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_operational_modes(mut self, modes: Arc<dyn OperationalModes>) -> Self {
        self.operational_modes = Some(modes);
        self
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn store(&self) -> &RegisterStore {
        &self.store
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub async fn status(&self) -> ServerStatus {
        self.lifecycle.lock().await.status
    }

    /// Address of the listening socket while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Persister for this server's UID, when a DAO is configured.
    fn persister(&self, config: &ServerConfig) -> Option<RegisterPersister> {
        match (&self.dao, config.server_id()) {
            (Some(dao), Some(uid)) => Some(RegisterPersister::new(dao.clone(), uid)),
            _ => None,
        }
    }

    /// Fails when a register DAO is required but none is configured.
    pub fn health_check(&self) -> Result<String, ServerError> {
        let config = self.config();
        if config.dao_required && self.dao.is_none() {
            return Err(ServerError::DaoMissing);
        }
        Ok(format!("Modbus server {} OK", config.description()))
    }

    /// Bind and start accepting connections. A no-op when already listening.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.start_locked(&mut lifecycle).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop_locked(&mut lifecycle).await;
                Err(e)
            }
        }
    }

    /// Cancel any scheduled start and close the listener and every live
    /// connection. Calling it on a stopped server does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
    }

    /// Stop, then start again: after the startup delay when a scheduler is
    /// configured, otherwise immediately.
    pub async fn restart(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
        match self.scheduler.clone() {
            Some(scheduler) => {
                self.schedule_start_locked(&mut lifecycle, scheduler.as_ref());
                Ok(())
            }
            None => match self.start_locked(&mut lifecycle).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.stop_locked(&mut lifecycle).await;
                    Err(e)
                }
            },
        }
    }

    /// Replace the configuration and restart with it.
    pub async fn configuration_changed(&self, config: ServerConfig) -> Result<(), ServerError> {
        config.validate()?;
        match self.config.write() {
            Ok(mut current) => *current = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
        self.restart().await
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), ServerError> {
        if lifecycle.status == ServerStatus::Listening {
            return Ok(());
        }
        if let Some(task) = lifecycle.pending_start.take() {
            task.cancel();
        }
        lifecycle.status = ServerStatus::Starting;

        let config = self.config();
        config.validate()?;
        if config.dao_required && self.dao.is_none() {
            return Err(ServerError::DaoMissing);
        }

        self.reload_registers(&config).await?;
        if config.restrict_unit_ids {
            self.store.sync_units(&config.unit_ids());
        }

        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let server = self.clone();
        let accept_config = config.clone();
        lifecycle.accept_task = Some(tokio::spawn(async move {
            server.accept_loop(listener, accept_config).await;
        }));
        lifecycle.local_addr = Some(local_addr);
        lifecycle.status = ServerStatus::Listening;

        info!("🚀 Modbus server {} listening on {}", config.description(), local_addr);
        Ok(())
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        lifecycle.generation = lifecycle.generation.wrapping_add(1);
        if let Some(task) = lifecycle.pending_start.take() {
            task.cancel();
            debug!("Cancelled scheduled Modbus server start");
        }

        let was = lifecycle.status;
        self.running.store(false, Ordering::SeqCst);

        if let Some(accept_task) = lifecycle.accept_task.take() {
            accept_task.abort();
            let _ = accept_task.await;
        }

        let handles: Vec<JoinHandle<()>> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, handle)| handle).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, handle)| handle).collect(),
        };
        let closed = handles.len();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        lifecycle.local_addr = None;
        lifecycle.status = ServerStatus::Stopped;
        if was != ServerStatus::Stopped {
            info!(
                "🛑 Modbus server {} stopped ({} connection(s) closed)",
                self.config().description(),
                closed
            );
        }
    }

    fn schedule_start_locked(&self, lifecycle: &mut Lifecycle, scheduler: &dyn TaskScheduler) {
        let config = self.config();
        let delay = config.startup_delay();
        info!(
            "Will start Modbus server [{}] in {} seconds",
            config.description(),
            delay.as_secs()
        );
        let task = scheduler.schedule(delay, Self::scheduled_start(self.clone(), lifecycle.generation));
        lifecycle.pending_start = Some(task);
        lifecycle.status = ServerStatus::RetryScheduled;
    }

    /// Start attempt run by the scheduler; reschedules itself with the same
    /// delay while failures are transient.
    fn scheduled_start(server: ModbusServer, generation: u64) -> ScheduledFuture {
        Box::pin(async move {
            let mut lifecycle = server.lifecycle.lock().await;
            if lifecycle.generation != generation {
                debug!("Skipping superseded Modbus server start");
                return;
            }
            lifecycle.pending_start = None;

            if let Err(e) = server.start_locked(&mut lifecycle).await {
                server.stop_locked(&mut lifecycle).await;
                let description = server.config().description();
                match server.scheduler.clone() {
                    Some(scheduler) if e.is_retryable() => {
                        error!("Error starting Modbus server {}: {}", description, e);
                        server.schedule_start_locked(&mut lifecycle, scheduler.as_ref());
                    }
                    _ => error!("Unable to start Modbus server {}: {}", description, e),
                }
            }
        })
    }

    /// Replace register memory with the records persisted for this server.
    async fn reload_registers(&self, config: &ServerConfig) -> Result<(), ServerError> {
        let (Some(dao), Some(uid)) = (&self.dao, config.server_id()) else {
            return Ok(());
        };
        let records = dao.find_all(uid).await?;
        self.store.clear();
        for record in &records {
            let unit = self.store.unit(record.unit_id);
            let result = if record.block_type.is_bit_type() {
                unit.write_bit(record.block_type, record.address, record.value != 0)
            } else {
                unit.write_words(record.block_type, record.address, &[record.value])
            };
            if let Err(e) = result {
                warn!(
                    "Skipping persisted {} register {} of unit {}: {}",
                    record.block_type, record.address, record.unit_id, e
                );
            }
        }
        info!("📥 Loaded {} persisted register(s) for Modbus server {}", records.len(), uid);
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener, config: Arc<ServerConfig>) {
        let write_listener: Option<Arc<dyn RegisterWriteListener>> = self
            .persister(&config)
            .map(|p| Arc::new(p) as Arc<dyn RegisterWriteListener>);

        while self.running.load(Ordering::SeqCst) {
            match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    let _ = stream.set_nodelay(true);
                    let mut handler = ConnectionHandler::new(peer.to_string(), config.clone(), self.store.clone());
                    if let Some(listener) = &write_listener {
                        handler = handler.with_write_listener(listener.clone());
                    }
                    self.track_connection(handler, stream);
                }
                Ok(Err(e)) => {
                    warn!("Error accepting Modbus connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Modbus accept loop finished");
    }

    fn track_connection(&self, handler: ConnectionHandler, stream: tokio::net::TcpStream) {
        let id = handler.id();
        let connections = self.connections.clone();
        let mut tracked = match self.connections.lock() {
            Ok(tracked) => tracked,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Inserted under the lock, so the task cannot remove itself first.
        let handle = tokio::spawn(async move {
            handler.run(stream).await;
            if let Ok(mut connections) = connections.lock() {
                connections.remove(&id);
            }
        });
        tracked.insert(id, handle);
    }

    /// Wait for queued measurement updates to be applied.
    pub async fn flush_updates(&self) -> Result<(), ServerError> {
        self.bridge.flush().await
    }

    /// Set the measurement addressed by `{sourceId}/{propertyName}` from text,
    /// applying it like a captured value.
    pub async fn apply_control_value(&self, control_id: &str, text: &str) -> Result<(), ServerError> {
        let config = self.config();
        let (unit, block, address, meas) = find_control(&config.units, control_id)
            .ok_or_else(|| ServerError::Config(format!("Unknown control {}", control_id)))?;
        let value = control_value(block.block_type, meas.data_type, text)?;
        let update = MeasurementUpdate {
            unit_id: unit.unit_id,
            block_type: block.block_type,
            address,
            measurement: meas.clone(),
            value,
        };
        apply_updates(&self.store, &[update], self.persister(&config).as_ref()).await;
        Ok(())
    }

    /// Current value of a control, with the unit multiplier reversed.
    pub fn current_control_value(&self, control_id: &str) -> Result<Option<Value>, ServerError> {
        let config = self.config();
        let Some((unit, block, address, meas)) = find_control(&config.units, control_id) else {
            return Ok(None);
        };
        let value = self
            .store
            .unit(unit.unit_id)
            .read_value(block.block_type, meas.data_type, address, meas.size())?;
        Ok(Some(meas.reverse_transforms(&value)))
    }
}

fn control_value(block_type: RegisterBlockType, data_type: ModbusDataType, text: &str) -> Result<Value, ServerError> {
    if block_type.is_bit_type() || data_type == ModbusDataType::Boolean {
        return Ok(Value::Bool(parse_boolean(text)));
    }
    match data_type {
        ModbusDataType::Bytes | ModbusDataType::StringAscii | ModbusDataType::StringUtf8 => {
            Ok(Value::String(text.to_string()))
        }
        _ => {
            let trimmed = text.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ServerError::InvalidData(format!("'{}' is not a number", text)))
        }
    }
}

async fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let address = config.socket_address();
    let bind_error = |source: std::io::Error| ServerError::Bind {
        address: address.clone(),
        source,
    };

    let socket_addr = lookup_host(address.as_str())
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address did not resolve",
            ))
        })?;

    let socket = match socket_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = socket.map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(socket_addr).map_err(bind_error)?;
    socket.listen(config.backlog).map_err(bind_error)
}

impl MeasurementListener for ModbusServer {
    fn on_measurement_captured(&self, source_id: &str, samples: &Map<String, Value>) {
        let config = self.config();
        if let Some(mode) = config.required_operational_mode.as_deref().filter(|m| !m.is_empty()) {
            let active = self
                .operational_modes
                .as_ref()
                .map(|modes| modes.is_mode_active(mode))
                .unwrap_or(false);
            if !active {
                debug!("Ignoring {} measurements: mode {} not active", source_id, mode);
                return;
            }
        }

        let updates = resolve_updates(&config.units, source_id, samples);
        if updates.is_empty() {
            return;
        }
        debug!("Queueing {} register update(s) from {}", updates.len(), source_id);
        if let Err(e) = self.bridge.submit(updates, self.persister(&config)) {
            warn!("Unable to queue register updates from {}: {}", source_id, e);
        }
    }
}
