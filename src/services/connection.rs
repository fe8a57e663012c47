use async_trait::async_trait;
use log::{debug, log_enabled, trace, warn, Level};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::settings::ServerConfig;
use crate::modbus::frame::{decode_rtu_frame, read_tcp_frame, write_frame};
use crate::modbus::protocol::{ModbusException, ModbusFrame, ModbusRequest, ModbusResponse};
use crate::modbus::types::{ExceptionCode, RegisterBlockType};
use crate::registers::RegisterStore;
use crate::utils::error::ServerError;

pub const WIRE_LOG_TARGET: &str = "modbus_server::wire";

/// Notified after a client write has been applied to the register store.
#[async_trait]
pub trait RegisterWriteListener: Send + Sync {
    async fn registers_written(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, values: &[u16]);
}

/// Serves Modbus requests for one client connection.
pub struct ConnectionHandler {
    id: Uuid,
    peer: String,
    config: Arc<ServerConfig>,
    store: RegisterStore,
    write_listener: Option<Arc<dyn RegisterWriteListener>>,
    last_request: Option<Instant>,
}

impl ConnectionHandler {
    pub fn new(peer: impl Into<String>, config: Arc<ServerConfig>, store: RegisterStore) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            config,
            store,
            write_listener: None,
            last_request: None,
        }
    }

    pub fn with_write_listener(mut self, listener: Arc<dyn RegisterWriteListener>) -> Self {
        self.write_listener = Some(listener);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request/response loop until EOF, an I/O error, or the task is aborted.
    pub async fn run<S>(mut self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("🔗 Modbus connection {} opened from {}", self.id, self.peer);

        loop {
            let request = match read_tcp_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Modbus connection {} closed by {}", self.id, self.peer);
                    break;
                }
                Err(e) => {
                    warn!("Communication error on Modbus connection {} from {}: {}", self.id, self.peer, e);
                    break;
                }
            };

            self.throttle().await;

            let response = self.handle_frame(&request).await;
            self.log_wire(&request, &response);

            if let Err(e) = write_frame(&mut stream, &response).await {
                warn!("Error writing Modbus response to {}: {}", self.peer, e);
                break;
            }
        }

        let _ = stream.shutdown().await;
    }

    /// Sleep out the rest of the minimum interval since this connection's
    /// previous request.
    async fn throttle(&mut self) {
        if let (Some(min_interval), Some(last)) = (self.config.request_throttle(), self.last_request) {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let delay = min_interval - elapsed;
                trace!("Throttling request from {} by {}ms", self.peer, delay.as_millis());
                sleep(delay).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    fn log_wire(&self, request: &ModbusFrame, response: &ModbusFrame) {
        if self.config.wire_logging && log_enabled!(target: WIRE_LOG_TARGET, Level::Trace) {
            trace!(target: WIRE_LOG_TARGET, "{} >> {}", self.peer, hex::encode(request.to_bytes()));
            trace!(target: WIRE_LOG_TARGET, "{} << {}", self.peer, hex::encode(response.to_bytes()));
        }
    }

    /// Answer one framed request; the reply mirrors the request header.
    pub async fn handle_frame(&self, request: &ModbusFrame) -> ModbusFrame {
        let pdu = self.process(request.unit_id(), &request.pdu).await;
        request.reply(pdu)
    }

    /// Answer one RTU frame (`unit | PDU | CRC`), returning the RTU reply.
    pub async fn handle_rtu_frame(&self, bytes: &[u8]) -> Result<Vec<u8>, ServerError> {
        let request = decode_rtu_frame(bytes)?;
        let response = self.handle_frame(&request).await;
        self.log_wire(&request, &response);
        Ok(response.to_bytes())
    }

    async fn process(&self, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let request = match ModbusRequest::from_pdu(pdu) {
            Ok(request) => request,
            Err(exception) => {
                debug!(
                    "Rejecting request from {} for unit {}: {:?}",
                    self.peer, unit_id, exception.code
                );
                return exception.to_pdu();
            }
        };
        let function = request.function_code().code();

        if self.config.restrict_unit_ids && self.config.unit(unit_id).is_none() {
            debug!("Request from {} for unconfigured unit {}", self.peer, unit_id);
            return ModbusException::new(function, ExceptionCode::GatewayTargetDeviceFailedToRespond).to_pdu();
        }

        if request.is_write() && !self.config.allow_writes {
            debug!("Write function {} from {} rejected: writes not allowed", function, self.peer);
            return ModbusException::new(function, ExceptionCode::IllegalFunction).to_pdu();
        }

        if self.config.restrict_addresses {
            let (start, count) = request.address_range();
            let covered = self
                .config
                .unit(unit_id)
                .map(|unit| unit.covers(request.block_type(), start, count))
                .unwrap_or(false);
            if !covered {
                return ModbusException::new(function, ExceptionCode::IllegalDataAddress).to_pdu();
            }
        }

        match self.execute(unit_id, request).await {
            Ok(response) => response.to_pdu(),
            Err(e) => {
                warn!("Error handling Modbus function {} for unit {}: {}", function, unit_id, e);
                let code = match e {
                    ServerError::InvalidData(_) => ExceptionCode::IllegalDataAddress,
                    _ => ExceptionCode::ServerDeviceFailure,
                };
                ModbusException::new(function, code).to_pdu()
            }
        }
    }

    async fn execute(&self, unit_id: u8, request: ModbusRequest) -> Result<ModbusResponse, ServerError> {
        let unit = self.store.unit(unit_id);
        let response = match request {
            ModbusRequest::ReadCoils { address, quantity } => {
                ModbusResponse::ReadCoils(unit.read_bits(RegisterBlockType::Coil, address, quantity)?)
            }
            ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                ModbusResponse::ReadDiscreteInputs(unit.read_bits(RegisterBlockType::Discrete, address, quantity)?)
            }
            ModbusRequest::ReadHoldingRegisters { address, quantity } => {
                ModbusResponse::ReadHoldingRegisters(unit.read_words(RegisterBlockType::Holding, address, quantity)?)
            }
            ModbusRequest::ReadInputRegisters { address, quantity } => {
                ModbusResponse::ReadInputRegisters(unit.read_words(RegisterBlockType::Input, address, quantity)?)
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                unit.write_bit(RegisterBlockType::Coil, address, value)?;
                self.notify(unit_id, RegisterBlockType::Coil, address, &[value as u16]).await;
                ModbusResponse::WriteSingleCoil { address, value }
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                unit.write_words(RegisterBlockType::Holding, address, &[value])?;
                self.notify(unit_id, RegisterBlockType::Holding, address, &[value]).await;
                ModbusResponse::WriteSingleRegister { address, value }
            }
            ModbusRequest::WriteMultipleCoils { address, values } => {
                unit.write_bits(RegisterBlockType::Coil, address, &values)?;
                let words: Vec<u16> = values.iter().map(|b| *b as u16).collect();
                self.notify(unit_id, RegisterBlockType::Coil, address, &words).await;
                ModbusResponse::WriteMultipleCoils {
                    address,
                    quantity: values.len() as u16,
                }
            }
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                unit.write_words(RegisterBlockType::Holding, address, &values)?;
                self.notify(unit_id, RegisterBlockType::Holding, address, &values).await;
                ModbusResponse::WriteMultipleRegisters {
                    address,
                    quantity: values.len() as u16,
                }
            }
        };
        Ok(response)
    }

    async fn notify(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, values: &[u16]) {
        if let Some(listener) = &self.write_listener {
            listener.registers_written(unit_id, block_type, address, values).await;
        }
    }
}
