#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

use modbus_register_server::modbus::{read_tcp_frame, write_frame, ModbusFrame};
use modbus_register_server::services::{ScheduledFuture, ScheduledTask, TaskScheduler};
use modbus_register_server::{
    MeasurementConfig, ModbusDataType, ModbusServer, RegisterBlockConfig, RegisterBlockType, ServerConfig, UnitConfig,
};

/// Minimal Modbus TCP client speaking through the crate's own framing.
pub struct TestClient {
    stream: TcpStream,
    transaction_id: u16,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            transaction_id: 0,
        }
    }

    /// Send a request PDU and return the response PDU.
    pub async fn request(&mut self, unit_id: u8, pdu: Vec<u8>) -> Vec<u8> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let request = ModbusFrame::tcp(self.transaction_id, unit_id, pdu);
        write_frame(&mut self.stream, &request).await.unwrap();
        let response = read_tcp_frame(&mut self.stream).await.unwrap().expect("connection closed");
        assert_eq!(response.header, request.reply(response.pdu.clone()).header);
        response.pdu
    }

    pub async fn read_holding(&mut self, unit_id: u8, address: u16, quantity: u16) -> Vec<u8> {
        let mut pdu = vec![0x03];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        self.request(unit_id, pdu).await
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Scheduler that records tasks and runs them only when asked.
#[derive(Default)]
pub struct RecordingScheduler {
    tasks: Mutex<Vec<(Duration, Arc<AtomicBool>, Option<ScheduledFuture>)>>,
}

impl RecordingScheduler {
    pub fn delays(&self) -> Vec<Duration> {
        self.tasks.lock().unwrap().iter().map(|(d, _, _)| *d).collect()
    }

    /// Run the oldest task that has not run yet and was not cancelled.
    pub async fn run_next(&self) -> bool {
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks
                .iter_mut()
                .find(|(_, cancelled, task)| task.is_some() && !cancelled.load(Ordering::SeqCst))
                .and_then(|(_, _, task)| task.take())
        };
        match task {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledFuture) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks
            .lock()
            .unwrap()
            .push((delay, cancelled.clone(), Some(task)));
        ScheduledTask::new(cancelled, None)
    }
}

pub fn meter_config() -> ServerConfig {
    ServerConfig {
        uid: Some("meter-server".to_string()),
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        request_throttle_ms: 0,
        units: vec![UnitConfig::new(1)
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Holding, 0)
                    .with_measurement(MeasurementConfig::new("meter/1", "watts", ModbusDataType::Int16))
                    .with_measurement(MeasurementConfig::new("meter/1", "wattHours", ModbusDataType::UInt32)),
            )
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Coil, 0)
                    .with_measurement(MeasurementConfig::new("relay/1", "on", ModbusDataType::Boolean)),
            )],
        ..Default::default()
    }
}

pub async fn start_server(server: &ModbusServer) -> SocketAddr {
    server.start().await.unwrap();
    server.local_addr().await.unwrap()
}
