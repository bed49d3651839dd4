//! TCP front end for simulated peripherals: one remote-protocol listener per
//! peripheral plus a portmapper resolving peripheral names to ports.

use super::Peripheral;
use crate::error::{result_code, Error};
use crate::protocol::{
    PeripheralStatus, RemoteRequest, RemoteResponse, MAX_REMOTE_PAYLOAD, OP_CLOSE, OP_OPEN,
    OP_RECV, OP_SEND, OP_TRANSACT, PORTMAP_GET_STATUS, PORTMAP_PING, PORTMAP_PONG,
};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One peripheral to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralSpec {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub config: String,
}

impl PeripheralSpec {
    pub fn new(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            config: String::new(),
        }
    }
}

/// Name to port table served by the portmapper.
#[derive(Debug, Default)]
pub struct PortRegistry {
    entries: RwLock<HashMap<String, PeripheralStatus>>,
}

impl PortRegistry {
    pub fn register(&self, name: &str, port: u16) {
        utils::write(&self.entries).insert(name.to_string(), PeripheralStatus { port, running: true });
    }

    /// `NoEnt` for an unregistered name.
    pub fn set_running(&self, name: &str, running: bool) -> crate::Result<()> {
        let mut entries = utils::write(&self.entries);
        let entry = entries.get_mut(name).ok_or(Error::NoEnt)?;
        entry.running = running;
        Ok(())
    }

    /// Port 0 reports an unknown name.
    pub fn lookup(&self, name: &str) -> PeripheralStatus {
        utils::read(&self.entries)
            .get(name)
            .copied()
            .unwrap_or(PeripheralStatus { port: 0, running: false })
    }
}

/// A running simulator. Dropping the handle leaves the tasks running until
/// the runtime stops; [`SimulatorHandle::shutdown`] ends them.
#[derive(Debug)]
pub struct SimulatorHandle {
    pub portmapper: SocketAddr,
    pub peripherals: Vec<(String, SocketAddr)>,
    registry: Arc<PortRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatorHandle {
    pub fn address_of(&self, name: &str) -> Option<SocketAddr> {
        self.peripherals
            .iter()
            .find(|(peripheral, _)| peripheral == name)
            .map(|(_, addr)| *addr)
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Binds the portmapper on `base_port` and each peripheral on the ports that
/// follow it; a `base_port` of 0 binds everything to ephemeral ports.
///
/// Must be called from within a tokio runtime.
pub async fn start(host: &str, base_port: u16, specs: &[PeripheralSpec]) -> io::Result<SimulatorHandle> {
    let registry = Arc::new(PortRegistry::default());
    let mut tasks = Vec::with_capacity(specs.len() + 1);
    let mut peripherals = Vec::with_capacity(specs.len());

    let portmap_listener = TcpListener::bind((host, base_port)).await?;
    let portmapper = portmap_listener.local_addr()?;
    info!("🗺️  portmapper listening on {}", portmapper);

    for (index, spec) in specs.iter().enumerate() {
        let port = if base_port == 0 {
            0
        } else {
            base_port
                .checked_add(1 + index as u16)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "port range exhausted"))?
        };

        let mut model = super::create(&spec.model)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", spec.model, e)))?;
        model
            .configure(&spec.config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", spec.name, e)))?;

        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        registry.register(&spec.name, addr.port());
        info!("🛰️  {} ({}) listening on {}", spec.name, spec.model, addr);

        let endpoint = Arc::new(Endpoint {
            name: spec.name.clone(),
            model: Mutex::new(model),
        });
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_peripheral(listener, endpoint).await {
                error!("peripheral server error: {}", e);
            }
        }));
        peripherals.push((spec.name.clone(), addr));
    }

    let portmap_registry = Arc::clone(&registry);
    tasks.push(tokio::spawn(async move {
        if let Err(e) = serve_portmapper(portmap_listener, portmap_registry).await {
            error!("portmapper error: {}", e);
        }
    }));

    Ok(SimulatorHandle {
        portmapper,
        peripherals,
        registry,
        tasks,
    })
}

struct Endpoint {
    name: String,
    model: Mutex<Box<dyn Peripheral>>,
}

async fn serve_peripheral(listener: TcpListener, endpoint: Arc<Endpoint>) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("🔗 {}: client {} connected", endpoint.name, addr);
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    if let Err(e) = handle_remote(stream, &endpoint).await {
                        warn!("{}: client {} error: {}", endpoint.name, addr, e);
                    }
                    debug!("🔌 {}: client {} disconnected", endpoint.name, addr);
                });
            }
            Err(e) => error!("{}: failed to accept connection: {}", endpoint.name, e),
        }
    }
}

async fn handle_remote(stream: TcpStream, endpoint: &Endpoint) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut opened = false;

    while let Some(request) = read_request(&mut reader).await? {
        let opcode = request.opcode();
        let response = match request {
            RemoteRequest::Open { config } => {
                let result = endpoint.model.lock().await.configure(&config);
                opened = result.is_ok();
                RemoteResponse::status(result_code(&result))
            }
            _ if !opened => RemoteResponse::status(Error::Illegal.code()),
            RemoteRequest::Close => {
                opened = false;
                RemoteResponse::default()
            }
            RemoteRequest::Send { data } => write_model(endpoint, &data).await,
            RemoteRequest::Recv { len } => RemoteResponse {
                data: endpoint.model.lock().await.read(len as usize),
                ..RemoteResponse::default()
            },
            RemoteRequest::Transact { delay_ms, recv_len, data } => {
                let mut response = if data.is_empty() {
                    RemoteResponse::default()
                } else {
                    write_model(endpoint, &data).await
                };
                if response.result == 0 && recv_len > 0 {
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
                    }
                    response.data = endpoint.model.lock().await.read(recv_len as usize);
                }
                response
            }
        };
        writer.write_all(&response.encode(opcode)).await?;
    }
    Ok(())
}

async fn write_model(endpoint: &Endpoint, data: &[u8]) -> RemoteResponse {
    match endpoint.model.lock().await.write(data) {
        Ok(written) => RemoteResponse {
            written: written as u32,
            ..RemoteResponse::default()
        },
        Err(e) => RemoteResponse::status(e.code()),
    }
}

/// `None` on a clean disconnect between requests.
async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<RemoteRequest>> {
    let opcode = match reader.read_u8().await {
        Ok(opcode) => opcode,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let request = match opcode {
        OP_OPEN => {
            let config = read_payload(reader).await?;
            RemoteRequest::Open {
                config: String::from_utf8(config)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            }
        }
        OP_CLOSE => RemoteRequest::Close,
        OP_SEND => RemoteRequest::Send {
            data: read_payload(reader).await?,
        },
        OP_RECV => RemoteRequest::Recv {
            len: checked_len(reader.read_u32().await?)?,
        },
        OP_TRANSACT => {
            let send_len = checked_len(reader.read_u32().await?)?;
            let delay_ms = reader.read_u32().await?;
            let recv_len = checked_len(reader.read_u32().await?)?;
            let mut data = vec![0u8; send_len as usize];
            reader.read_exact(&mut data).await?;
            RemoteRequest::Transact { delay_ms, recv_len, data }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown opcode {}", other),
            ))
        }
    };
    Ok(Some(request))
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = checked_len(reader.read_u32().await?)?;
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

fn checked_len(len: u32) -> io::Result<u32> {
    if len > MAX_REMOTE_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("length {} exceeds {}", len, MAX_REMOTE_PAYLOAD),
        ));
    }
    Ok(len)
}

async fn serve_portmapper(listener: TcpListener, registry: Arc<PortRegistry>) -> io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_portmap(stream, &registry).await {
                warn!("portmapper client {} error: {}", addr, e);
            }
        });
    }
}

async fn handle_portmap(stream: TcpStream, registry: &PortRegistry) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let opcode = match reader.read_u8().await {
            Ok(opcode) => opcode,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match opcode {
            PORTMAP_PING => writer.write_all(PORTMAP_PONG).await?,
            PORTMAP_GET_STATUS => {
                let name = read_payload(&mut reader).await?;
                let status = registry.lookup(&String::from_utf8_lossy(&name));
                writer.write_all(&status.encode()).await?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown portmapper opcode {}", other),
                ))
            }
        }
    }
}
