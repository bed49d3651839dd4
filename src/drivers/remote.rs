use crate::channel::{ChannelId, ChannelInfo, ChannelParams, DriverApi, Operations, Transfer};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::protocol::{self, PeripheralStatus, RemoteRequest, RemoteResponse, PORTMAP_PING, PORTMAP_PONG};
use crate::utils;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = (host, port).to_socket_addrs()?.next().ok_or(Error::NoEnt)?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

/// Copies as much of `data` as the frame and `count` allow; `Partial` if
/// the peripheral returned more than that.
fn store(channel: &ChannelInfo, frame: &mut Frame, count: usize, data: &[u8]) -> Result<()> {
    let n = data.len().min(count).min(frame.available_space());
    frame.put_bytes(&data[..n])?;
    if n < data.len() {
        warn!("{}: dropped {} surplus bytes from peripheral", channel.name(), data.len() - n);
        return Err(Error::Partial);
    }
    Ok(())
}

/// Client side of the portmapper protocol.
#[derive(Debug)]
pub struct PortmapClient {
    stream: TcpStream,
}

impl PortmapClient {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            stream: connect(host, port, timeout)?,
        })
    }

    /// `Nack` unless the server answers with the expected pong.
    pub fn ping(&mut self) -> Result<()> {
        self.stream.write_all(&[PORTMAP_PING])?;
        let mut reply = [0u8; PORTMAP_PONG.len()];
        self.stream.read_exact(&mut reply)?;
        if &reply != PORTMAP_PONG {
            return Err(Error::Nack);
        }
        Ok(())
    }

    pub fn get_status(&mut self, name: &str) -> Result<PeripheralStatus> {
        self.stream.write_all(&protocol::encode_get_status(name))?;
        let mut reply = [0u8; PeripheralStatus::SIZE];
        self.stream.read_exact(&mut reply)?;
        Ok(PeripheralStatus::decode(reply))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Direct,
    Portmapped,
}

/// Talks the remote-channel protocol to a simulated peripheral.
///
/// Every primitive is a single request/response exchange, so the driver
/// implements send, recv and transact natively. One connection per channel,
/// held under a lock for the duration of an exchange.
#[derive(Debug)]
pub struct RemoteDriver {
    target: Target,
    links: RwLock<HashMap<ChannelId, Arc<Mutex<TcpStream>>>>,
}

impl RemoteDriver {
    /// For channels with [`ChannelParams::Remote`].
    pub fn new() -> Self {
        Self {
            target: Target::Direct,
            links: RwLock::new(HashMap::new()),
        }
    }

    /// For channels with [`ChannelParams::Portmapped`]: the peripheral's port
    /// is resolved by name when the channel opens.
    pub fn portmapped() -> Self {
        Self {
            target: Target::Portmapped,
            links: RwLock::new(HashMap::new()),
        }
    }

    fn link(&self, channel: ChannelId) -> Result<Arc<Mutex<TcpStream>>> {
        utils::read(&self.links).get(&channel).cloned().ok_or(Error::Illegal)
    }

    fn exchange(&self, channel: &ChannelInfo, request: &RemoteRequest, delay: Duration) -> Result<RemoteResponse> {
        let link = self.link(channel.id())?;
        let mut stream = utils::lock(&link);
        stream.set_read_timeout(Some(channel.config().transaction_timeout + delay))?;
        let response = protocol::call(&mut *stream, request)?;
        Error::from_code(response.result)?;
        Ok(response)
    }

    /// `(host, port, config)` of the peripheral behind `params`.
    fn resolve(&self, params: &ChannelParams, timeout: Duration) -> Result<(String, u16, String)> {
        match (self.target, params) {
            (Target::Direct, ChannelParams::Remote { host, port, config }) => {
                Ok((host.clone(), *port, config.clone()))
            }
            (
                Target::Portmapped,
                ChannelParams::Portmapped {
                    host,
                    portmapper_port,
                    name,
                    config,
                },
            ) => {
                let status = PortmapClient::connect(host, *portmapper_port, timeout)?.get_status(name)?;
                if status.port == 0 {
                    warn!("portmapper {}:{} does not know {}", host, portmapper_port, name);
                    return Err(Error::NoEnt);
                }
                if !status.running {
                    return Err(Error::Busy);
                }
                Ok((host.clone(), status.port, config.clone()))
            }
            _ => Err(Error::Illegal),
        }
    }

    fn poll_recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize, deadline: Instant) -> Result<()> {
        let len = count.min(frame.available_space()) as u32;
        loop {
            let response = self.exchange(channel, &RemoteRequest::Recv { len }, Duration::ZERO)?;
            if !response.data.is_empty() {
                return store(channel, frame, count, &response.data);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Default for RemoteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverApi for RemoteDriver {
    fn name(&self) -> &str {
        match self.target {
            Target::Direct => "remote",
            Target::Portmapped => "portmapped",
        }
    }

    fn operations(&self) -> Operations {
        Operations::SEND | Operations::RECV | Operations::TRANSACT
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        match self.target {
            Target::Direct => matches!(params, ChannelParams::Remote { .. }),
            Target::Portmapped => matches!(params, ChannelParams::Portmapped { .. }),
        }
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        let timeout = channel.config().transaction_timeout;
        let (host, port, config) = self.resolve(&channel.config().params, timeout)?;

        let mut stream = connect(&host, port, timeout)?;
        let response = protocol::call(&mut stream, &RemoteRequest::Open { config })?;
        Error::from_code(response.result)?;

        utils::write(&self.links).insert(channel.id(), Arc::new(Mutex::new(stream)));
        debug!("{}: remote peripheral at {}:{}", channel.name(), host, port);
        Ok(())
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        let result = self
            .exchange(channel, &RemoteRequest::Close, Duration::ZERO)
            .map(|_| ());
        utils::write(&self.links).remove(&channel.id());
        result
    }

    /// `Partial` if the peripheral took fewer than `count` bytes; the frame
    /// advances past what it took.
    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let data = frame.unread().get(..count).ok_or(Error::NoSpace)?.to_vec();
        let response = self.exchange(channel, &RemoteRequest::Send { data }, Duration::ZERO)?;
        let written = (response.written as usize).min(count);
        frame.advance(written as isize)?;
        trace!("{}: peripheral took {} of {} bytes", channel.name(), written, count);
        if written < count {
            return Err(Error::Partial);
        }
        Ok(())
    }

    /// Polls until the peripheral has data or the transaction timeout ends.
    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let deadline = Instant::now() + channel.config().transaction_timeout;
        self.poll_recv(channel, frame, count, deadline)
    }

    fn transact(
        &self,
        channel: &ChannelInfo,
        send: Option<Transfer<'_>>,
        delay: Duration,
        recv: Option<Transfer<'_>>,
    ) -> Result<()> {
        let data = match &send {
            Some(out) => out.frame.unread().get(..out.count).ok_or(Error::NoSpace)?.to_vec(),
            None => Vec::new(),
        };
        let recv_len = recv
            .as_ref()
            .map_or(0, |input| input.count.min(input.frame.available_space()));
        let request = RemoteRequest::Transact {
            delay_ms: delay.as_millis().min(u128::from(u32::MAX)) as u32,
            recv_len: recv_len as u32,
            data,
        };

        let started = Instant::now();
        let response = self.exchange(channel, &request, delay)?;
        if let Some(out) = send {
            let written = (response.written as usize).min(out.count);
            out.frame.advance(written as isize)?;
            if written < out.count {
                return Err(Error::Partial);
            }
        }

        match recv {
            Some(input) if response.data.is_empty() => {
                let deadline = started + delay + channel.config().transaction_timeout;
                self.poll_recv(channel, input.frame, input.count, deadline)
            }
            Some(input) => store(channel, input.frame, input.count, &response.data),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelDriver};
    use crate::protocol::{OP_OPEN, OP_RECV};
    use std::net::TcpListener;

    /// Serves one connection that acknowledges OPEN and answers every RECV
    /// with `reply`, whatever length was asked for.
    fn oversupplying_peripheral(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut opcode = [0u8; 1];
            while stream.read_exact(&mut opcode).is_ok() {
                let mut len = [0u8; 4];
                stream.read_exact(&mut len).unwrap();
                let response = match opcode[0] {
                    OP_OPEN => {
                        let mut config = vec![0u8; u32::from_be_bytes(len) as usize];
                        stream.read_exact(&mut config).unwrap();
                        RemoteResponse::status(0)
                    }
                    OP_RECV => RemoteResponse {
                        data: reply.to_vec(),
                        ..RemoteResponse::default()
                    },
                    _ => RemoteResponse::status(Error::Illegal.code()),
                };
                stream.write_all(&response.encode(opcode[0])).unwrap();
            }
        });
        port
    }

    #[test]
    fn test_surplus_reply_is_partial() {
        let port = oversupplying_peripheral(b"abcdefgh");
        let driver = Arc::new(ChannelDriver::new(RemoteDriver::new()));
        driver.initialize().unwrap();
        let channel = Channel::builder("greedy", driver)
            .params(ChannelParams::Remote {
                host: "127.0.0.1".into(),
                port,
                config: String::new(),
            })
            .build()
            .unwrap();
        channel.open().unwrap();

        let mut input = Frame::with_capacity(4);
        assert_eq!(channel.recv(&mut input, None).unwrap_err(), Error::Partial);
        assert_eq!(input.written(), b"abcd");
    }
}
