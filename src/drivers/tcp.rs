use crate::channel::{ChannelId, ChannelInfo, ChannelParams, DriverApi, Operations};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::utils;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};

#[derive(Debug)]
struct Link {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

/// Raw byte stream over a TCP connection per channel.
///
/// Reader and writer halves are locked separately, matching the channel's
/// independent send and recv locks.
#[derive(Debug, Default)]
pub struct TcpDriver {
    links: RwLock<HashMap<ChannelId, Arc<Link>>>,
}

impl TcpDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, channel: ChannelId) -> Result<Arc<Link>> {
        utils::read(&self.links).get(&channel).cloned().ok_or(Error::Illegal)
    }
}

impl DriverApi for TcpDriver {
    fn name(&self) -> &str {
        "tcp"
    }

    fn operations(&self) -> Operations {
        Operations::SEND | Operations::RECV
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        matches!(params, ChannelParams::Tcp { .. })
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        let ChannelParams::Tcp { host, port } = &channel.config().params else {
            return Err(Error::Illegal);
        };

        let timeout = channel.config().transaction_timeout;
        let stream = TcpStream::connect((host.as_str(), *port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = stream.try_clone()?;

        utils::write(&self.links).insert(
            channel.id(),
            Arc::new(Link {
                reader: Mutex::new(reader),
                writer: Mutex::new(stream),
            }),
        );
        debug!("{}: connected to {}:{}", channel.name(), host, port);
        Ok(())
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        if let Some(link) = utils::write(&self.links).remove(&channel.id()) {
            let stream = utils::lock(&link.writer);
            // Peer may already be gone.
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let link = self.link(channel.id())?;
        let mut stream = utils::lock(&link.writer);
        let data = frame.take_data(count)?;
        stream.write_all(data)?;
        trace!("{}: sent {} bytes", channel.name(), count);
        Ok(())
    }

    /// Returns after the first read that yields data; a closed peer is an
    /// error.
    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let link = self.link(channel.id())?;
        let mut stream = utils::lock(&link.reader);
        let space = count.min(frame.available_space());
        let n = stream.read(&mut frame.unwritten_mut()[..space])?;
        if n == 0 {
            return Err(Error::Error);
        }
        frame.advance(n as isize)?;
        trace!("{}: received {} bytes", channel.name(), n);
        Ok(())
    }
}
