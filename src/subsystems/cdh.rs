//! Command and data handling: authenticates uplinked command frames,
//! routes them to their subsystem and downlinks the responses.

use super::{
    CommandDescriptor, CommandSpec, CommandTable, Subsystem, SubsystemConfig, SubsystemCore, SubsystemId,
};
use crate::channel::Channel;
use crate::error::{result_code, Error, Result};
use crate::frame::{self, Frame, FrameFlags};
use crate::frame_pool::FramePool;
use crate::nvram::Nvram;
use crate::platform::Platform;
use crate::protocol::{self, LinkDeframer, BEACON_SEQUENCE, COMMAND_HEADER_SIZE, MAX_SEQUENCE_NUMBER, SEQUENCE_SIZE};
use crate::utils;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const CMD_GET_SEQUENCE: u8 = 0;
pub const CMD_RESET_SEQUENCE: u8 = 1;
pub const CMD_SET_MAC_KEY: u8 = 2;
pub const CMD_PING: u8 = 3;

pub const MAX_MAC_KEY: usize = 32;

pub struct CdhSubsystem {
    core: SubsystemCore,
    uplink: Arc<Channel>,
    downlink: Arc<Channel>,
    pool: Arc<FramePool>,
    nvram: Arc<Nvram>,
    beacon_interval: Option<Duration>,
    last_beacon: Mutex<Instant>,
    deframer: Mutex<LinkDeframer>,
}

static COMMANDS: [Option<CommandSpec<CdhSubsystem>>; 4] = [
    Some(CommandSpec::new(
        "get_sequence",
        "Last accepted uplink sequence number",
        "",
        "sequence:u24",
        CdhSubsystem::cmd_get_sequence,
    )),
    Some(CommandSpec::new(
        "reset_sequence",
        "Accept any sequence number again",
        "",
        "",
        CdhSubsystem::cmd_reset_sequence,
    )),
    Some(CommandSpec::new(
        "set_mac_key",
        "Replace the uplink authentication key",
        "key:bytes[1..32]",
        "",
        CdhSubsystem::cmd_set_mac_key,
    )),
    Some(CommandSpec::new(
        "ping",
        "Echo the payload back",
        "data:bytes",
        "data:bytes",
        CdhSubsystem::cmd_ping,
    )),
];
static COMMAND_TABLE: CommandTable<CdhSubsystem> = CommandTable::new(&COMMANDS);

impl CdhSubsystem {
    pub fn new(
        uplink: Arc<Channel>,
        downlink: Arc<Channel>,
        pool: Arc<FramePool>,
        nvram: Arc<Nvram>,
        beacon_interval: Option<Duration>,
    ) -> Self {
        let deframer = LinkDeframer::new(pool.frame_size());
        Self {
            core: SubsystemCore::new(SubsystemConfig::new(SubsystemId::Cdh).priority(4)),
            uplink,
            downlink,
            pool,
            nvram,
            beacon_interval,
            last_beacon: Mutex::new(Instant::now()),
            deframer: Mutex::new(deframer),
        }
    }

    /// Authenticates the command frame in `iframe` (readable from its MAC
    /// field), routes it and writes the response into `oframe`.
    ///
    /// Header failures return their error and leave `oframe` untouched:
    /// short frame or reserved sequence `Illegal`, bad MAC `Perm`, replayed
    /// sequence `Nack`, unknown subsystem `NoEnt`. Once the header passes,
    /// the command's own result travels in the response and `Ok` is
    /// returned; a failed command's output is dropped.
    pub fn process_uplink(&self, platform: &Platform, iframe: &mut Frame, oframe: &mut Frame) -> Result<()> {
        if !iframe.has_enough_data(COMMAND_HEADER_SIZE) {
            return Err(Error::Illegal);
        }
        let mac = iframe.get_u24_unchecked();
        let sequence = iframe.get_u24_unchecked();

        // The tag covers everything after itself, sequence included.
        iframe.advance(-(SEQUENCE_SIZE as isize))?;
        let verified = self.nvram.read(|data| iframe.verify_mac(mac, sequence, &data.mac_key));
        iframe.advance(SEQUENCE_SIZE as isize)?;
        verified?;

        if sequence > MAX_SEQUENCE_NUMBER {
            return Err(Error::Illegal);
        }
        if sequence <= self.nvram.read(|data| data.last_sequence_number) {
            debug!("replayed sequence {}", sequence);
            return Err(Error::Nack);
        }
        iframe.set_flags(FrameFlags::IS_TRUSTED);

        let ssid = iframe.get_u8()?;
        let target = SubsystemId::from_code(ssid)?;
        self.nvram.save(|data| data.last_sequence_number = sequence);

        oframe.put_u24(sequence)?;
        oframe.put_u8(ssid)?;
        let result_at = oframe.position();
        oframe.put_u8(0)?;

        let result = platform.route_command(target, iframe, oframe, sequence);
        trace!("command {} for {}: {:?}", sequence, target, result);

        let output = oframe.position() - result_at - 1;
        oframe.advance(-((output + 1) as isize))?;
        oframe.put_u8(result_code(&result))?;
        if result.is_ok() {
            oframe.advance(output as isize)?;
        }
        Ok(())
    }

    /// Drains what the uplink has and answers every complete link record
    /// in it. Partial records wait for the next period.
    fn receive_and_answer(&self, platform: &Platform) -> Result<()> {
        let mut chunk = self.pool.allocate()?;
        match self.uplink.recv(&mut chunk, None) {
            Ok(()) => {}
            Err(Error::Timeout) => return Ok(()),
            Err(e) => return Err(e),
        }
        let mut deframer = utils::lock(&self.deframer);
        deframer.push(chunk.written());
        drop(chunk);

        while let Some(record) = deframer.next_record() {
            match record {
                Ok(record) => self.answer(platform, &record)?,
                Err(e) => warn!("📡 oversized uplink record dropped: {}", e),
            }
        }
        Ok(())
    }

    /// Processes one uplinked command frame; the response, if any, goes
    /// down as a link record of its own.
    fn answer(&self, platform: &Platform, record: &[u8]) -> Result<()> {
        let mut iframe = self.pool.allocate()?;
        iframe.put_bytes(record)?;
        iframe.reset_for_reading();

        let mut oframe = self.pool.allocate()?;
        match protocol::write_link_record(&mut oframe, |out| self.process_uplink(platform, &mut iframe, out)) {
            Ok(()) => {
                oframe.reset_for_reading();
                self.downlink.send(&mut oframe, None)
            }
            Err(e) => {
                warn!("📡 uplink frame rejected: {}", e);
                Ok(())
            }
        }
    }

    /// `[BEACON_SEQUENCE:3][SSID:1][RESULT:1][mode:1][uptime_ms:4][boot_count:4]`
    /// in a link record.
    fn send_beacon(&self, platform: &Platform) -> Result<()> {
        let mut beacon = self.pool.allocate()?;
        protocol::write_link_record(&mut beacon, |out| {
            out.put_u24(BEACON_SEQUENCE)?;
            out.put_u8(SubsystemId::Cdh.code())?;
            out.put_u8(0)?;
            out.put_u8(platform.current_mode().code())?;
            out.put_u32(utils::uptime_ms() as u32)?;
            out.put_u32(self.nvram.read(|data| data.boot_count))
        })?;
        beacon.reset_for_reading();
        self.downlink.send(&mut beacon, None)
    }

    fn beacon_due(&self) -> bool {
        let Some(interval) = self.beacon_interval else {
            return false;
        };
        let mut last = utils::lock(&self.last_beacon);
        if last.elapsed() < interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    fn cmd_get_sequence(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        oframe.put_u24(self.nvram.read(|data| data.last_sequence_number))
    }

    fn cmd_reset_sequence(&self, _iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        self.nvram.save(|data| data.last_sequence_number = 0);
        Ok(())
    }

    fn cmd_set_mac_key(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        if !iframe.is_trusted() {
            return Err(Error::Perm);
        }
        let len = iframe.available_data();
        if len == 0 || len > MAX_MAC_KEY {
            return Err(Error::Illegal);
        }
        let key = iframe.take_data(len)?.to_vec();
        self.nvram.save(|data| data.mac_key = key);
        Ok(())
    }

    fn cmd_ping(&self, iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        frame::transfer(oframe, iframe)
    }
}

impl Subsystem for CdhSubsystem {
    fn core(&self) -> &SubsystemCore {
        &self.core
    }

    fn execute_command(&self, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        COMMAND_TABLE.execute(self, iframe, oframe, sequence)
    }

    fn describe(&self) -> Vec<CommandDescriptor> {
        COMMAND_TABLE.describe()
    }

    fn periodic(&self, platform: &Platform) -> Result<()> {
        let answered = self.receive_and_answer(platform);
        if let Err(e) = self.nvram.flush() {
            warn!("nvram flush failed: {}", e);
        }
        if self.beacon_due() {
            self.send_beacon(platform)?;
        }
        answered
    }
}
