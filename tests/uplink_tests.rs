use satcore::board::Board;
use satcore::channel::ChannelId;
use satcore::config::BoardConfig;
use satcore::drivers::MemoryDriver;
use satcore::error::Error;
use satcore::frame::Frame;
use satcore::nvram::DEFAULT_MAC_KEY;
use satcore::platform::Platform;
use satcore::protocol::{self, decode_response, link_record, LinkDeframer, BEACON_SEQUENCE, MAX_SEQUENCE_NUMBER};
use satcore::subsystems::{cdh, platform as platform_ss, CdhSubsystem, SatelliteMode, SubsystemId};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> BoardConfig {
    let mut config = BoardConfig::default();
    config.platform.period_ms = 10;
    config.platform.mode_change_timeout_ms = 1000;
    config.platform.heartbeat_window_ms = 200;
    config
}

fn command(key: &[u8], sequence: u32, ssid: SubsystemId, cmd: u8, payload: &[u8]) -> Frame {
    let mut frame = Frame::with_capacity(64);
    protocol::encode_command(&mut frame, key, sequence, ssid.code(), cmd, payload).unwrap();
    frame
}

/// A booted default board plus the handles a ground station would use.
struct Station {
    board: Board,
    platform: Arc<Platform>,
    link: MemoryDriver,
    uplink: ChannelId,
    downlink: ChannelId,
    deframer: Mutex<LinkDeframer>,
}

impl Station {
    fn boot(config: BoardConfig) -> Self {
        let board = Board::new(config).unwrap();
        let platform = board.boot().unwrap();
        let link = board.memory_driver("loopback").unwrap();
        let uplink = board.channel("uplink").unwrap().id();
        let downlink = board.channel("downlink").unwrap().id();
        Self {
            board,
            platform,
            link,
            uplink,
            downlink,
            deframer: Mutex::new(LinkDeframer::new(1024)),
        }
    }

    fn uplink(&self, frame: &Frame) {
        self.uplink_burst(&[frame]);
    }

    /// Every frame as a link record, all in one write.
    fn uplink_burst(&self, frames: &[&Frame]) {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend(link_record(frame.unread()).unwrap());
        }
        self.link.inject(self.uplink, &bytes).unwrap();
    }

    /// Waits up to `timeout` for the next downlinked record.
    fn downlink(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut deframer = self.deframer.lock().unwrap();
        loop {
            deframer.push(&self.link.drain(self.downlink).unwrap());
            if let Some(record) = deframer.next_record() {
                return Some(record.unwrap());
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn exchange(&self, frame: &Frame) -> Frame {
        self.uplink(frame);
        let bytes = self.downlink(Duration::from_secs(2)).unwrap();
        Frame::from_slice(&bytes)
    }

    fn stop(self) {
        self.platform.shutdown().unwrap();
        self.board.power_down().unwrap();
    }
}

#[cfg(test)]
mod uplink_tests {
    use super::*;

    #[test]
    fn test_get_mode_round_trip() {
        let station = Station::boot(fast_config());
        let mut response = station.exchange(&command(
            DEFAULT_MAC_KEY,
            1,
            SubsystemId::Platform,
            platform_ss::CMD_GET_MODE,
            &[],
        ));

        let header = decode_response(&mut response).unwrap();
        assert_eq!(header.sequence, 1);
        assert_eq!(header.ssid, SubsystemId::Platform.code());
        assert_eq!(header.result, Ok(()));
        assert_eq!(response.get_u8().unwrap(), SatelliteMode::Mission.code());
        assert_eq!(response.available_data(), 0);
        station.stop();
    }

    #[test]
    fn test_replayed_and_forged_frames_get_no_answer() {
        let station = Station::boot(fast_config());
        let ping = |seq| command(DEFAULT_MAC_KEY, seq, SubsystemId::Cdh, cdh::CMD_PING, b"hi");

        let mut first = station.exchange(&ping(10));
        assert_eq!(decode_response(&mut first).unwrap().result, Ok(()));
        assert_eq!(first.unread(), b"hi");

        station.uplink(&ping(10));
        assert!(station.downlink(Duration::from_millis(150)).is_none());
        station.uplink(&ping(3));
        assert!(station.downlink(Duration::from_millis(150)).is_none());
        station.uplink(&command(b"wrong-key", 11, SubsystemId::Cdh, cdh::CMD_PING, b"hi"));
        assert!(station.downlink(Duration::from_millis(150)).is_none());

        // The sequence is stored before the command runs.
        let mut seq = station.exchange(&command(
            DEFAULT_MAC_KEY,
            11,
            SubsystemId::Cdh,
            cdh::CMD_GET_SEQUENCE,
            &[],
        ));
        decode_response(&mut seq).unwrap();
        assert_eq!(seq.get_u24().unwrap(), 11);
        station.stop();
    }

    #[test]
    fn test_back_to_back_commands_are_all_answered() {
        let station = Station::boot(fast_config());
        let first = command(DEFAULT_MAC_KEY, 1, SubsystemId::Cdh, cdh::CMD_PING, b"one");
        let second = command(DEFAULT_MAC_KEY, 2, SubsystemId::Cdh, cdh::CMD_PING, b"two");
        station.uplink_burst(&[&first, &second]);

        for (sequence, echo) in [(1, b"one"), (2, b"two")] {
            let bytes = station.downlink(Duration::from_secs(2)).unwrap();
            let mut response = Frame::from_slice(&bytes);
            let header = decode_response(&mut response).unwrap();
            assert_eq!(header.sequence, sequence);
            assert_eq!(header.result, Ok(()));
            assert_eq!(response.unread(), echo);
        }
        station.stop();
    }

    #[test]
    fn test_uplink_record_split_across_periods() {
        let station = Station::boot(fast_config());
        let ping = command(DEFAULT_MAC_KEY, 1, SubsystemId::Cdh, cdh::CMD_PING, b"split");
        let bytes = link_record(ping.unread()).unwrap();

        station.link.inject(station.uplink, &bytes[..4]).unwrap();
        assert!(station.downlink(Duration::from_millis(100)).is_none());
        station.link.inject(station.uplink, &bytes[4..]).unwrap();

        let mut response = Frame::from_slice(&station.downlink(Duration::from_secs(2)).unwrap());
        assert_eq!(decode_response(&mut response).unwrap().sequence, 1);
        assert_eq!(response.unread(), b"split");
        station.stop();
    }

    #[test]
    fn test_set_mode_over_the_uplink() {
        let station = Station::boot(fast_config());
        let mut response = station.exchange(&command(
            DEFAULT_MAC_KEY,
            1,
            SubsystemId::Platform,
            platform_ss::CMD_SET_MODE,
            &[SatelliteMode::LowPower.code()],
        ));
        assert_eq!(decode_response(&mut response).unwrap().result, Ok(()));

        let deadline = Instant::now() + Duration::from_secs(2);
        while station.platform.current_mode() != SatelliteMode::LowPower && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(station.platform.current_mode(), SatelliteMode::LowPower);
        assert_eq!(
            station.board.nvram().read(|data| data.last_mode),
            SatelliteMode::LowPower
        );
        station.stop();
    }

    #[test]
    fn test_beacons_are_downlinked() {
        let mut config = fast_config();
        config.subsystems.beacon_interval_ms = Some(20);
        let station = Station::boot(config);
        // Beacons sent while still booting carry an earlier mode.
        thread::sleep(Duration::from_millis(30));
        while station.downlink(Duration::ZERO).is_some() {}

        let bytes = station.downlink(Duration::from_secs(2)).unwrap();
        let mut beacon = Frame::from_slice(&bytes);
        let header = decode_response(&mut beacon).unwrap();
        assert_eq!(header.sequence, BEACON_SEQUENCE);
        assert_eq!(header.ssid, SubsystemId::Cdh.code());
        assert_eq!(beacon.get_u8().unwrap(), SatelliteMode::Mission.code());
        beacon.get_u32().unwrap();
        assert_eq!(beacon.get_u32().unwrap(), 1);
        station.stop();
    }
}

#[cfg(test)]
mod process_uplink_tests {
    use super::*;

    /// An assembled, not started, board and a CDH instance sharing its
    /// channels and NVRAM.
    fn fixture() -> (Board, Arc<Platform>, CdhSubsystem) {
        let board = Board::new(fast_config()).unwrap();
        let platform = board.assemble().unwrap();
        let ss = CdhSubsystem::new(
            board.channel("uplink").unwrap(),
            board.channel("downlink").unwrap(),
            Arc::clone(board.frame_pool()),
            Arc::clone(board.nvram()),
            None,
        );
        (board, platform, ss)
    }

    fn process(platform: &Platform, ss: &CdhSubsystem, mut iframe: Frame) -> (Result<(), Error>, Frame) {
        let mut oframe = Frame::with_capacity(64);
        let result = ss.process_uplink(platform, &mut iframe, &mut oframe);
        oframe.reset_for_reading();
        (result, oframe)
    }

    #[test]
    fn test_header_failures_leave_output_empty() {
        let (_board, platform, ss) = fixture();

        let (result, out) = process(&platform, &ss, Frame::from_slice(&[0; 7]));
        assert_eq!(result, Err(Error::Illegal));
        assert_eq!(out.available_data(), 0);

        let mut bytes = command(DEFAULT_MAC_KEY, 5, SubsystemId::Cdh, cdh::CMD_PING, &[])
            .unread()
            .to_vec();
        bytes[7] ^= 0x01;
        let (result, out) = process(&platform, &ss, Frame::from_slice(&bytes));
        assert_eq!(result, Err(Error::Perm));
        assert_eq!(out.available_data(), 0);

        let reserved = command(DEFAULT_MAC_KEY, MAX_SEQUENCE_NUMBER + 1, SubsystemId::Cdh, cdh::CMD_PING, &[]);
        assert_eq!(process(&platform, &ss, reserved).0, Err(Error::Illegal));

        let mut unknown = Frame::with_capacity(16);
        protocol::encode_command(&mut unknown, DEFAULT_MAC_KEY, 6, 0x40, 0, &[]).unwrap();
        assert_eq!(process(&platform, &ss, unknown).0, Err(Error::NoEnt));

        let accepted = command(DEFAULT_MAC_KEY, 7, SubsystemId::Cdh, cdh::CMD_PING, &[]);
        assert_eq!(process(&platform, &ss, accepted).0, Ok(()));
        let replay = command(DEFAULT_MAC_KEY, 7, SubsystemId::Cdh, cdh::CMD_PING, &[]);
        assert_eq!(process(&platform, &ss, replay).0, Err(Error::Nack));
    }

    #[test]
    fn test_command_failures_travel_in_the_response() {
        let (_board, platform, ss) = fixture();

        // Known id, but nothing registered under it.
        let (result, mut out) = process(
            &platform,
            &ss,
            command(DEFAULT_MAC_KEY, 1, SubsystemId::Aocs, 0, &[]),
        );
        assert_eq!(result, Ok(()));
        let header = decode_response(&mut out).unwrap();
        assert_eq!(header.result, Err(Error::NoEnt));
        assert_eq!(out.available_data(), 0);

        // Subsystems are still booting, so the request is refused.
        let (_, mut out) = process(
            &platform,
            &ss,
            command(
                DEFAULT_MAC_KEY,
                2,
                SubsystemId::Platform,
                platform_ss::CMD_SET_MODE,
                &[SatelliteMode::Mission.code()],
            ),
        );
        assert_eq!(decode_response(&mut out).unwrap().result, Err(Error::Busy));

        let (_, mut out) = process(
            &platform,
            &ss,
            command(DEFAULT_MAC_KEY, 3, SubsystemId::Platform, 0x7F, &[]),
        );
        assert_eq!(decode_response(&mut out).unwrap().result, Err(Error::Illegal));
    }

    #[test]
    fn test_mac_key_rotation() {
        let (board, platform, ss) = fixture();
        let new_key = b"rotated-key";

        let (result, mut out) = process(
            &platform,
            &ss,
            command(DEFAULT_MAC_KEY, 1, SubsystemId::Cdh, cdh::CMD_SET_MAC_KEY, new_key),
        );
        assert_eq!(result, Ok(()));
        assert_eq!(decode_response(&mut out).unwrap().result, Ok(()));
        assert_eq!(board.nvram().read(|data| data.mac_key.clone()), new_key.to_vec());

        let stale = command(DEFAULT_MAC_KEY, 2, SubsystemId::Cdh, cdh::CMD_PING, &[]);
        assert_eq!(process(&platform, &ss, stale).0, Err(Error::Perm));
        let fresh = command(new_key, 2, SubsystemId::Cdh, cdh::CMD_PING, &[]);
        assert_eq!(process(&platform, &ss, fresh).0, Ok(()));

        let oversized = [0xAB; cdh::MAX_MAC_KEY + 1];
        let (_, mut out) = process(
            &platform,
            &ss,
            command(new_key, 3, SubsystemId::Cdh, cdh::CMD_SET_MAC_KEY, &oversized),
        );
        assert_eq!(decode_response(&mut out).unwrap().result, Err(Error::Illegal));
    }

    #[test]
    fn test_reset_sequence_accepts_old_numbers_again() {
        let (_board, platform, ss) = fixture();
        let high = command(DEFAULT_MAC_KEY, 500, SubsystemId::Cdh, cdh::CMD_RESET_SEQUENCE, &[]);
        assert_eq!(process(&platform, &ss, high).0, Ok(()));

        let low = command(DEFAULT_MAC_KEY, 1, SubsystemId::Cdh, cdh::CMD_GET_SEQUENCE, &[]);
        let (result, mut out) = process(&platform, &ss, low);
        assert_eq!(result, Ok(()));
        decode_response(&mut out).unwrap();
        assert_eq!(out.get_u24().unwrap(), 1);
    }
}
