use crate::types::{Credential, CustomTimeLimits, OilRecord, ProtocolVersion, Schedule};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, Timelike};

/// Pairing suffix appended to the password by V3.0 firmware
pub const PAIR_CODE: &[u8; 4] = b"OK01";

/// Aroma slot addressed by power and intensity commands
pub const DEFAULT_AROMA_SLOT: u8 = 1;

/// Schedule slots a V2.0 device keeps
pub const V2_SCHEDULE_SLOTS: u8 = 5;

/// Length of a V3.0 schedule write frame
pub const SCHEDULE_FRAME_V3_LEN: usize = 14;

/// Length of a V2.0 schedule write frame
pub const SCHEDULE_FRAME_V2_LEN: usize = 15;

/// Width of one reservoir name in the V3.0 names frame
pub const OIL_NAME_LEN: usize = 16;

const ALL_DAY_HOUR_OFF: u8 = 23;
const ALL_DAY_MINUTE_OFF: u8 = 59;
const EVERY_DAY: u8 = 0x7F;
const FAN_AND_FOG: u8 = 0x03;

/// Opcodes written to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// Clock sync (V2.0)
    TimeV2 = 0x02,
    /// Schedule write (V2.0)
    ScheduleWriteV2 = 0x03,
    /// Clock sync (V3.0)
    TimeV3 = 0x21,
    /// Schedule and quick power write (V3.0)
    ScheduleWriteV3 = 0x2A,
    /// Firmware versions query
    Version = 0x44,
    /// Limits query (V3.0)
    LimitsV3 = 0x46,
    /// Device name query
    ReadName = 0x7F,
    /// Limits query (V2.0)
    LimitsV2 = 0x88,
    /// Login with password
    Login = 0x8F,
}

/// Opcodes notified by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseId {
    /// Start of the post-login burst (V3.0)
    BufferClear = 0x40,
    /// Status byte (V3.0)
    StatusFlags = 0x41,
    /// Device name (V3.0)
    NameV3 = 0x42,
    /// Custom label (V3.0)
    Label = 0x43,
    /// PCB and equipment versions
    Version = 0x44,
    /// Product name (V3.0)
    ProductName = 0x45,
    /// Intensity and custom cycle limits (V3.0)
    LimitsV3 = 0x46,
    /// Intensity preset table (V3.0)
    IntensityPresets = 0x47,
    /// Reservoir names (V3.0)
    OilNames = 0x48,
    /// Schedule slot with live state (V3.0)
    ScheduleV3 = 0x4A,
    /// Battery and reservoir amounts (V3.0)
    OilAmounts = 0x4B,
    /// Factory identifier (V3.0)
    Identifier = 0x4C,
    /// Status byte (V3.0)
    StatusExtra = 0x4D,
    /// Status byte (V3.0)
    StatusMode = 0x4E,
    /// Status byte (V3.0)
    StatusTail = 0x50,
    /// Device name (V2.0)
    NameV2 = 0x81,
    /// Schedule slot with live state (V2.0)
    ScheduleV2 = 0x83,
    /// Limits acknowledgment (V2.0)
    LimitsV2 = 0x84,
    /// Login reply
    Login = 0x8F,
    /// Reservoir level (V2.0)
    OilV2 = 0x91,
}

impl ResponseId {
    /// Resolve an opcode for the given generation
    ///
    /// Only the login reply is understood before the generation is known.
    #[must_use]
    pub const fn from_u8(value: u8, version: Option<ProtocolVersion>) -> Option<Self> {
        match (value, version) {
            (0x8F, _) => Some(Self::Login),
            (0x44, Some(_)) => Some(Self::Version),
            (0x40, Some(ProtocolVersion::V3)) => Some(Self::BufferClear),
            (0x41, Some(ProtocolVersion::V3)) => Some(Self::StatusFlags),
            (0x42, Some(ProtocolVersion::V3)) => Some(Self::NameV3),
            (0x43, Some(ProtocolVersion::V3)) => Some(Self::Label),
            (0x45, Some(ProtocolVersion::V3)) => Some(Self::ProductName),
            (0x46, Some(ProtocolVersion::V3)) => Some(Self::LimitsV3),
            (0x47, Some(ProtocolVersion::V3)) => Some(Self::IntensityPresets),
            (0x48, Some(ProtocolVersion::V3)) => Some(Self::OilNames),
            (0x4A, Some(ProtocolVersion::V3)) => Some(Self::ScheduleV3),
            (0x4B, Some(ProtocolVersion::V3)) => Some(Self::OilAmounts),
            (0x4C, Some(ProtocolVersion::V3)) => Some(Self::Identifier),
            (0x4D, Some(ProtocolVersion::V3)) => Some(Self::StatusExtra),
            (0x4E, Some(ProtocolVersion::V3)) => Some(Self::StatusMode),
            (0x50, Some(ProtocolVersion::V3)) => Some(Self::StatusTail),
            (0x81, Some(ProtocolVersion::V2)) => Some(Self::NameV2),
            (0x83, Some(ProtocolVersion::V2)) => Some(Self::ScheduleV2),
            (0x84, Some(ProtocolVersion::V2)) => Some(Self::LimitsV2),
            (0x91, Some(ProtocolVersion::V2)) => Some(Self::OilV2),
            _ => None,
        }
    }
}

/// Wall-clock time in the layout the firmware expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    /// Day of week, 0 = Sunday
    pub weekday: u8,
    /// Two-digit year
    pub year: u8,
    /// Month, 1-12
    pub month: u8,
    /// Day of month
    pub day: u8,
    /// Hour, 0-23
    pub hour: u8,
    /// Minute
    pub minute: u8,
    /// Second
    pub second: u8,
}

impl ClockTime {
    /// Host local time
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    /// Convert any chrono date-time
    #[must_use]
    pub fn from_datetime<T: Datelike + Timelike>(dt: &T) -> Self {
        let narrow = |v: u32| u8::try_from(v).unwrap_or(u8::MAX);
        Self {
            weekday: narrow(dt.weekday().num_days_from_sunday()),
            year: narrow(dt.year().rem_euclid(100).unsigned_abs()),
            month: narrow(dt.month()),
            day: narrow(dt.day()),
            hour: narrow(dt.hour()),
            minute: narrow(dt.minute()),
            second: narrow(dt.second()),
        }
    }
}

/// Control commands understood by the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in with the device password
    Authenticate(Credential),
    /// Start diffusing at the given intensity
    PowerOn {
        /// Level to run at
        intensity: u8,
    },
    /// Stop diffusing
    PowerOff,
    /// Change the intensity of slot 1
    SetIntensity(u8),
    /// Ask for a full state dump
    ///
    /// The firmware has no dedicated status query; it answers a repeated
    /// login with the same burst it sends after the first one.
    RequestStatus(Credential),
    /// Set the device clock
    SyncClock(ClockTime),
    /// Read the device name
    ReadName,
    /// Read PCB and equipment versions
    ReadVersion,
    /// Read intensity limits
    ReadLimits,
}

/// What a command asks the device to do, independent of framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandIntent {
    /// Login with a password
    Login(Credential),
    /// Run or stop the diffuser
    Drive {
        /// Diffuser running afterwards
        power: bool,
        /// Level requested, when the frame carries one
        intensity: Option<u8>,
    },
    /// Clock sync
    SyncClock(ClockTime),
    /// Name query
    ReadName,
    /// Versions query
    ReadVersion,
    /// Limits query
    ReadLimits,
}

impl Command {
    /// Semantic content of this command
    #[must_use]
    pub fn intent(&self) -> CommandIntent {
        match self {
            Self::Authenticate(credential) | Self::RequestStatus(credential) => {
                CommandIntent::Login(credential.clone())
            }
            Self::PowerOn { intensity } | Self::SetIntensity(intensity) => CommandIntent::Drive {
                power: true,
                intensity: Some(*intensity),
            },
            Self::PowerOff => CommandIntent::Drive {
                power: false,
                intensity: None,
            },
            Self::SyncClock(time) => CommandIntent::SyncClock(*time),
            Self::ReadName => CommandIntent::ReadName,
            Self::ReadVersion => CommandIntent::ReadVersion,
            Self::ReadLimits => CommandIntent::ReadLimits,
        }
    }

    /// Short label for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::PowerOn { .. } => "power_on",
            Self::PowerOff => "power_off",
            Self::SetIntensity(_) => "set_intensity",
            Self::RequestStatus(_) => "request_status",
            Self::SyncClock(_) => "sync_clock",
            Self::ReadName => "read_name",
            Self::ReadVersion => "read_version",
            Self::ReadLimits => "read_limits",
        }
    }
}

/// Kind of device message that acknowledges a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Login reply
    Login,
    /// Schedule slot report
    Schedule,
    /// Device name
    DeviceName,
    /// Firmware versions
    Versions,
    /// Intensity limits
    Limits,
}

impl Reply {
    /// Check whether `message` acknowledges a frame awaiting this reply
    #[must_use]
    pub const fn matches(self, message: &Message) -> bool {
        match (self, message) {
            (Self::Login, Message::Login(_))
            | (Self::DeviceName, Message::Identity(IdentityField::DeviceName(_)))
            | (
                Self::Limits,
                Message::Identity(IdentityField::Limits { .. } | IdentityField::LegacyLimits),
            ) => true,
            (Self::Schedule, Message::Status(report)) => report.schedule.is_some(),
            (Self::Versions, Message::Status(report)) => report.pcb_version.is_some(),
            _ => false,
        }
    }
}

/// One frame ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw bytes
    pub bytes: Bytes,
    /// Acknowledgment to wait for, if any
    pub awaits: Option<Reply>,
}

impl Frame {
    const fn new(bytes: Bytes, awaits: Option<Reply>) -> Self {
        Self { bytes, awaits }
    }
}

/// Encode a command into the frames the given generation expects, in write order
#[must_use]
pub fn encode(command: &Command, version: ProtocolVersion) -> Vec<Frame> {
    match (command, version) {
        (Command::Authenticate(credential) | Command::RequestStatus(credential), _) => {
            vec![Frame::new(login_frame(credential, version), Some(Reply::Login))]
        }
        (Command::PowerOn { intensity }, ProtocolVersion::V3) => vec![
            Frame::new(quick_power_v3(true), None),
            Frame::new(schedule_v3(*intensity), Some(Reply::Schedule)),
        ],
        (Command::PowerOff, ProtocolVersion::V3) => vec![Frame::new(quick_power_v3(false), None)],
        (Command::SetIntensity(intensity), ProtocolVersion::V3) => {
            vec![Frame::new(schedule_v3(*intensity), Some(Reply::Schedule))]
        }
        (
            Command::PowerOn { intensity } | Command::SetIntensity(intensity),
            ProtocolVersion::V2,
        ) => vec![Frame::new(
            schedule_v2(true, *intensity, 1),
            Some(Reply::Schedule),
        )],
        (Command::PowerOff, ProtocolVersion::V2) => (1..=V2_SCHEDULE_SLOTS)
            .map(|index| Frame::new(schedule_v2(false, 1, index), Some(Reply::Schedule)))
            .collect(),
        (Command::SyncClock(time), _) => vec![Frame::new(clock_frame(*time, version), None)],
        (Command::ReadName, _) => vec![Frame::new(
            Bytes::copy_from_slice(&[CommandId::ReadName as u8]),
            Some(Reply::DeviceName),
        )],
        (Command::ReadVersion, _) => vec![Frame::new(
            Bytes::copy_from_slice(&[CommandId::Version as u8]),
            Some(Reply::Versions),
        )],
        (Command::ReadLimits, ProtocolVersion::V3) => vec![Frame::new(
            Bytes::copy_from_slice(&[CommandId::LimitsV3 as u8]),
            Some(Reply::Limits),
        )],
        (Command::ReadLimits, ProtocolVersion::V2) => vec![Frame::new(
            Bytes::copy_from_slice(&[CommandId::LimitsV2 as u8]),
            Some(Reply::Limits),
        )],
    }
}

fn login_frame(credential: &Credential, version: ProtocolVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + credential.as_bytes().len() + PAIR_CODE.len());
    buf.put_u8(CommandId::Login as u8);
    buf.extend_from_slice(credential.as_bytes());
    if version == ProtocolVersion::V3 {
        buf.extend_from_slice(PAIR_CODE);
    }
    buf.freeze()
}

fn quick_power_v3(on: bool) -> Bytes {
    let control = if on { FAN_AND_FOG } else { 0x00 };
    Bytes::copy_from_slice(&[
        CommandId::ScheduleWriteV3 as u8,
        DEFAULT_AROMA_SLOT,
        0x02,
        control,
        0x00,
    ])
}

/// Slot 1 running all day, every day, fan and fog on
fn schedule_v3(intensity: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCHEDULE_FRAME_V3_LEN);
    buf.put_u8(CommandId::ScheduleWriteV3 as u8);
    buf.put_u8(DEFAULT_AROMA_SLOT);
    buf.put_u8(0x02);
    buf.put_u8(FAN_AND_FOG);
    buf.put_u8(0x00);
    buf.put_u8(1);
    // fan on, slot enabled
    buf.put_u8(0x03);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(ALL_DAY_HOUR_OFF);
    buf.put_u8(ALL_DAY_MINUTE_OFF);
    buf.put_u8(EVERY_DAY);
    // no custom intensity
    buf.put_u8(0);
    buf.put_u8(intensity);
    buf.freeze()
}

fn schedule_v2(enabled: bool, intensity: u8, index: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCHEDULE_FRAME_V2_LEN);
    buf.put_u8(CommandId::ScheduleWriteV2 as u8);
    buf.put_u8(u8::from(enabled) | (index << 1));
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(ALL_DAY_HOUR_OFF);
    buf.put_u8(ALL_DAY_MINUTE_OFF);
    buf.put_u8(if enabled { EVERY_DAY } else { 0x00 });
    buf.put_u8(intensity);
    buf.resize(SCHEDULE_FRAME_V2_LEN, 0);
    buf.freeze()
}

fn clock_frame(time: ClockTime, version: ProtocolVersion) -> Bytes {
    let id = match version {
        ProtocolVersion::V2 => CommandId::TimeV2,
        ProtocolVersion::V3 => CommandId::TimeV3,
    };
    Bytes::copy_from_slice(&[
        id as u8,
        time.weekday,
        time.year,
        time.month,
        time.day,
        time.hour,
        time.minute,
        time.second,
    ])
}

/// Recover the intent of frames produced by [`encode`]
///
/// Used to inspect outbound traffic; `None` for anything that is not a
/// well-formed command sequence of the given generation.
#[must_use]
pub fn decode_command(frames: &[Bytes], version: ProtocolVersion) -> Option<CommandIntent> {
    let first = frames.first()?;
    let id = *first.first()?;

    match (id, version) {
        (0x8F, _) => {
            let expected = match version {
                ProtocolVersion::V2 => 5,
                ProtocolVersion::V3 => 5 + PAIR_CODE.len(),
            };
            if first.len() != expected || frames.len() != 1 {
                return None;
            }
            if version == ProtocolVersion::V3 && &first[5..] != PAIR_CODE {
                return None;
            }
            let digits = std::str::from_utf8(&first[1..5]).ok()?;
            Credential::new(digits).ok().map(CommandIntent::Login)
        }
        (0x2A, ProtocolVersion::V3) => match (first.len(), frames) {
            (5, [quick]) => Some(CommandIntent::Drive {
                power: quick[3] & 0x02 != 0,
                intensity: None,
            }),
            (5, [quick, schedule]) if quick[3] & 0x02 != 0 => {
                (schedule.len() == SCHEDULE_FRAME_V3_LEN).then(|| CommandIntent::Drive {
                    power: true,
                    intensity: Some(schedule[13]),
                })
            }
            (SCHEDULE_FRAME_V3_LEN, [schedule]) => Some(CommandIntent::Drive {
                power: schedule[3] & 0x02 != 0,
                intensity: Some(schedule[13]),
            }),
            _ => None,
        },
        (0x03, ProtocolVersion::V2) => {
            if frames.iter().any(|f| f.len() != SCHEDULE_FRAME_V2_LEN || f[0] != 0x03) {
                return None;
            }
            if first[1] & 0x01 != 0 {
                (frames.len() == 1).then(|| CommandIntent::Drive {
                    power: true,
                    intensity: Some(first[7]),
                })
            } else {
                frames
                    .iter()
                    .all(|f| f[1] & 0x01 == 0)
                    .then_some(CommandIntent::Drive {
                        power: false,
                        intensity: None,
                    })
            }
        }
        (0x02, ProtocolVersion::V2) | (0x21, ProtocolVersion::V3) => {
            if first.len() != 8 {
                return None;
            }
            Some(CommandIntent::SyncClock(ClockTime {
                weekday: first[1],
                year: first[2],
                month: first[3],
                day: first[4],
                hour: first[5],
                minute: first[6],
                second: first[7],
            }))
        }
        (0x7F, _) if first.len() == 1 => Some(CommandIntent::ReadName),
        (0x44, _) if first.len() == 1 => Some(CommandIntent::ReadVersion),
        (0x46, ProtocolVersion::V3) | (0x88, ProtocolVersion::V2) if first.len() == 1 => {
            Some(CommandIntent::ReadLimits)
        }
        _ => None,
    }
}

/// Outcome carried by a login reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Password accepted
    Success,
    /// Password refused
    Failure,
}

/// Identification carried by a login reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReport {
    /// Reply body after the opcode
    pub signature: Bytes,
    /// Version text at body offset 4, e.g. `3.0`
    pub version_text: Option<String>,
    /// Feature bits, present on V3.0 replies long enough to carry them
    pub feature_bits: Option<u8>,
}

impl IdentityReport {
    /// Short reply bodies come from legacy V2.0 firmware
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.signature.len() <= 2
    }
}

/// Decoded login reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    /// Whether the password was accepted
    pub result: AuthResult,
    /// Identification, `None` if the device refused outright or the body is unreadable
    pub identity: Option<IdentityReport>,
}

/// Identification data pushed after login or returned by identity reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityField {
    /// Bluetooth device name
    DeviceName(String),
    /// Product/model name
    ProductName(String),
    /// Custom label
    Label(String),
    /// Factory identifier
    Identifier(String),
    /// Intensity limits
    Limits {
        /// Highest accepted intensity
        max_intensity: u8,
        /// Custom cycle ranges, when the frame carries them
        custom: Option<CustomTimeLimits>,
    },
    /// V2.0 limits reply, which carries no usable data
    LegacyLimits,
}

/// One reservoir's amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OilLevel {
    /// Capacity, 0 when unknown
    pub total: u16,
    /// Amount left
    pub remaining: u16,
}

/// Telemetry carried by a single frame; absent fields are left untouched on merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Diffuser running
    pub power: Option<bool>,
    /// Current intensity
    pub intensity: Option<u8>,
    /// Fan running
    pub fan_on: Option<bool>,
    /// Active schedule slot, 0 for none
    pub active_schedule: Option<u8>,
    /// Schedule slot described by this frame
    pub schedule: Option<Schedule>,
    /// Reservoir names in slot order
    pub oil_names: Option<Vec<String>>,
    /// Reservoir amounts in slot order
    pub oil_levels: Option<Vec<OilLevel>>,
    /// Battery level
    pub battery_level: Option<u8>,
    /// PCB firmware version
    pub pcb_version: Option<String>,
    /// Equipment firmware version
    pub equipment_version: Option<String>,
}

/// A decoded device notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Reply to a login frame
    Login(LoginReply),
    /// Identification data
    Identity(IdentityField),
    /// Telemetry
    Status(StatusReport),
    /// Known frame without usable content
    Acknowledgement(u8),
    /// Unknown or truncated frame
    Unrecognized(Bytes),
}

/// Decode a notification
///
/// Never fails: unknown opcodes and frames shorter than their layout come
/// back as [`Message::Unrecognized`]. Before the generation is known only the
/// login reply is understood.
#[must_use]
pub fn decode(data: &[u8], version: Option<ProtocolVersion>) -> Message {
    let parsed = data
        .first()
        .and_then(|&opcode| ResponseId::from_u8(opcode, version))
        .and_then(|id| decode_known(id, data));

    parsed.unwrap_or_else(|| Message::Unrecognized(Bytes::copy_from_slice(data)))
}

fn decode_known(id: ResponseId, data: &[u8]) -> Option<Message> {
    let body = &data[1..];
    match id {
        ResponseId::Login => Some(Message::Login(parse_login(body))),
        ResponseId::BufferClear
        | ResponseId::StatusFlags
        | ResponseId::IntensityPresets
        | ResponseId::StatusExtra
        | ResponseId::StatusMode
        | ResponseId::StatusTail => Some(Message::Acknowledgement(id as u8)),
        ResponseId::NameV3 => Some(identity(IdentityField::DeviceName(text(body)))),
        ResponseId::NameV2 => body
            .get(1..)
            .map(|name| identity(IdentityField::DeviceName(text(name)))),
        ResponseId::ProductName => Some(identity(IdentityField::ProductName(text(body)))),
        ResponseId::Label => Some(identity(IdentityField::Label(text(body)))),
        ResponseId::Identifier => Some(identity(IdentityField::Identifier(text(body)))),
        ResponseId::LimitsV3 => parse_limits(body).map(identity),
        ResponseId::LimitsV2 => Some(identity(IdentityField::LegacyLimits)),
        ResponseId::Version => parse_versions(data).map(Message::Status),
        ResponseId::ScheduleV3 => parse_schedule_v3(data).map(Message::Status),
        ResponseId::ScheduleV2 => parse_schedule_v2(data).map(Message::Status),
        ResponseId::OilNames => Some(Message::Status(StatusReport {
            oil_names: Some(parse_oil_names(body)),
            ..StatusReport::default()
        })),
        ResponseId::OilAmounts => parse_oil_amounts(data).map(Message::Status),
        ResponseId::OilV2 => parse_oil_v2(data).map(Message::Status),
    }
}

const fn identity(field: IdentityField) -> Message {
    Message::Identity(field)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

fn be_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    bytes.get(offset..offset + 2).map(|mut b| b.get_u16())
}

/// Body layout: `ERROR` on refusal; up to 2 bytes from legacy firmware;
/// otherwise version text at 4..7, pairing acknowledgment at 7..9 and
/// feature bits at 12.
fn parse_login(body: &[u8]) -> LoginReply {
    if body == b"ERROR" {
        return LoginReply {
            result: AuthResult::Failure,
            identity: None,
        };
    }

    if body.len() <= 2 {
        return LoginReply {
            result: AuthResult::Success,
            identity: Some(IdentityReport {
                signature: Bytes::copy_from_slice(body),
                version_text: None,
                feature_bits: None,
            }),
        };
    }

    let result = match body.get(7..9) {
        Some(ack) if ack == &PAIR_CODE[..2] => AuthResult::Success,
        Some(_) => AuthResult::Failure,
        None => AuthResult::Success,
    };

    let version_text = body
        .get(4..7)
        .map(|v| String::from_utf8_lossy(v).into_owned());
    let feature_bits = if version_text.as_deref() == Some("3.0") {
        body.get(12).copied()
    } else {
        None
    };

    LoginReply {
        result,
        identity: Some(IdentityReport {
            signature: Bytes::copy_from_slice(body),
            version_text,
            feature_bits,
        }),
    }
}

fn parse_limits(body: &[u8]) -> Option<IdentityField> {
    let max_intensity = *body.first()?;
    if max_intensity == 0 {
        return None;
    }
    let custom = if body.len() >= 9 {
        Some(CustomTimeLimits {
            on_min: be_u16(body, 1)?,
            on_max: be_u16(body, 3)?,
            off_min: be_u16(body, 5)?,
            off_max: be_u16(body, 7)?,
        })
    } else {
        None
    };
    Some(IdentityField::Limits {
        max_intensity,
        custom,
    })
}

fn parse_versions(data: &[u8]) -> Option<StatusReport> {
    if data.len() <= 17 {
        return None;
    }
    Some(StatusReport {
        pcb_version: Some(text(&data[1..17])),
        equipment_version: Some(text(&data[17..])),
        ..StatusReport::default()
    })
}

/// `[4A] aroma ? total_control active index slot_control on_h on_m off_h off_m repeat ? intensity`
fn parse_schedule_v3(data: &[u8]) -> Option<StatusReport> {
    if data.len() < SCHEDULE_FRAME_V3_LEN {
        return None;
    }
    let total_control = data[3];
    let slot_control = data[6];
    let index = data[5];

    let schedule = Schedule {
        index,
        enabled: slot_control & 0x02 != 0,
        hour_on: data[7],
        minute_on: data[8],
        hour_off: data[9],
        minute_off: data[10],
        repeat_days: data[11],
        intensity: data[13],
        aroma: Some(data[1]),
        fan_enabled: Some(slot_control & 0x01 != 0),
    };

    // every slot carries the device-wide control byte, the merge picks the live one
    Some(StatusReport {
        power: Some(total_control & 0x02 != 0),
        fan_on: Some(total_control & 0x01 != 0),
        intensity: Some(data[13]),
        active_schedule: Some(data[4]),
        schedule: Some(schedule),
        ..StatusReport::default()
    })
}

/// `[83] control on_h on_m off_h off_m repeat intensity .. remaining(10..12) total(12..14) battery(14)`
fn parse_schedule_v2(data: &[u8]) -> Option<StatusReport> {
    if data.len() < 8 {
        return None;
    }
    let control = data[1];
    let enabled = control & 0x01 != 0;
    let index = (control >> 1) & 0x0F;

    let schedule = Schedule {
        index,
        enabled,
        hour_on: data[2],
        minute_on: data[3],
        hour_off: data[4],
        minute_off: data[5],
        repeat_days: data[6],
        intensity: data[7],
        aroma: None,
        fan_enabled: None,
    };

    let mut report = StatusReport {
        schedule: Some(schedule),
        ..StatusReport::default()
    };

    if index == 1 {
        report.power = Some(enabled);
        report.intensity = Some(data[7].max(1));

        if data.len() > 14 {
            report.oil_levels = Some(vec![OilLevel {
                remaining: be_u16(data, 10)?,
                total: be_u16(data, 12)?,
            }]);
            report.battery_level = Some(data[14]);
        }
    }

    Some(report)
}

fn parse_oil_names(body: &[u8]) -> Vec<String> {
    body.chunks_exact(OIL_NAME_LEN)
        .enumerate()
        .map(|(idx, chunk)| {
            let name = String::from_utf8_lossy(chunk).replace('\0', "");
            if name.is_empty() {
                OilRecord::default_name(idx)
            } else {
                name
            }
        })
        .collect()
}

/// `[4B] battery (total remaining)*`
fn parse_oil_amounts(data: &[u8]) -> Option<StatusReport> {
    if data.len() < 4 {
        return None;
    }
    let levels = data[2..]
        .chunks_exact(4)
        .map(|mut chunk| OilLevel {
            total: chunk.get_u16(),
            remaining: chunk.get_u16(),
        })
        .collect();

    Some(StatusReport {
        battery_level: Some(data[1]),
        oil_levels: Some(levels),
        ..StatusReport::default()
    })
}

/// `[91] remaining(1..3) battery(3)`; the firmware does not report capacity
fn parse_oil_v2(data: &[u8]) -> Option<StatusReport> {
    if data.len() < 4 {
        return None;
    }
    Some(StatusReport {
        oil_levels: Some(vec![OilLevel {
            total: 0,
            remaining: be_u16(data, 1)?,
        }]),
        battery_level: Some(data[3]),
        ..StatusReport::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential::new("1234").unwrap()
    }

    fn single(frames: &[Frame]) -> &[u8] {
        assert_eq!(frames.len(), 1);
        &frames[0].bytes
    }

    #[test]
    fn test_login_frames() {
        let v2 = encode(&Command::Authenticate(credential()), ProtocolVersion::V2);
        assert_eq!(single(&v2), &[0x8F, b'1', b'2', b'3', b'4']);
        assert_eq!(v2[0].awaits, Some(Reply::Login));

        let v3 = encode(&Command::Authenticate(credential()), ProtocolVersion::V3);
        assert_eq!(single(&v3), b"\x8F1234OK01");
    }

    #[test]
    fn test_intensity_frames() {
        let v3 = encode(&Command::SetIntensity(3), ProtocolVersion::V3);
        assert_eq!(
            single(&v3),
            &[0x2A, 0x01, 0x02, 0x03, 0x00, 0x01, 0x03, 0x00, 0x00, 23, 59, 0x7F, 0x00, 3]
        );
        assert_eq!(v3[0].awaits, Some(Reply::Schedule));

        let v2 = encode(&Command::SetIntensity(3), ProtocolVersion::V2);
        assert_eq!(
            single(&v2),
            &[0x03, 0x03, 0x00, 0x00, 23, 59, 0x7F, 3, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_power_frames_v3() {
        let on = encode(&Command::PowerOn { intensity: 2 }, ProtocolVersion::V3);
        assert_eq!(on.len(), 2);
        assert_eq!(&on[0].bytes[..], &[0x2A, 0x01, 0x02, 0x03, 0x00]);
        assert_eq!(on[0].awaits, None);
        assert_eq!(on[1].bytes[13], 2);
        assert_eq!(on[1].awaits, Some(Reply::Schedule));

        let off = encode(&Command::PowerOff, ProtocolVersion::V3);
        assert_eq!(single(&off), &[0x2A, 0x01, 0x02, 0x00, 0x00]);
        assert_eq!(off[0].awaits, None);
    }

    #[test]
    fn test_power_off_v2_clears_every_slot() {
        let off = encode(&Command::PowerOff, ProtocolVersion::V2);
        assert_eq!(off.len(), 5);
        for (i, frame) in off.iter().enumerate() {
            let index = u8::try_from(i + 1).unwrap();
            assert_eq!(frame.bytes[0], 0x03);
            assert_eq!(frame.bytes[1], index << 1);
            assert_eq!(frame.bytes[6], 0x00);
            assert_eq!(frame.bytes.len(), SCHEDULE_FRAME_V2_LEN);
        }
    }

    #[test]
    fn test_clock_frame() {
        let time = ClockTime {
            weekday: 0,
            year: 26,
            month: 10,
            day: 18,
            hour: 7,
            minute: 30,
            second: 5,
        };
        let v3 = encode(&Command::SyncClock(time), ProtocolVersion::V3);
        assert_eq!(single(&v3), &[0x21, 0, 26, 10, 18, 7, 30, 5]);
        assert_eq!(v3[0].awaits, None);

        let v2 = encode(&Command::SyncClock(time), ProtocolVersion::V2);
        assert_eq!(single(&v2)[0], 0x02);
    }

    #[test]
    fn test_clock_time_from_datetime() {
        let dt = chrono::NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(21, 4, 9)
            .unwrap();
        let time = ClockTime::from_datetime(&dt);
        // 2026-10-18 is a Sunday
        assert_eq!(time.weekday, 0);
        assert_eq!(time.year, 26);
        assert_eq!((time.month, time.day), (10, 18));
        assert_eq!((time.hour, time.minute, time.second), (21, 4, 9));
    }

    #[test]
    fn test_read_frames_per_version() {
        assert_eq!(single(&encode(&Command::ReadName, ProtocolVersion::V2)), &[0x7F]);
        assert_eq!(single(&encode(&Command::ReadVersion, ProtocolVersion::V3)), &[0x44]);
        assert_eq!(single(&encode(&Command::ReadLimits, ProtocolVersion::V3)), &[0x46]);
        assert_eq!(single(&encode(&Command::ReadLimits, ProtocolVersion::V2)), &[0x88]);
    }

    #[test]
    fn test_command_intent_round_trip() {
        let time = ClockTime {
            weekday: 3,
            year: 26,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
        };
        let commands = [
            Command::Authenticate(credential()),
            Command::RequestStatus(credential()),
            Command::PowerOn { intensity: 4 },
            Command::PowerOff,
            Command::SetIntensity(2),
            Command::SyncClock(time),
            Command::ReadName,
            Command::ReadVersion,
            Command::ReadLimits,
        ];

        for version in [ProtocolVersion::V2, ProtocolVersion::V3] {
            for command in &commands {
                let frames: Vec<Bytes> = encode(command, version)
                    .into_iter()
                    .map(|f| f.bytes)
                    .collect();
                assert_eq!(
                    decode_command(&frames, version),
                    Some(command.intent()),
                    "{} over {version}",
                    command.name()
                );
            }
        }
    }

    #[test]
    fn test_decode_login_replies() {
        let rejected = decode(b"\x8FERROR", None);
        assert_eq!(
            rejected,
            Message::Login(LoginReply {
                result: AuthResult::Failure,
                identity: None
            })
        );

        let Message::Login(legacy) = decode(&[0x8F, b'O', b'K'], None) else {
            panic!("expected login reply");
        };
        assert_eq!(legacy.result, AuthResult::Success);
        assert!(legacy.identity.unwrap().is_legacy());

        let mut v3 = b"\x8FAT013.0OK01\x00".to_vec();
        v3.push(0x1B);
        let Message::Login(reply) = decode(&v3, None) else {
            panic!("expected login reply");
        };
        assert_eq!(reply.result, AuthResult::Success);
        let identity = reply.identity.unwrap();
        assert_eq!(identity.version_text.as_deref(), Some("3.0"));
        assert_eq!(identity.feature_bits, Some(0x1B));

        let Message::Login(wrong_pairing) = decode(b"\x8FAT013.0NO01", None) else {
            panic!("expected login reply");
        };
        assert_eq!(wrong_pairing.result, AuthResult::Failure);

        let Message::Login(garbled) = decode(&[0x8F, 0xFF, 0x00, 0x13, 0x99], None) else {
            panic!("expected login reply");
        };
        let identity = garbled.identity.unwrap();
        assert!(!identity.is_legacy());
        assert_eq!(identity.version_text, None);
    }

    #[test]
    fn test_decode_login_with_binary_prefix() {
        let Message::Login(reply) = decode(b"\x8F\x00\x01\x02\x033.0OK01\x00\x1B", None) else {
            panic!("expected login reply");
        };
        assert_eq!(reply.result, AuthResult::Success);
        let identity = reply.identity.unwrap();
        assert_eq!(identity.version_text.as_deref(), Some("3.0"));
        assert_eq!(identity.feature_bits, Some(0x1B));
    }

    #[test]
    fn test_decode_schedule_v3_slot_one() {
        let frame = [0x4A, 2, 0x02, 0x03, 1, 1, 0x03, 8, 0, 22, 30, 0x7F, 0, 4];
        let Message::Status(report) = decode(&frame, Some(ProtocolVersion::V3)) else {
            panic!("expected status");
        };
        assert_eq!(report.power, Some(true));
        assert_eq!(report.fan_on, Some(true));
        assert_eq!(report.intensity, Some(4));
        assert_eq!(report.active_schedule, Some(1));
        let schedule = report.schedule.unwrap();
        assert_eq!(schedule.aroma, Some(2));
        assert_eq!((schedule.hour_on, schedule.hour_off), (8, 22));
        assert!(schedule.enabled);
    }

    #[test]
    fn test_decode_schedule_v3_other_slot_carries_control_byte() {
        let frame = [0x4A, 1, 0x02, 0x01, 0, 3, 0x02, 8, 0, 22, 30, 0x7F, 0, 2];
        let Message::Status(report) = decode(&frame, Some(ProtocolVersion::V3)) else {
            panic!("expected status");
        };
        assert_eq!(report.power, Some(false));
        assert_eq!(report.fan_on, Some(true));
        assert_eq!(report.intensity, Some(2));
        assert_eq!(report.schedule.unwrap().index, 3);
    }

    #[test]
    fn test_decode_schedule_v2_with_embedded_oil() {
        let frame = [
            0x83, 0x03, 0, 0, 23, 59, 0x7F, 2, 0, 0, 0x00, 0x4B, 0x00, 0x96, 87,
        ];
        let Message::Status(report) = decode(&frame, Some(ProtocolVersion::V2)) else {
            panic!("expected status");
        };
        assert_eq!(report.power, Some(true));
        assert_eq!(report.intensity, Some(2));
        assert_eq!(
            report.oil_levels,
            Some(vec![OilLevel {
                total: 150,
                remaining: 75
            }])
        );
        assert_eq!(report.battery_level, Some(87));
        assert_eq!(report.fan_on, None);
    }

    #[test]
    fn test_decode_oil_frames() {
        let mut names = vec![0x48];
        let mut lavender = b"Lavender".to_vec();
        lavender.resize(OIL_NAME_LEN, 0);
        names.extend_from_slice(&lavender);
        names.extend_from_slice(&[0; OIL_NAME_LEN]);
        let Message::Status(report) = decode(&names, Some(ProtocolVersion::V3)) else {
            panic!("expected status");
        };
        assert_eq!(
            report.oil_names,
            Some(vec!["Lavender".to_string(), "Oil 2".to_string()])
        );

        let amounts = [0x4B, 64, 0x00, 0xC8, 0x00, 0x64, 0x01, 0x2C, 0x00, 0x00];
        let Message::Status(report) = decode(&amounts, Some(ProtocolVersion::V3)) else {
            panic!("expected status");
        };
        assert_eq!(report.battery_level, Some(64));
        assert_eq!(
            report.oil_levels,
            Some(vec![
                OilLevel {
                    total: 200,
                    remaining: 100
                },
                OilLevel {
                    total: 300,
                    remaining: 0
                },
            ])
        );

        let Message::Status(v2) = decode(&[0x91, 0x01, 0x00, 55], Some(ProtocolVersion::V2))
        else {
            panic!("expected status");
        };
        assert_eq!(
            v2.oil_levels,
            Some(vec![OilLevel {
                total: 0,
                remaining: 256
            }])
        );
        assert_eq!(v2.battery_level, Some(55));
    }

    #[test]
    fn test_decode_identity_frames() {
        assert_eq!(
            decode(b"\x42Diffuser\x00\x00", Some(ProtocolVersion::V3)),
            Message::Identity(IdentityField::DeviceName("Diffuser".to_string()))
        );
        assert_eq!(
            decode(b"\x81\x08Lobby", Some(ProtocolVersion::V2)),
            Message::Identity(IdentityField::DeviceName("Lobby".to_string()))
        );
        assert_eq!(
            decode(b"\x45AROMINI BT PLUS", Some(ProtocolVersion::V3)),
            Message::Identity(IdentityField::ProductName("AROMINI BT PLUS".to_string()))
        );
        assert_eq!(
            decode(&[0x46, 7, 0, 10, 0, 60, 0, 30, 1, 44], Some(ProtocolVersion::V3)),
            Message::Identity(IdentityField::Limits {
                max_intensity: 7,
                custom: Some(CustomTimeLimits {
                    on_min: 10,
                    on_max: 60,
                    off_min: 30,
                    off_max: 300
                })
            })
        );
        assert_eq!(
            decode(&[0x84, 1, 2], Some(ProtocolVersion::V2)),
            Message::Identity(IdentityField::LegacyLimits)
        );
    }

    #[test]
    fn test_decode_versions() {
        let mut frame = vec![0x44];
        let mut pcb = b"PCB-1.2".to_vec();
        pcb.resize(16, 0);
        frame.extend_from_slice(&pcb);
        frame.extend_from_slice(b"EQ-3.4\0");
        let Message::Status(report) = decode(&frame, Some(ProtocolVersion::V3)) else {
            panic!("expected status");
        };
        assert_eq!(report.pcb_version.as_deref(), Some("PCB-1.2"));
        assert_eq!(report.equipment_version.as_deref(), Some("EQ-3.4"));
    }

    #[test]
    fn test_opcodes_are_generation_specific() {
        let frame = [0x4A, 1, 2, 3, 0, 1, 3, 0, 0, 23, 59, 0x7F, 0, 3];
        assert!(matches!(
            decode(&frame, Some(ProtocolVersion::V2)),
            Message::Unrecognized(_)
        ));
        assert!(matches!(decode(&frame, None), Message::Unrecognized(_)));
        assert_eq!(
            decode(&[0x40], Some(ProtocolVersion::V3)),
            Message::Acknowledgement(0x40)
        );
    }

    #[test]
    fn test_truncated_frames_are_unrecognized() {
        let cases: [(&[u8], ProtocolVersion); 6] = [
            (&[0x4A, 1, 2, 3], ProtocolVersion::V3),
            (&[0x83, 0x03, 0], ProtocolVersion::V2),
            (&[0x4B, 1], ProtocolVersion::V3),
            (&[0x91, 1], ProtocolVersion::V2),
            (&[0x44, 1, 2, 3], ProtocolVersion::V3),
            (&[0x46], ProtocolVersion::V3),
        ];
        for (frame, version) in cases {
            assert_eq!(
                decode(frame, Some(version)),
                Message::Unrecognized(Bytes::copy_from_slice(frame))
            );
        }
        assert!(matches!(decode(&[], None), Message::Unrecognized(_)));
    }

    #[test]
    fn test_decode_never_panics_on_arbitrary_bytes() {
        let versions = [None, Some(ProtocolVersion::V2), Some(ProtocolVersion::V3)];
        for opcode in 0..=u8::MAX {
            for len in 0..40usize {
                let mut frame = vec![opcode];
                frame.extend((0..len).map(|i| u8::try_from(i * 37 % 256).unwrap()));
                for version in versions {
                    let _ = decode(&frame, version);
                }
            }
        }
    }

    #[test]
    fn test_reply_matching() {
        let schedule = decode(
            &[0x4A, 1, 2, 3, 0, 1, 3, 0, 0, 23, 59, 0x7F, 0, 3],
            Some(ProtocolVersion::V3),
        );
        assert!(Reply::Schedule.matches(&schedule));
        assert!(!Reply::Login.matches(&schedule));
        assert!(!Reply::Versions.matches(&schedule));

        let battery = decode(&[0x4B, 50, 0, 0], Some(ProtocolVersion::V3));
        assert!(!Reply::Schedule.matches(&battery));

        let legacy_limits = decode(&[0x84], Some(ProtocolVersion::V2));
        assert!(Reply::Limits.matches(&legacy_limits));
    }
}
