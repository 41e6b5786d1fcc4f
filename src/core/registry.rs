//! Characteristic registry for COR hubs and MPPT controllers
//! Static channel tables: service and characteristic ids, field layouts, poll groups
//! and write guards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::codec::TICK_HEADER_LEN;
use crate::error::RegistryError;

/// COR telemetry service
pub const COR_SERVICE: Uuid = Uuid::from_u128(0xE909900B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_SOC_CHAR: Uuid = Uuid::from_u128(0xE919900B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_POWER_VOLTAGE_CHAR: Uuid = Uuid::from_u128(0xE929900B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_TEMPERATURE_CHAR: Uuid = Uuid::from_u128(0xE939900B_38D7_0000_8FE1_2A48A02B36E6);

/// COR controls service
pub const COR_CONTROLS_SERVICE: Uuid = Uuid::from_u128(0xE90C930B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_LED_CHAR: Uuid = Uuid::from_u128(0xE91C930B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_LCD_CHAR: Uuid = Uuid::from_u128(0xE92C930B_38D7_0000_8FE1_2A48A02B36E6);
pub const COR_CURRENT_CHAR: Uuid = Uuid::from_u128(0xE93C930B_38D7_0000_8FE1_2A48A02B36E6);

/// MPPT telemetry service
pub const MPPT_SERVICE: Uuid = Uuid::from_u128(0xE909900B_38D7_0000_8FE1_2A48A02B36E6);
pub const MPPT_POWER_VOLTAGE_CHAR: Uuid = Uuid::from_u128(0xE919900B_38D7_0000_8FE1_2A48A02B36E6);
pub const MPPT_TEMPERATURE_CHAR: Uuid = Uuid::from_u128(0xE929900B_38D7_0000_8FE1_2A48A02B36E6);

/// MPPT on/off and reset service
pub const MPPT_CONTROL_SERVICE: Uuid = Uuid::from_u128(0xE90A930B_38D7_0000_8FE1_2A48A02B36E6);
pub const MPPT_ON_OFF_CHAR: Uuid = Uuid::from_u128(0xE91A930B_38D7_0000_8FE1_2A48A02B36E6);
pub const MPPT_RESET_CHAR: Uuid = Uuid::from_u128(0xE92A930B_38D7_0000_8FE1_2A48A02B36E6);

/// The two peripheral families this bridge talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    Cor,
    Mppt,
}

impl DeviceFamily {
    pub const ALL: [DeviceFamily; 2] = [DeviceFamily::Cor, DeviceFamily::Mppt];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::Cor => "cor",
            DeviceFamily::Mppt => "mppt",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Cor => write!(f, "COR"),
            DeviceFamily::Mppt => write!(f, "MPPT"),
        }
    }
}

impl FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cor" => Ok(DeviceFamily::Cor),
            "mppt" => Ok(DeviceFamily::Mppt),
            other => Err(format!("unknown device family: {}", other)),
        }
    }
}

/// Linear scaling applied to a raw field value.
///
/// `value = raw * multiplier / divisor + offset`, rounded to `precision` decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub multiplier: i32,
    pub divisor: i32,
    pub offset: f64,
    pub precision: u8,
    /// A raw zero means "not reported" and decodes to 0 without the offset.
    pub zero_is_unset: bool,
}

impl Scale {
    pub const IDENTITY: Scale = Scale {
        multiplier: 1,
        divisor: 1,
        offset: 0.0,
        precision: 0,
        zero_is_unset: false,
    };

    pub const fn divided(divisor: i32, precision: u8) -> Self {
        Scale {
            multiplier: 1,
            divisor,
            offset: 0.0,
            precision,
            zero_is_unset: false,
        }
    }

    pub const fn with_offset(self, offset: f64) -> Self {
        Scale { offset, ..self }
    }

    pub const fn zero_unset(self) -> Self {
        Scale {
            zero_is_unset: true,
            ..self
        }
    }

    pub fn apply(&self, raw: i64) -> f64 {
        if self.zero_is_unset && raw == 0 {
            return 0.0;
        }
        let divisor = if self.divisor == 0 { 1 } else { self.divisor };
        let value = raw as f64 * self.multiplier as f64 / divisor as f64 + self.offset;
        let factor = 10f64.powi(self.precision as i32);
        (value * factor).round() / factor
    }
}

/// One field inside a characteristic payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacteristicField {
    pub name: &'static str,
    pub byte_offset: usize,
    pub byte_width: usize,
    pub signed: bool,
    pub scale: Scale,
    pub bitmask: Option<u8>,
}

impl CharacteristicField {
    pub const fn unsigned(name: &'static str, byte_offset: usize, byte_width: usize) -> Self {
        CharacteristicField {
            name,
            byte_offset,
            byte_width,
            signed: false,
            scale: Scale::IDENTITY,
            bitmask: None,
        }
    }

    pub const fn signed(name: &'static str, byte_offset: usize, byte_width: usize) -> Self {
        CharacteristicField {
            signed: true,
            ..Self::unsigned(name, byte_offset, byte_width)
        }
    }

    pub const fn flag(name: &'static str, byte_offset: usize, mask: u8) -> Self {
        CharacteristicField {
            bitmask: Some(mask),
            ..Self::unsigned(name, byte_offset, 1)
        }
    }

    pub const fn scaled(self, scale: Scale) -> Self {
        CharacteristicField { scale, ..self }
    }

    pub fn end(&self) -> usize {
        self.byte_offset + self.byte_width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn is_readable(&self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

/// Cadence a channel is polled at while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PollGroup {
    Primary,
    Slow,
    ControlMirror,
    OnDemand,
}

/// Writes to a guarded channel are skipped while `channel.field` reads 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGuard {
    pub channel: &'static str,
    pub field: &'static str,
}

/// One readable and/or writable characteristic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelDescriptor {
    pub name: &'static str,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub direction: Direction,
    pub payload_len: usize,
    pub group: PollGroup,
    pub fields: &'static [CharacteristicField],
    pub guard: Option<WriteGuard>,
}

impl ChannelDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static CharacteristicField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks the layout rules every table entry must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        for field in self.fields {
            if field.byte_width != 1 && field.byte_width != 2 {
                return Err(format!("{}.{}: width must be 1 or 2", self.name, field.name));
            }
            if field.byte_offset < TICK_HEADER_LEN {
                return Err(format!("{}.{}: overlaps the tick header", self.name, field.name));
            }
            if field.end() > self.payload_len {
                return Err(format!("{}.{}: exceeds payload length", self.name, field.name));
            }
            if field.bitmask == Some(0) {
                return Err(format!("{}.{}: empty bitmask", self.name, field.name));
            }
        }

        for (i, a) in self.fields.iter().enumerate() {
            for b in &self.fields[i + 1..] {
                if a.name == b.name {
                    return Err(format!("{}: duplicate field {}", self.name, a.name));
                }
                let overlaps = a.byte_offset < b.end() && b.byte_offset < a.end();
                if !overlaps {
                    continue;
                }
                match (a.bitmask, b.bitmask) {
                    (Some(ma), Some(mb)) if ma & mb == 0 => {}
                    _ => {
                        return Err(format!("{}: {} overlaps {}", self.name, a.name, b.name));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Names one field of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub channel: &'static str,
    pub field: &'static str,
}

/// Which cached fields feed a telemetry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMapping {
    pub power: FieldRef,
    pub voltage: FieldRef,
    pub temperature1: FieldRef,
    pub temperature2: FieldRef,
}

#[derive(Debug)]
pub struct FamilyProfile {
    pub family: DeviceFamily,
    pub channels: &'static [ChannelDescriptor],
    pub record: RecordMapping,
}

const SYSTEM_POWER_GUARD: Option<WriteGuard> = Some(WriteGuard {
    channel: "current",
    field: "system_on",
});

const MPPT_TEMPERATURE_SCALE: Scale = Scale::divided(10, 1).with_offset(-40.0).zero_unset();

static COR_CHANNELS: [ChannelDescriptor; 6] = [
    ChannelDescriptor {
        name: "soc",
        service: COR_SERVICE,
        characteristic: COR_SOC_CHAR,
        direction: Direction::Read,
        payload_len: 10,
        group: PollGroup::Primary,
        fields: &[
            CharacteristicField::unsigned("soc", 2, 2),
            CharacteristicField::unsigned("ext1_soc", 4, 2),
            CharacteristicField::unsigned("ext2_soc", 6, 2),
            CharacteristicField::unsigned("ext3_soc", 8, 2),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "power_voltage",
        service: COR_SERVICE,
        characteristic: COR_POWER_VOLTAGE_CHAR,
        direction: Direction::Read,
        payload_len: 6,
        group: PollGroup::Primary,
        fields: &[
            CharacteristicField::unsigned("voltage", 2, 2),
            CharacteristicField::signed("power", 4, 2),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "temperature",
        service: COR_SERVICE,
        characteristic: COR_TEMPERATURE_CHAR,
        direction: Direction::Read,
        payload_len: 10,
        group: PollGroup::Primary,
        fields: &[
            CharacteristicField::unsigned("min_temp", 2, 1),
            CharacteristicField::unsigned("max_temp", 3, 1),
            CharacteristicField::unsigned("ext1_min_temp", 4, 1),
            CharacteristicField::unsigned("ext1_max_temp", 5, 1),
            CharacteristicField::unsigned("ext2_min_temp", 6, 1),
            CharacteristicField::unsigned("ext2_max_temp", 7, 1),
            CharacteristicField::unsigned("ext3_min_temp", 8, 1),
            CharacteristicField::unsigned("ext3_max_temp", 9, 1),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "led",
        service: COR_CONTROLS_SERVICE,
        characteristic: COR_LED_CHAR,
        direction: Direction::ReadWrite,
        payload_len: 3,
        group: PollGroup::ControlMirror,
        fields: &[CharacteristicField::unsigned("brightness", 2, 1)],
        guard: SYSTEM_POWER_GUARD,
    },
    ChannelDescriptor {
        name: "lcd",
        service: COR_CONTROLS_SERVICE,
        characteristic: COR_LCD_CHAR,
        direction: Direction::ReadWrite,
        payload_len: 3,
        group: PollGroup::ControlMirror,
        fields: &[CharacteristicField::unsigned("brightness", 2, 1)],
        guard: SYSTEM_POWER_GUARD,
    },
    ChannelDescriptor {
        name: "current",
        service: COR_CONTROLS_SERVICE,
        characteristic: COR_CURRENT_CHAR,
        direction: Direction::ReadWrite,
        payload_len: 3,
        group: PollGroup::ControlMirror,
        fields: &[
            CharacteristicField::flag("system_on", 2, 0x01),
            CharacteristicField::flag("ac_on", 2, 0x02),
            CharacteristicField::flag("dc_on", 2, 0x04),
        ],
        guard: SYSTEM_POWER_GUARD,
    },
];

static MPPT_CHANNELS: [ChannelDescriptor; 4] = [
    ChannelDescriptor {
        name: "power_voltage",
        service: MPPT_SERVICE,
        characteristic: MPPT_POWER_VOLTAGE_CHAR,
        direction: Direction::Read,
        payload_len: 6,
        group: PollGroup::Slow,
        fields: &[
            CharacteristicField::unsigned("power", 2, 2),
            CharacteristicField::unsigned("voltage", 4, 2).scaled(Scale::divided(10, 2)),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "temperature",
        service: MPPT_SERVICE,
        characteristic: MPPT_TEMPERATURE_CHAR,
        direction: Direction::Read,
        payload_len: 6,
        group: PollGroup::Primary,
        fields: &[
            CharacteristicField::unsigned("temperature1", 2, 2).scaled(MPPT_TEMPERATURE_SCALE),
            CharacteristicField::unsigned("temperature2", 4, 2).scaled(MPPT_TEMPERATURE_SCALE),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "on_off",
        service: MPPT_CONTROL_SERVICE,
        characteristic: MPPT_ON_OFF_CHAR,
        direction: Direction::ReadWrite,
        payload_len: 4,
        group: PollGroup::ControlMirror,
        fields: &[
            CharacteristicField::unsigned("control", 2, 1),
            CharacteristicField::unsigned("mode", 3, 1),
        ],
        guard: None,
    },
    ChannelDescriptor {
        name: "reset",
        service: MPPT_CONTROL_SERVICE,
        characteristic: MPPT_RESET_CHAR,
        direction: Direction::Write,
        payload_len: 4,
        group: PollGroup::OnDemand,
        fields: &[
            CharacteristicField::unsigned("command", 2, 1),
            CharacteristicField::unsigned("argument", 3, 1),
        ],
        guard: None,
    },
];

static COR_PROFILE: FamilyProfile = FamilyProfile {
    family: DeviceFamily::Cor,
    channels: &COR_CHANNELS,
    record: RecordMapping {
        power: FieldRef { channel: "power_voltage", field: "power" },
        voltage: FieldRef { channel: "power_voltage", field: "voltage" },
        temperature1: FieldRef { channel: "temperature", field: "min_temp" },
        temperature2: FieldRef { channel: "temperature", field: "max_temp" },
    },
};

static MPPT_PROFILE: FamilyProfile = FamilyProfile {
    family: DeviceFamily::Mppt,
    channels: &MPPT_CHANNELS,
    record: RecordMapping {
        power: FieldRef { channel: "power_voltage", field: "power" },
        voltage: FieldRef { channel: "power_voltage", field: "voltage" },
        temperature1: FieldRef { channel: "temperature", field: "temperature1" },
        temperature2: FieldRef { channel: "temperature", field: "temperature2" },
    },
};

pub fn profile(family: DeviceFamily) -> &'static FamilyProfile {
    match family {
        DeviceFamily::Cor => &COR_PROFILE,
        DeviceFamily::Mppt => &MPPT_PROFILE,
    }
}

/// Finds a channel by name within a family.
pub fn lookup(
    family: DeviceFamily,
    name: &str,
) -> Result<&'static ChannelDescriptor, RegistryError> {
    let channel = profile(family)
        .channels
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| RegistryError::ChannelNotFound {
            family,
            channel: name.to_string(),
        })?;
    debug_assert!(channel.validate().is_ok(), "invalid channel layout: {:?}", channel.validate());
    Ok(channel)
}

pub fn channels_in(
    family: DeviceFamily,
    group: PollGroup,
) -> impl Iterator<Item = &'static ChannelDescriptor> {
    profile(family).channels.iter().filter(move |c| c.group == group)
}

/// Every channel with a readable characteristic, in table order.
pub fn readable_channels(family: DeviceFamily) -> impl Iterator<Item = &'static ChannelDescriptor> {
    profile(family).channels.iter().filter(|c| c.direction.is_readable())
}

/// Distinct services a connected peripheral must expose.
pub fn required_services(family: DeviceFamily) -> Vec<Uuid> {
    let mut services: Vec<Uuid> = Vec::new();
    for channel in profile(family).channels {
        if !services.contains(&channel.service) {
            services.push(channel.service);
        }
    }
    services
}
