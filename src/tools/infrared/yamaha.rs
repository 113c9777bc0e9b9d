//! Yamaha amplifier remote (NEC address 0x78)

use std::time::Duration;

use super::IrDevice;
use crate::schema::{FieldSpec, ToolSchema, ValidatedParams};

/// Gap between the two frames of a double send
const DOUBLE_SEND_GAP: Duration = Duration::from_millis(108);

/// Gap between repeated volume steps
const VOLUME_REPEAT_GAP: Duration = Duration::from_millis(500);

const ACTIONS: &[(&str, &[&str])] = &[
    ("power", &["power"]),
    ("volume", &["vol_up", "vol_down"]),
    ("playback", &["play", "pause", "stop", "ff", "rew"]),
    ("source", &["tuner", "tape", "aux", "md", "dvd", "mode"]),
    ("preset", &["preset_up", "preset_down"]),
    (
        "digit",
        &[
            "digit_0", "digit_1", "digit_2", "digit_3", "digit_4", "digit_5", "digit_6",
            "digit_7", "digit_8", "digit_9",
        ],
    ),
    (
        "function",
        &["random", "repeat", "display", "sleep", "mode_10", "start_100", "time"],
    ),
];

const CODES: &[(&str, u8)] = &[
    ("power", 0x0F),
    ("digit_0", 0x10),
    ("digit_1", 0x11),
    ("digit_2", 0x12),
    ("digit_3", 0x13),
    ("digit_4", 0x14),
    ("digit_5", 0x15),
    ("digit_6", 0x16),
    ("digit_7", 0x17),
    ("digit_8", 0x18),
    ("digit_9", 0x19),
    ("mode_10", 0x1A),
    ("start_100", 0x1D),
    ("repeat", 0x0C),
    ("random", 0x07),
    ("pause", 0x0A),
    ("time", 0x08),
    ("play", 0x02),
    ("rew", 0x04),
    ("stop", 0x01),
    ("ff", 0x03),
    ("preset_down", 0x1C),
    ("tuner", 0x4B),
    ("preset_up", 0x1B),
    ("md", 0x57),
    ("dvd", 0x4A),
    ("tape", 0x41),
    ("aux", 0x49),
    ("mode", 0x05),
    ("sleep", 0x4F),
    ("vol_up", 0x1E),
    ("display", 0x4E),
    ("vol_down", 0x1F),
];

const ALIASES: &[(&str, &str)] = &[
    ("pwr", "power"),
    ("vol+", "vol_up"),
    ("volup", "vol_up"),
    ("vol-", "vol_down"),
    ("voldown", "vol_down"),
    ("forward", "ff"),
    ("rewind", "rew"),
    ("radio", "tuner"),
    ("cd", "mode"),
    ("disc", "mode"),
    ("0", "digit_0"),
    ("1", "digit_1"),
    ("2", "digit_2"),
    ("3", "digit_3"),
    ("4", "digit_4"),
    ("5", "digit_5"),
    ("6", "digit_6"),
    ("7", "digit_7"),
    ("8", "digit_8"),
    ("9", "digit_9"),
];

/// Yamaha amplifier
#[derive(Debug, Clone, Copy, Default)]
pub struct YamahaAmp;

impl IrDevice for YamahaAmp {
    fn description(&self) -> &'static str {
        "Controls the Yamaha amplifier over infrared: power, volume, playback, source, presets, digits and functions"
    }

    fn address(&self) -> u8 {
        0x78
    }

    fn default_pin(&self) -> u8 {
        18
    }

    fn schema(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        for (action, commands) in ACTIONS {
            schema = schema.action(action, commands);
        }
        for (alias, command) in ALIASES {
            schema = schema.alias(alias, command);
        }
        schema
            .field(
                FieldSpec::boolean("double_send")
                    .describe("Send the frame twice for reliability")
                    .default_bool(false)
                    .only_for(&["power"]),
            )
            .field(
                FieldSpec::integer("repeat_count", 1, 10)
                    .describe("Number of volume steps")
                    .default_integer(1)
                    .only_for(&["volume"]),
            )
    }

    fn code(&self, command: &str) -> Option<u8> {
        CODES
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, code)| *code)
    }

    fn repeats(&self, params: &ValidatedParams) -> (u32, Duration) {
        match params.action() {
            Some("power") if params.boolean("double_send") == Some(true) => (2, DOUBLE_SEND_GAP),
            Some("volume") => {
                let count = params
                    .integer("repeat_count")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(1);
                (count, VOLUME_REPEAT_GAP)
            }
            _ => (1, Duration::ZERO),
        }
    }
}
