//! OSRAM RGBW bulb remote (NEC address 0x00)

use std::time::Duration;

use super::IrDevice;
use crate::schema::{FieldSpec, ToolSchema, ValidatedParams};

/// Gap between repeated frames
const REPEAT_GAP: Duration = Duration::from_millis(108);

const ACTIONS: &[(&str, &[&str])] = &[
    ("power", &["on", "off"]),
    ("brightness", &["bright_up", "bright_down"]),
    (
        "color",
        &[
            "red", "green", "blue", "white", "red1", "red2", "red3", "red4", "green1", "green2",
            "green3", "green4", "blue1", "blue2", "blue3", "blue4", "orange", "cyan", "purple",
            "yellow", "pink", "lime", "violet", "magenta",
        ],
    ),
    ("effect", &["flash", "strobe", "smooth", "mode"]),
];

const CODES: &[(&str, u8)] = &[
    ("on", 0x07),
    ("off", 0x06),
    ("bright_up", 0x00),
    ("bright_down", 0x02),
    ("red", 0x08),
    ("green", 0x09),
    ("blue", 0x0A),
    ("white", 0x03),
    ("red1", 0x0C),
    ("green1", 0x0D),
    ("blue1", 0x0E),
    ("flash", 0x0F),
    ("red2", 0x10),
    ("green2", 0x11),
    ("blue2", 0x12),
    ("strobe", 0x13),
    ("red3", 0x14),
    ("green3", 0x15),
    ("blue3", 0x16),
    ("smooth", 0x17),
    ("red4", 0x18),
    ("green4", 0x19),
    ("blue4", 0x1A),
    ("mode", 0x1B),
];

/// Named colors sent as one of the remote's numbered shades
const NAMED_COLORS: &[(&str, &str)] = &[
    ("yellow", "green2"),
    ("orange", "red1"),
    ("purple", "red2"),
    ("pink", "red3"),
    ("cyan", "blue1"),
    ("magenta", "red4"),
    ("lime", "green3"),
    ("violet", "blue2"),
];

const ALIASES: &[(&str, &str)] = &[
    ("power", "on"),
    ("power_on", "on"),
    ("power_off", "off"),
    ("bright+", "bright_up"),
    ("bright-", "bright_down"),
    ("brighter", "bright_up"),
    ("dimmer", "bright_down"),
    ("light_up", "bright_up"),
    ("light_down", "bright_down"),
    ("r", "red"),
    ("g", "green"),
    ("b", "blue"),
    ("w", "white"),
    ("warm_white", "white"),
    ("cool_white", "white"),
    ("navy", "blue"),
    ("teal", "cyan"),
    ("maroon", "red"),
    ("blink", "flash"),
    ("stroboscope", "strobe"),
    ("gradual", "smooth"),
];

/// OSRAM RGBW bulb
#[derive(Debug, Clone, Copy, Default)]
pub struct OsramLight;

impl IrDevice for OsramLight {
    fn description(&self) -> &'static str {
        "Controls the OSRAM RGBW light over infrared: power, brightness, colors and effects"
    }

    fn address(&self) -> u8 {
        0x00
    }

    fn default_pin(&self) -> u8 {
        19
    }

    fn schema(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        for (action, commands) in ACTIONS {
            schema = schema.action(action, commands);
        }
        for (alias, command) in ALIASES {
            schema = schema.alias(alias, command);
        }
        schema.field(
            FieldSpec::integer("repeat_count", 0, 10)
                .describe("Extra sends after the first")
                .default_integer(0),
        )
    }

    fn code(&self, command: &str) -> Option<u8> {
        let command = NAMED_COLORS
            .iter()
            .find(|(name, _)| *name == command)
            .map_or(command, |(_, shade)| *shade);
        CODES
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, code)| *code)
    }

    fn repeats(&self, params: &ValidatedParams) -> (u32, Duration) {
        let extra = params
            .integer("repeat_count")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        (extra + 1, REPEAT_GAP)
    }
}
