// Micronix MMC-100 serial vocabulary
//
// ASCII, line oriented. Every command is "<axis><verb>[<arg>]" followed by " \n\r".
// Replies are a single line prefixed with '#' and terminated by CR/LF.
// The controller works in millimetres; the rest of the crate works in micrometres.

use bitflags::bitflags;

use crate::error::{Result, StageError};

/// Default serial configuration for the MMC-100 daisy chain
pub const DEFAULT_BAUDRATE: u32 = 38_400;

/// Appended to every command
pub const COMMAND_TERMINATOR: &str = " \n\r";

/// Leading marker on every reply
const REPLY_MARKER: char = '#';

/// Micrometres per controller unit (mm)
pub const UM_PER_MM: f64 = 1000.0;

/// Closed-loop feedback mode selected on connect
pub const FEEDBACK_CLOSED_LOOP: u8 = 3;

/// Command verbs understood by the controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// STA? - status byte
    Status,
    /// POS? - "theoretical,actual" in mm
    Position,
    /// ZRO - current position becomes zero
    Zero,
    /// MVA - move absolute (mm)
    MoveAbsolute(f64),
    /// MVR - move relative (mm)
    MoveRelative(f64),
    /// STP - decelerating stop
    Stop,
    /// ABT - abort all motion immediately
    Abort,
    /// VEL - velocity (mm/s)
    Velocity(f64),
    /// ACC - acceleration (mm/s^2)
    Acceleration(f64),
    /// MLP - drive to the positive limit switch
    MoveToPositiveLimit,
    /// MLN - drive to the negative limit switch
    MoveToNegativeLimit,
    /// FBK - feedback mode
    Feedback(u8),
}

impl Command {
    /// Wire text without axis prefix or terminator
    pub fn encode(&self) -> String {
        match *self {
            Command::Status => "STA?".to_string(),
            Command::Position => "POS?".to_string(),
            Command::Zero => "ZRO".to_string(),
            Command::MoveAbsolute(mm) => format!("MVA{mm:.6}"),
            Command::MoveRelative(mm) => format!("MVR{mm:.6}"),
            Command::Stop => "STP".to_string(),
            Command::Abort => "ABT".to_string(),
            Command::Velocity(v) => format!("VEL{v:.6}"),
            Command::Acceleration(a) => format!("ACC{a:.6}"),
            Command::MoveToPositiveLimit => "MLP".to_string(),
            Command::MoveToNegativeLimit => "MLN".to_string(),
            Command::Feedback(mode) => format!("FBK{mode}"),
        }
    }

    /// Parse the text after the axis prefix (used by the emulator)
    pub fn decode(text: &str) -> Option<Command> {
        let text = text.trim();
        if !text.is_char_boundary(3.min(text.len())) {
            return None;
        }
        let (verb, arg) = text.split_at(text.len().min(3));
        let number = || arg.trim().parse::<f64>().ok();
        let command = match verb {
            "STA" if arg == "?" => Command::Status,
            "POS" if arg == "?" => Command::Position,
            "ZRO" => Command::Zero,
            "MVA" => Command::MoveAbsolute(number()?),
            "MVR" => Command::MoveRelative(number()?),
            "STP" => Command::Stop,
            "ABT" => Command::Abort,
            "VEL" => Command::Velocity(number()?),
            "ACC" => Command::Acceleration(number()?),
            "MLP" => Command::MoveToPositiveLimit,
            "MLN" => Command::MoveToNegativeLimit,
            "FBK" => Command::Feedback(arg.trim().parse().ok()?),
            _ => return None,
        };
        Some(command)
    }

    /// Whether the controller answers this verb
    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::Status | Command::Position)
    }
}

/// Full command line for one axis
pub fn frame(prefix: u8, command: &str) -> String {
    format!("{prefix}{command}{COMMAND_TERMINATOR}")
}

bitflags! {
    /// Controller status byte (STA?)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u8 {
        const NEGATIVE_SWITCH = 1 << 0;
        const POSITIVE_SWITCH = 1 << 1;
        const PROGRAM_RUNNING = 1 << 2;
        const STATIONARY = 1 << 3;
        const DECELERATING = 1 << 4;
        const CONSTANT_VELOCITY = 1 << 5;
        const ACCELERATING = 1 << 6;
        const ERROR = 1 << 7;
    }
}

impl StatusWord {
    /// Bit 3: motion complete / in position
    pub fn is_stationary(self) -> bool {
        self.contains(StatusWord::STATIONARY)
    }

    pub fn at_limit(self) -> bool {
        self.intersects(StatusWord::NEGATIVE_SWITCH | StatusWord::POSITIVE_SWITCH)
    }
}

/// Remove the reply marker and framing whitespace
pub fn strip_reply(raw: &str) -> &str {
    raw.trim().trim_start_matches(REPLY_MARKER).trim()
}

/// Parse a STA? reply such as "#8"
pub fn parse_status(raw: &str) -> Result<StatusWord> {
    let text = strip_reply(raw);
    let value: u8 = text
        .parse()
        .map_err(|_| StageError::Transport(format!("malformed status reply '{raw}'")))?;
    Ok(StatusWord::from_bits_retain(value))
}

/// Parse a POS? reply such as "#1.250000,1.249870" into (theoretical, actual) micrometres
pub fn parse_position(raw: &str) -> Result<(f64, f64)> {
    let text = strip_reply(raw);
    let mut fields = text.split(',').map(str::trim);
    let mut next = || -> Result<f64> {
        fields
            .next()
            .and_then(|f| f.parse::<f64>().ok())
            .ok_or_else(|| StageError::Transport(format!("malformed position reply '{raw}'")))
    };
    let theoretical = next()?;
    let actual = next()?;
    Ok((mm_to_um(theoretical), mm_to_um(actual)))
}

pub fn um_to_mm(um: f64) -> f64 {
    um / UM_PER_MM
}

pub fn mm_to_um(mm: f64) -> f64 {
    mm * UM_PER_MM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_commands() {
        assert_eq!(Command::Status.encode(), "STA?");
        assert_eq!(Command::MoveAbsolute(1.5).encode(), "MVA1.500000");
        assert_eq!(Command::MoveRelative(-0.25).encode(), "MVR-0.250000");
        assert_eq!(Command::Velocity(2.0).encode(), "VEL2.000000");
        assert_eq!(Command::Feedback(FEEDBACK_CLOSED_LOOP).encode(), "FBK3");
    }

    #[test]
    fn test_frame() {
        // Axis 2, absolute move to 1 mm
        let line = frame(2, &Command::MoveAbsolute(1.0).encode());
        assert_eq!(line, "2MVA1.000000 \n\r");
        assert!(line.ends_with(COMMAND_TERMINATOR));
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(Command::decode("STA?"), Some(Command::Status));
        assert_eq!(Command::decode("MVA-1.500000"), Some(Command::MoveAbsolute(-1.5)));
        assert_eq!(Command::decode("FBK3"), Some(Command::Feedback(3)));
        assert_eq!(Command::decode("MLN"), Some(Command::MoveToNegativeLimit));
        assert_eq!(Command::decode("MVAxyz"), None);
        assert_eq!(Command::decode("WAT"), None);
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status("#8\r\n").unwrap();
        assert!(status.is_stationary());
        assert!(!status.at_limit());

        // Stationary at the positive switch
        let status = parse_status("#10").unwrap();
        assert!(status.is_stationary());
        assert!(status.contains(StatusWord::POSITIVE_SWITCH));

        // Accelerating
        let status = parse_status("#64").unwrap();
        assert!(!status.is_stationary());

        assert!(parse_status("#").is_err());
        assert!(parse_status("#abc").is_err());
    }

    #[test]
    fn test_parse_position() {
        let (theoretical, actual) = parse_position("#1.250000,1.249870\n\r").unwrap();
        assert!((theoretical - 1250.0).abs() < 1e-6);
        assert!((actual - 1249.87).abs() < 1e-6);

        assert!(parse_position("#1.0").is_err());
        assert!(parse_position("").is_err());
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(um_to_mm(2500.0), 2.5);
        assert_eq!(mm_to_um(0.001), 1.0);
    }
}
