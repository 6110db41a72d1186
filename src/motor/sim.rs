// MMC-100 controller emulator
//
// Speaks the same ASCII protocol as the hardware through Read + Write, so the
// real transport and axis driver can run against it. Motion is integrated
// against the wall clock at the commanded velocity; acceleration is accepted
// but not modelled. Travel is bounded by per-axis limit switches.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use super::protocol::{Command, StatusWord, um_to_mm};
use super::{AXIS_COUNT, Axis};

/// Default travel between limit switches, in mm
const DEFAULT_TRAVEL_MM: (f64, f64) = (-5.0, 5.0);
const DEFAULT_VELOCITY_MM_S: f64 = 2.0;
const SWITCH_BAND_MM: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct Segment {
    from: f64,
    to: f64,
    velocity: f64,
    started: Instant,
}

impl Segment {
    fn position(&self, now: Instant) -> f64 {
        let span = self.to - self.from;
        let travelled = self.velocity * now.duration_since(self.started).as_secs_f64();
        if travelled >= span.abs() {
            self.to
        } else {
            self.from + travelled * span.signum()
        }
    }

    fn done(&self, now: Instant) -> bool {
        self.position(now) == self.to
    }
}

/// One emulated axis; all positions in machine millimetres
#[derive(Debug, Clone)]
struct SimAxis {
    lower: f64,
    upper: f64,
    zero_offset: f64,
    velocity: f64,
    acceleration: f64,
    feedback: u8,
    rest: f64,
    commanded: f64,
    following_error: f64,
    segment: Option<Segment>,
}

impl Default for SimAxis {
    fn default() -> Self {
        Self {
            lower: DEFAULT_TRAVEL_MM.0,
            upper: DEFAULT_TRAVEL_MM.1,
            zero_offset: 0.0,
            velocity: DEFAULT_VELOCITY_MM_S,
            acceleration: 0.0,
            feedback: 0,
            rest: 0.0,
            commanded: 0.0,
            following_error: 0.0,
            segment: None,
        }
    }
}

impl SimAxis {
    fn machine_position(&self, now: Instant) -> f64 {
        match self.segment {
            Some(segment) => segment.position(now),
            None => self.rest,
        }
    }

    /// Fold a finished segment into the resting position
    fn settle(&mut self, now: Instant) {
        if let Some(segment) = self.segment {
            if segment.done(now) {
                self.rest = segment.to + self.following_error;
                self.segment = None;
            }
        }
    }

    fn start(&mut self, target: f64, now: Instant) {
        let from = self.machine_position(now);
        let to = target.clamp(self.lower, self.upper);
        self.commanded = to;
        self.segment = Some(Segment {
            from,
            to,
            velocity: self.velocity.max(f64::MIN_POSITIVE),
            started: now,
        });
    }

    fn halt(&mut self, now: Instant) {
        self.rest = self.machine_position(now);
        self.commanded = self.rest;
        self.segment = None;
    }

    fn status(&self, now: Instant) -> StatusWord {
        let position = self.machine_position(now);
        let mut status = if self.segment.is_some() {
            StatusWord::CONSTANT_VELOCITY
        } else {
            StatusWord::STATIONARY
        };
        if position <= self.lower + SWITCH_BAND_MM {
            status |= StatusWord::NEGATIVE_SWITCH;
        }
        if position >= self.upper - SWITCH_BAND_MM {
            status |= StatusWord::POSITIVE_SWITCH;
        }
        status
    }

    fn apply(&mut self, command: Command, now: Instant) -> Option<String> {
        self.settle(now);
        match command {
            Command::Status => return Some(self.status(now).bits().to_string()),
            Command::Position => {
                let theoretical = self.commanded - self.zero_offset;
                let actual = self.machine_position(now) - self.zero_offset;
                return Some(format!("{theoretical:.6},{actual:.6}"));
            }
            Command::Zero => {
                self.halt(now);
                self.zero_offset = self.rest;
            }
            Command::MoveAbsolute(mm) => self.start(mm + self.zero_offset, now),
            Command::MoveRelative(mm) => {
                let here = self.machine_position(now);
                self.start(here + mm, now);
            }
            Command::Stop | Command::Abort => self.halt(now),
            Command::Velocity(v) => self.velocity = v,
            Command::Acceleration(a) => self.acceleration = a,
            Command::MoveToPositiveLimit => self.start(self.upper, now),
            Command::MoveToNegativeLimit => self.start(self.lower, now),
            Command::Feedback(mode) => self.feedback = mode,
        }
        None
    }
}

struct SimBus {
    axes: [SimAxis; AXIS_COUNT],
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    silent: bool,
    unplugged: bool,
}

impl SimBus {
    fn process_line(&mut self, line: &str) {
        let line = line.trim();
        let mut chars = line.chars();
        let Some(index) = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .and_then(|d| (d as usize).checked_sub(1))
            .filter(|&i| i < AXIS_COUNT)
        else {
            debug!("sim: ignoring line '{}'", line);
            return;
        };
        let Some(command) = Command::decode(chars.as_str()) else {
            debug!("sim: unknown command '{}'", line);
            return;
        };

        let reply = self.axes[index].apply(command, Instant::now());
        if let Some(reply) = reply {
            if !self.silent {
                self.outbox.extend(format!("#{reply}\r\n").bytes());
            }
        }
    }
}

/// In-process stand-in for the controller, cheap to clone.
///
/// Every clone drives the same emulated hardware, so a test can keep one handle
/// for fault injection while the transport owns another.
#[derive(Clone)]
pub struct SimulatedController {
    bus: Arc<Mutex<SimBus>>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(SimBus {
                axes: Default::default(),
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                silent: false,
                unplugged: false,
            })),
        }
    }

    fn bus(&self) -> MutexGuard<'_, SimBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the limit-switch positions for one axis, in micrometres
    pub fn with_travel(self, axis: Axis, lower_um: f64, upper_um: f64) -> Self {
        {
            let mut bus = self.bus();
            let sim = &mut bus.axes[axis.to_index()];
            sim.lower = um_to_mm(lower_um);
            sim.upper = um_to_mm(upper_um);
            sim.rest = sim.rest.clamp(sim.lower, sim.upper);
            sim.commanded = sim.rest;
        }
        self
    }

    /// Stop answering queries (commands are still executed)
    pub fn set_silent(&self, silent: bool) {
        self.bus().silent = silent;
    }

    /// Make every subsequent read and write fail like a pulled cable
    pub fn unplug(&self) {
        self.bus().unplugged = true;
    }

    /// Offset added to the settled position after each move, in micrometres
    pub fn set_following_error(&self, axis: Axis, error_um: f64) {
        self.bus().axes[axis.to_index()].following_error = um_to_mm(error_um);
    }

    /// Last velocity written with VEL, in mm/s
    pub fn velocity_mm_s(&self, axis: Axis) -> f64 {
        self.bus().axes[axis.to_index()].velocity
    }

    /// Feedback mode written with FBK
    pub fn feedback_mode(&self, axis: Axis) -> u8 {
        self.bus().axes[axis.to_index()].feedback
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for SimulatedController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bus = self.bus();
        if bus.unplugged {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "controller unplugged"));
        }
        if bus.outbox.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no reply pending"));
        }
        let mut n = 0;
        while n < buf.len() {
            match bus.outbox.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for SimulatedController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bus = self.bus();
        if bus.unplugged {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "controller unplugged"));
        }
        bus.inbox.extend_from_slice(buf);

        // Commands end in "\n\r"
        while let Some(end) = bus.inbox.windows(2).position(|w| w == b"\n\r") {
            let line: Vec<u8> = bus.inbox.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&line[..end]).into_owned();
            bus.process_line(&text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn exchange(sim: &mut SimulatedController, line: &str) -> String {
        sim.write_all(line.as_bytes()).unwrap();
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while let Ok(1) = sim.read(&mut byte) {
            out.push(byte[0]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_status_and_position_replies() {
        let mut sim = SimulatedController::new();
        assert_eq!(exchange(&mut sim, "1STA? \n\r"), "#8\r\n");
        assert_eq!(exchange(&mut sim, "1POS? \n\r"), "#0.000000,0.000000\r\n");
        // Commands without a reply produce nothing
        assert_eq!(exchange(&mut sim, "1FBK3 \n\r"), "");
        assert_eq!(sim.feedback_mode(Axis::X), 3);
    }

    #[test]
    fn test_move_completes_at_velocity() {
        let mut sim = SimulatedController::new();
        exchange(&mut sim, "2VEL100.000000 \n\r");
        exchange(&mut sim, "2MVA1.000000 \n\r");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(exchange(&mut sim, "2STA? \n\r"), "#8\r\n");
        assert_eq!(exchange(&mut sim, "2POS? \n\r"), "#1.000000,1.000000\r\n");
    }

    #[test]
    fn test_limits_and_zero() {
        let mut sim = SimulatedController::new().with_travel(Axis::Z, -1000.0, 2000.0);
        exchange(&mut sim, "3VEL1000.000000 \n\r");
        exchange(&mut sim, "3MLP \n\r");
        std::thread::sleep(Duration::from_millis(20));
        // Stationary + positive switch
        assert_eq!(exchange(&mut sim, "3STA? \n\r"), "#10\r\n");

        exchange(&mut sim, "3ZRO \n\r");
        assert_eq!(exchange(&mut sim, "3POS? \n\r"), "#0.000000,0.000000\r\n");

        // Absolute moves are clamped to the switches
        exchange(&mut sim, "3MVA1.000000 \n\r");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(exchange(&mut sim, "3POS? \n\r"), "#0.000000,0.000000\r\n");
    }

    #[test]
    fn test_stop_freezes_motion() {
        let mut sim = SimulatedController::new();
        exchange(&mut sim, "1VEL0.010000 \n\r");
        exchange(&mut sim, "1MVR4.000000 \n\r");
        assert_eq!(exchange(&mut sim, "1STA? \n\r"), "#32\r\n");
        exchange(&mut sim, "1STP \n\r");
        assert_eq!(exchange(&mut sim, "1STA? \n\r"), "#8\r\n");
    }

    #[test]
    fn test_fault_injection() {
        let mut sim = SimulatedController::new();
        sim.set_silent(true);
        assert_eq!(exchange(&mut sim, "1STA? \n\r"), "");
        sim.set_silent(false);

        sim.unplug();
        assert!(sim.write_all(b"1STA? \n\r").is_err());
    }
}
