//! Tektronix dialect (vendor B): unframed ASCII lines, `#<d><count>` binary
//! curves, and acquisition completion detected by polling `ACQUIRE:STATE?`.

use crate::protocol::{parse_byte_count, CommandTable, Scope, Settings, Vendor};
use crate::waveform::{parse_descriptor, split_preamble, WaveformDescriptor, TEKTRONIX_FIELDS};
use crate::{Connection, DaqError, Result};
use log::debug;
use std::thread;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4000;

/// IEEE 488.2 standard event status bits that signal a rejected command.
const ESR_ERRORS: &[(u16, &str)] = &[
    (1 << 5, "command error"),
    (1 << 4, "execution error"),
    (1 << 3, "device error"),
    (1 << 2, "query error"),
];

/// Leading integer of a reply that may carry a `:HEADER ` style prefix.
pub fn parse_state(reply: &str) -> Option<i64> {
    reply
        .split_whitespace()
        .last()
        .and_then(|token| token.parse::<i64>().ok())
}

/// Displayed channel numbers from a header-on `SELECT?` reply.
pub fn parse_select_reply(reply: &str) -> Vec<u8> {
    reply
        .trim()
        .split(';')
        .filter_map(|item| {
            let item = item.trim().trim_start_matches(":SELECT:");
            let (name, state) = item.split_once(' ')?;
            let channel = name
                .strip_prefix("CH")
                .or_else(|| name.strip_prefix("ch"))?
                .parse::<u8>()
                .ok()?;
            match state.trim().parse::<i64>() {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(channel),
            }
        })
        .collect()
}

pub struct Tektronix {
    conn: Connection,
    commands: CommandTable,
    poll_interval: Duration,
    max_polls: usize,
}

impl Tektronix {
    pub fn new(conn: Connection, commands: CommandTable) -> Self {
        Self {
            conn,
            commands,
            poll_interval: Duration::ZERO,
            max_polls: 100_000,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    /// Poll the acquisition state until the instrument reports idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        for _ in 0..self.max_polls {
            let reply = self.query("ACQUIRE:STATE?")?;
            match parse_state(&reply) {
                Some(0) => return Ok(()),
                Some(_) => {}
                None => return Err(DaqError::reply("ACQUIRE:STATE?", &reply)),
            }
            if !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
        }
        Err(DaqError::TransportTimeout {
            operation: "acquisition",
        })
    }

    /// Read a `#<d><count><bytes>\n` block straight from the socket.
    fn read_block(&mut self) -> Result<Vec<u8>> {
        let marker = self.conn.read_byte()?;
        if marker != b'#' {
            return Err(DaqError::Framing(format!(
                "expected '#' block marker, got {:?}",
                marker as char
            )));
        }
        let digits = match self.conn.read_byte()? {
            d @ b'1'..=b'9' => usize::from(d - b'0'),
            d => {
                return Err(DaqError::Framing(format!(
                    "bad block length digit {:?}",
                    d as char
                )))
            }
        };
        let count = parse_byte_count(&self.conn.read_exact(digits)?)?;
        let data = self.conn.read_exact(count)?;
        let eom = self.conn.read_byte()?;
        if eom != b'\n' {
            return Err(DaqError::Framing(format!(
                "block not terminated by newline, got {:?}",
                eom as char
            )));
        }
        Ok(data)
    }

    fn with_header<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.command("HEADER 1")?;
        let out = f(self);
        self.command("HEADER 0")?;
        out
    }
}

impl Scope for Tektronix {
    fn vendor(&self) -> Vendor {
        Vendor::Tektronix
    }

    fn commands(&self) -> &CommandTable {
        &self.commands
    }

    fn command(&mut self, command: &str) -> Result<()> {
        self.conn.write_line(command)
    }

    fn query(&mut self, query: &str) -> Result<String> {
        self.conn.write_line(query)?;
        Ok(self.conn.read_line()?.trim().to_string())
    }

    fn check_errors(&mut self) -> Result<()> {
        let reply = self.query("*ESR?")?;
        let esr = parse_state(&reply)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| DaqError::reply("*ESR?", &reply))?;
        let flagged: Vec<&str> = ESR_ERRORS
            .iter()
            .filter(|(bit, _)| esr & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if flagged.is_empty() {
            Ok(())
        } else {
            Err(DaqError::Instrument {
                code: i64::from(esr),
                message: flagged.join(", "),
            })
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.conn.clear()?;
        self.command("*CLS")
    }

    fn set_display(&mut self, on: bool) -> Result<()> {
        self.command(if on {
            "DISPLAY:WAVEFORM ON"
        } else {
            "DISPLAY:WAVEFORM OFF"
        })
    }

    fn active_channels(&mut self) -> Result<Vec<u8>> {
        let reply = self.with_header(|scope| scope.query("SELECT?"))?;
        let channels = parse_select_reply(&reply);
        debug!("active channels {:?}", channels);
        Ok(channels)
    }

    fn sequence_count(&mut self, _settings: &Settings) -> Result<usize> {
        let state = self.query("HORIZONTAL:FASTFRAME:STATE?")?;
        match parse_state(&state) {
            Some(0) => return Ok(1),
            Some(_) => {}
            None => return Err(DaqError::reply("HORIZONTAL:FASTFRAME:STATE?", &state)),
        }
        let count = self.query("HORIZONTAL:FASTFRAME:COUNT?")?;
        match parse_state(&count) {
            Some(n) if n >= 1 => Ok(n as usize),
            Some(n) => Err(DaqError::Configuration(format!(
                "fastframe count must be a positive number, got {n}"
            ))),
            None => Err(DaqError::reply("HORIZONTAL:FASTFRAME:COUNT?", &count)),
        }
    }

    fn prepare(&mut self) -> Result<()> {
        self.command("ACQUIRE:STOPAFTER SEQUENCE")?;
        self.command("HEADER 0")?;
        self.command("WFMPRE:PT_FMT Y")
    }

    fn descriptor(&mut self, channel: u8, sequence_count: usize) -> Result<WaveformDescriptor> {
        let reply = self.with_header(|scope| {
            scope.command(&format!("DATA:SOURCE CH{channel}"))?;
            scope.query("WFMPRE?")
        })?;
        let raw = split_preamble(&reply)?;
        WaveformDescriptor::tektronix(parse_descriptor(TEKTRONIX_FIELDS, &raw)?, sequence_count)
    }

    fn trigger(&mut self) -> Result<()> {
        self.command("ACQUIRE:STATE RUN")?;
        self.wait_idle()
    }

    fn read_waveform_block(&mut self, channel: u8, _desc: &WaveformDescriptor) -> Result<Vec<u8>> {
        self.command(&format!("DATA:SOURCE CH{channel}"))?;
        self.conn.write_line("CURVE?")?;
        self.read_block()
    }

    fn close(&mut self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_reply_lists_displayed_channels() {
        let reply = ":SELECT:CH1 1;CH2 0;CH3 1;CH4 0;MATH 0;REF1 0";
        assert_eq!(parse_select_reply(reply), vec![1, 3]);
    }

    #[test]
    fn state_reply_with_or_without_header() {
        assert_eq!(parse_state(":ACQUIRE:STATE 1"), Some(1));
        assert_eq!(parse_state("0"), Some(0));
        assert_eq!(parse_state("RUN"), None);
    }
}
