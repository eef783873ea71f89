//! LeCroy X-Stream dialect (vendor A): every exchange is framed, and each
//! command is followed by a `CMR?` status read against a fixed error table.

use crate::protocol::{parse_definite_block, CommandTable, Scope, Settings, Vendor};
use crate::waveform::{parse_descriptor, WaveformDescriptor, LECROY_FIELDS};
use crate::{Connection, DaqError, Result};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1861;
pub const CHANNELS: u8 = 4;

const STATUS_QUERY: &str = "CMR?";
const TRIGGER: &str = "TRMD SINGLE;ARM;WAIT;*OPC?";

/// Instrument error codes reported by `CMR?`.
pub const ERROR_CODES: &[(i64, &str)] = &[
    (1, "unrecognized command/query header"),
    (2, "illegal header path"),
    (3, "illegal number"),
    (4, "illegal number suffix"),
    (5, "unrecognized keyword"),
    (6, "string error"),
    (7, "GET embedded in another message"),
    (10, "arbitrary data block expected"),
    (
        11,
        "non-digit character in byte count field of arbitrary data block",
    ),
    (12, "EOI detected during definite length data block transfer"),
    (
        13,
        "extra bytes detected during definite length data block transfer",
    ),
];

pub fn error_message(code: i64) -> Option<&'static str> {
    ERROR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, message)| *message)
}

/// Events per trigger from a `SEQUENCE?` reply such as `SEQ ON,10,5E+3`.
pub fn parse_sequence_setting(setting: &str) -> Result<usize> {
    let mode = setting
        .split(',')
        .next()
        .and_then(|head| head.split_whitespace().last())
        .unwrap_or_default();
    if !mode.eq_ignore_ascii_case("ON") {
        return Ok(1);
    }
    let count = setting
        .split(',')
        .nth(1)
        .map(str::trim)
        .and_then(|c| c.parse::<f64>().ok())
        .ok_or_else(|| {
            DaqError::Configuration(format!("cannot read sequence count from '{setting}'"))
        })?;
    if count < 1.0 || count.fract() != 0.0 {
        return Err(DaqError::Configuration(format!(
            "sequence count must be a positive integer, got {count}"
        )));
    }
    Ok(count as usize)
}

/// Value of a `C1:INSP "FIELD : VALUE"` reply.
pub fn parse_inspect_reply(reply: &str) -> &str {
    let inner = match (reply.find('"'), reply.rfind('"')) {
        (Some(open), Some(close)) if close > open => &reply[open + 1..close],
        _ => reply,
    };
    inner
        .split_once(':')
        .map(|(_, value)| value)
        .unwrap_or(inner)
        .trim()
}

pub struct LeCroy {
    conn: Connection,
    commands: CommandTable,
    settle_delay: Duration,
}

impl LeCroy {
    pub fn new(conn: Connection, commands: CommandTable) -> Self {
        Self {
            conn,
            commands,
            settle_delay: Duration::from_secs(5),
        }
    }

    /// Wait applied after the priming trigger before descriptors are valid.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Status check after the last command.
    pub fn check_last_command(&mut self) -> Result<()> {
        let reply = self.query(STATUS_QUERY)?;
        let code = reply
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<i64>().ok());
        let Some(code) = code else {
            warn!("no status code in {STATUS_QUERY} reply {reply:?}");
            return Ok(());
        };

        match error_message(code) {
            Some(message) => {
                self.conn.close();
                Err(DaqError::Instrument {
                    code,
                    message: message.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

impl Scope for LeCroy {
    fn vendor(&self) -> Vendor {
        Vendor::LeCroy
    }

    fn commands(&self) -> &CommandTable {
        &self.commands
    }

    fn command(&mut self, command: &str) -> Result<()> {
        self.conn.send(command)
    }

    fn query(&mut self, query: &str) -> Result<String> {
        self.conn.send(query)?;
        let reply = self.conn.receive()?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    fn check_errors(&mut self) -> Result<()> {
        self.check_last_command()
    }

    fn clear(&mut self) -> Result<()> {
        self.conn.clear().map(|_| ())
    }

    fn set_display(&mut self, on: bool) -> Result<()> {
        self.command(if on { "DISPLAY ON" } else { "DISPLAY OFF" })
    }

    fn active_channels(&mut self) -> Result<Vec<u8>> {
        let mut channels = Vec::new();
        for channel in 1..=CHANNELS {
            let reply = self.query(&format!("C{channel}:TRACE?"))?;
            let state = reply.split_whitespace().last().unwrap_or_default();
            if state.eq_ignore_ascii_case("ON") {
                channels.push(channel);
            }
        }
        debug!("active channels {:?}", channels);
        Ok(channels)
    }

    fn sequence_count(&mut self, settings: &Settings) -> Result<usize> {
        let setting = match settings.get("SEQUENCE") {
            Some(setting) => setting.clone(),
            None => self.query("SEQUENCE?")?,
        };
        parse_sequence_setting(&setting)
    }

    fn prepare(&mut self) -> Result<()> {
        // WAVE_ARRAY_COUNT is only valid once a trigger has been taken.
        self.trigger()?;
        if !self.settle_delay.is_zero() {
            info!("waiting {:?} for the first acquisition", self.settle_delay);
            thread::sleep(self.settle_delay);
        }
        Ok(())
    }

    fn descriptor(&mut self, channel: u8, sequence_count: usize) -> Result<WaveformDescriptor> {
        let mut raw = Vec::with_capacity(LECROY_FIELDS.len());
        for (field, _) in LECROY_FIELDS {
            let reply = self.query(&format!("C{channel}:INSPECT? \"{field}\""))?;
            raw.push((field.to_string(), parse_inspect_reply(&reply).to_string()));
        }
        WaveformDescriptor::lecroy(parse_descriptor(LECROY_FIELDS, &raw)?, sequence_count)
    }

    fn trigger(&mut self) -> Result<()> {
        self.query(TRIGGER).map(|_| ())
    }

    fn read_waveform_block(&mut self, channel: u8, _desc: &WaveformDescriptor) -> Result<Vec<u8>> {
        self.conn.send(&format!("C{channel}:WF? DAT1"))?;
        let reply = self.conn.receive()?;
        Ok(parse_definite_block(&reply)?.to_vec())
    }

    fn close(&mut self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_setting_parses_count() {
        assert_eq!(parse_sequence_setting("SEQ OFF,10,5E+3").unwrap(), 1);
        assert_eq!(parse_sequence_setting("SEQ ON,10,5E+3").unwrap(), 10);
        assert_eq!(parse_sequence_setting("on,4").unwrap(), 4);
    }

    #[test]
    fn non_positive_sequence_fails_fast() {
        assert!(matches!(
            parse_sequence_setting("SEQ ON,0,5E+3"),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            parse_sequence_setting("SEQ ON,-3"),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            parse_sequence_setting("SEQ ON"),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn inspect_reply_value_is_extracted() {
        assert_eq!(
            parse_inspect_reply("C1:INSP \"VERTICAL_GAIN      : 1.2500e-03 \""),
            "1.2500e-03"
        );
        assert_eq!(parse_inspect_reply("\"COMM_TYPE : word\""), "word");
        assert_eq!(parse_inspect_reply("1002"), "1002");
    }

    #[test]
    fn error_table_has_documented_codes() {
        assert_eq!(error_message(5), Some("unrecognized keyword"));
        assert_eq!(error_message(13).map(|m| m.starts_with("extra bytes")), Some(true));
        assert_eq!(error_message(0), None);
        assert_eq!(error_message(8), None);
    }
}
