//! Serial bus decoding for protocol triggers.
//!
//! Analog samples are sliced into logic levels with the rule's threshold, decoded
//! into bytes, and matched against the rule. Supported buses are UART, I2C and SPI
//! (mode 0: MOSI sampled on rising clock edges). CAN and LIN rules can be expressed
//! and persisted but are rejected when a trigger tree is built.

use super::evaluator::ChannelSnapshot;
use super::default_logic_threshold;
use crate::error::{AppResult, AutomationError};
use crate::instrument::{ChannelId, Waveform};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Uart,
    I2c,
    Spi,
    Can,
    Lin,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Uart => "UART",
            ProtocolKind::I2c => "I2C",
            ProtocolKind::Spi => "SPI",
            ProtocolKind::Can => "CAN",
            ProtocolKind::Lin => "LIN",
        };
        f.write_str(name)
    }
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

/// Match a byte sequence on an asynchronous serial line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UartRule {
    pub channel: ChannelId,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Bytes that must appear consecutively.
    pub pattern: Vec<u8>,
    #[serde(default = "default_logic_threshold")]
    pub threshold: f64,
    /// Idle (mark) level is high, the usual TTL convention.
    #[serde(default = "default_true")]
    pub idle_high: bool,
}

/// Match an I2C transfer to `address`, optionally followed by `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct I2cRule {
    pub sda: ChannelId,
    pub scl: ChannelId,
    /// 7-bit address
    pub address: u8,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default = "default_logic_threshold")]
    pub threshold: f64,
}

/// Match a byte sequence within one SPI chip-select frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiRule {
    pub clk: ChannelId,
    pub mosi: ChannelId,
    #[serde(default)]
    pub cs: Option<ChannelId>,
    pub data: Vec<u8>,
    #[serde(default = "default_logic_threshold")]
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub cs_active_low: bool,
    #[serde(default = "default_true")]
    pub msb_first: bool,
}

/// Decode rule of a protocol trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolRule {
    Uart(UartRule),
    I2c(I2cRule),
    Spi(SpiRule),
    Can { channel: ChannelId, identifier: u32 },
    Lin { channel: ChannelId, identifier: u8 },
}

impl ProtocolRule {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolRule::Uart(_) => ProtocolKind::Uart,
            ProtocolRule::I2c(_) => ProtocolKind::I2c,
            ProtocolRule::Spi(_) => ProtocolKind::Spi,
            ProtocolRule::Can { .. } => ProtocolKind::Can,
            ProtocolRule::Lin { .. } => ProtocolKind::Lin,
        }
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        match self {
            ProtocolRule::Uart(rule) => vec![rule.channel],
            ProtocolRule::I2c(rule) => vec![rule.sda, rule.scl],
            ProtocolRule::Spi(rule) => {
                let mut channels = vec![rule.clk, rule.mosi];
                channels.extend(rule.cs);
                channels
            }
            ProtocolRule::Can { channel, .. } | ProtocolRule::Lin { channel, .. } => vec![*channel],
        }
    }

    /// Configuration check performed when the owning tree is built.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            ProtocolRule::Uart(rule) => {
                if rule.baud_rate == 0 {
                    return Err(config_error("UART baud rate must be positive"));
                }
                if !(5..=8).contains(&rule.data_bits) {
                    return Err(config_error(format!(
                        "UART data bits must be between 5 and 8, got {}",
                        rule.data_bits
                    )));
                }
                if !(1..=2).contains(&rule.stop_bits) {
                    return Err(config_error(format!(
                        "UART stop bits must be 1 or 2, got {}",
                        rule.stop_bits
                    )));
                }
                if rule.pattern.is_empty() {
                    return Err(config_error("UART trigger pattern is empty"));
                }
                Ok(())
            }
            ProtocolRule::I2c(rule) => {
                if rule.address > 0x7f {
                    return Err(config_error(format!(
                        "I2C address 0x{:02x} exceeds 7 bits",
                        rule.address
                    )));
                }
                Ok(())
            }
            ProtocolRule::Spi(rule) => {
                if rule.data.is_empty() {
                    return Err(config_error("SPI trigger data is empty"));
                }
                Ok(())
            }
            ProtocolRule::Can { .. } | ProtocolRule::Lin { .. } => Err(config_error(format!(
                "{} protocol triggers are not supported",
                self.kind()
            ))),
        }
    }

    /// Timestamps at which the rule matched, in ascending order.
    ///
    /// A missing channel yields no matches.
    pub fn match_times(&self, snapshot: &ChannelSnapshot) -> Vec<f64> {
        match self {
            ProtocolRule::Uart(rule) => snapshot
                .get(rule.channel)
                .map(|w| {
                    let bytes = decode_uart(rule, w);
                    subsequence_end_times(&bytes, &rule.pattern)
                })
                .unwrap_or_default(),
            ProtocolRule::I2c(rule) => match (snapshot.get(rule.sda), snapshot.get(rule.scl)) {
                (Some(sda), Some(scl)) => decode_i2c(rule, sda, scl)
                    .iter()
                    .filter_map(|frame| frame.match_time(rule))
                    .collect(),
                _ => Vec::new(),
            },
            ProtocolRule::Spi(rule) => {
                let cs = match rule.cs {
                    Some(cs) => match snapshot.get(cs) {
                        Some(w) => Some(w),
                        None => return Vec::new(),
                    },
                    None => None,
                };
                match (snapshot.get(rule.clk), snapshot.get(rule.mosi)) {
                    (Some(clk), Some(mosi)) => {
                        let mut times: Vec<f64> = decode_spi(rule, clk, mosi, cs)
                            .iter()
                            .flat_map(|frame| subsequence_end_times(frame, &rule.data))
                            .collect();
                        times.sort_by(f64::total_cmp);
                        times
                    }
                    _ => Vec::new(),
                }
            }
            ProtocolRule::Can { .. } | ProtocolRule::Lin { .. } => Vec::new(),
        }
    }
}

fn config_error(message: impl Into<String>) -> AutomationError {
    AutomationError::Configuration(message.into())
}

/// A decoded byte and the time at which its last bit was sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedByte {
    pub value: u8,
    pub timestamp: f64,
}

fn logic_levels(waveform: &Waveform, threshold: f64) -> Vec<bool> {
    waveform.samples.iter().map(|s| *s > threshold).collect()
}

fn subsequence_end_times(bytes: &[DecodedByte], pattern: &[u8]) -> Vec<f64> {
    if pattern.is_empty() || bytes.len() < pattern.len() {
        return Vec::new();
    }
    bytes
        .windows(pattern.len())
        .filter(|window| window.iter().map(|b| b.value).eq(pattern.iter().copied()))
        .map(|window| window[window.len() - 1].timestamp)
        .collect()
}

/// Decodes UART frames (start bit, LSB-first data, optional parity, stop bits).
///
/// Frames with a parity or framing error are dropped.
pub fn decode_uart(rule: &UartRule, waveform: &Waveform) -> Vec<DecodedByte> {
    let dt = waveform.sample_interval;
    if dt <= 0.0 || rule.baud_rate == 0 {
        return Vec::new();
    }
    let samples_per_bit = 1.0 / (f64::from(rule.baud_rate) * dt);
    if samples_per_bit < 2.0 {
        return Vec::new();
    }
    // true = mark (idle) level
    let mark: Vec<bool> = logic_levels(waveform, rule.threshold)
        .into_iter()
        .map(|high| high == rule.idle_high)
        .collect();
    let data_bits = usize::from(rule.data_bits);
    let parity_bits = usize::from(rule.parity != Parity::None);
    let frame_bits = 1 + data_bits + parity_bits + usize::from(rule.stop_bits);

    let mut decoded = Vec::new();
    let mut i = 1;
    while i < mark.len() {
        if !(mark[i - 1] && !mark[i]) {
            i += 1;
            continue;
        }
        let start = i as f64;
        let bit_at = |bit: usize| -> Option<bool> {
            let position = (start + (bit as f64 + 0.5) * samples_per_bit).floor() as usize;
            mark.get(position).copied()
        };
        let Some(last) = bit_at(frame_bits - 1) else {
            break; // frame runs past the record
        };

        let mut valid = bit_at(0) == Some(false) && last;
        let mut value = 0u16;
        for k in 0..data_bits {
            if bit_at(1 + k) == Some(true) {
                value |= 1 << k;
            }
        }
        if parity_bits == 1 {
            let parity_bit = bit_at(1 + data_bits) == Some(true);
            let ones = value.count_ones() + u32::from(parity_bit);
            valid &= match rule.parity {
                Parity::Even => ones % 2 == 0,
                Parity::Odd => ones % 2 == 1,
                Parity::None => true,
            };
        }
        for s in 0..usize::from(rule.stop_bits) {
            valid &= bit_at(1 + data_bits + parity_bits + s) == Some(true);
        }

        if valid {
            let end = start + frame_bits as f64 * samples_per_bit;
            decoded.push(DecodedByte {
                value: (value & 0xff) as u8,
                timestamp: waveform.start_time + end * dt,
            });
        }
        // resume inside the last stop bit so the next start edge is found
        i = (start + (frame_bits as f64 - 0.5) * samples_per_bit).ceil() as usize;
    }
    decoded
}

/// One I2C transfer between a START (or repeated START) and the next STOP/START.
#[derive(Debug, Clone, PartialEq)]
pub struct I2cFrame {
    pub start_time: f64,
    /// All bytes including the address byte, each followed by its ACK clock.
    pub bytes: Vec<DecodedByte>,
}

impl I2cFrame {
    /// 7-bit address from the first byte.
    pub fn address(&self) -> Option<u8> {
        self.bytes.first().map(|b| b.value >> 1)
    }

    pub fn is_read(&self) -> Option<bool> {
        self.bytes.first().map(|b| b.value & 1 == 1)
    }

    fn match_time(&self, rule: &I2cRule) -> Option<f64> {
        if self.address()? != rule.address || self.bytes.len() < 1 + rule.data.len() {
            return None;
        }
        let payload = &self.bytes[1..=rule.data.len()];
        if payload.iter().map(|b| b.value).eq(rule.data.iter().copied()) {
            Some(self.bytes[rule.data.len()].timestamp)
        } else {
            None
        }
    }
}

/// Decodes I2C frames. Bits are sampled on SCL rising edges; 8 data bits MSB first
/// are followed by one ACK bit.
pub fn decode_i2c(rule: &I2cRule, sda: &Waveform, scl: &Waveform) -> Vec<I2cFrame> {
    let s = logic_levels(sda, rule.threshold);
    let c = logic_levels(scl, rule.threshold);
    let n = s.len().min(c.len());

    let mut frames = Vec::new();
    let mut current: Option<I2cFrame> = None;
    let mut bits: Vec<bool> = Vec::with_capacity(9);
    for i in 1..n {
        let clock_high = c[i - 1] && c[i];
        if clock_high && s[i - 1] && !s[i] {
            frames.extend(current.take());
            current = Some(I2cFrame {
                start_time: sda.timestamp(i),
                bytes: Vec::new(),
            });
            bits.clear();
        } else if clock_high && !s[i - 1] && s[i] {
            frames.extend(current.take());
            bits.clear();
        } else if !c[i - 1] && c[i] {
            if let Some(frame) = current.as_mut() {
                bits.push(s[i]);
                if bits.len() == 9 {
                    let value = bits[..8]
                        .iter()
                        .fold(0u8, |acc, bit| (acc << 1) | u8::from(*bit));
                    frame.bytes.push(DecodedByte {
                        value,
                        timestamp: sda.timestamp(i),
                    });
                    bits.clear();
                }
            }
        }
    }
    frames.extend(current);
    frames
}

/// Decodes SPI frames delimited by chip select (or one frame without chip select).
pub fn decode_spi(
    rule: &SpiRule,
    clk: &Waveform,
    mosi: &Waveform,
    cs: Option<&Waveform>,
) -> Vec<Vec<DecodedByte>> {
    let c = logic_levels(clk, rule.threshold);
    let d = logic_levels(mosi, rule.threshold);
    let select = cs.map(|w| logic_levels(w, rule.threshold));
    let mut n = c.len().min(d.len());
    if let Some(select) = &select {
        n = n.min(select.len());
    }
    let active = |i: usize| match &select {
        Some(levels) => levels[i] != rule.cs_active_low,
        None => true,
    };

    let mut frames = Vec::new();
    let mut frame: Vec<DecodedByte> = Vec::new();
    let mut bits: Vec<bool> = Vec::with_capacity(8);
    for i in 1..n {
        if !active(i) {
            if !frame.is_empty() {
                frames.push(std::mem::take(&mut frame));
            }
            bits.clear();
            continue;
        }
        if !c[i - 1] && c[i] {
            bits.push(d[i]);
            if bits.len() == 8 {
                let ordered: Box<dyn Iterator<Item = &bool>> = if rule.msb_first {
                    Box::new(bits.iter())
                } else {
                    Box::new(bits.iter().rev())
                };
                let value = ordered.fold(0u8, |acc, bit| (acc << 1) | u8::from(*bit));
                frame.push(DecodedByte {
                    value,
                    timestamp: clk.timestamp(i),
                });
                bits.clear();
            }
        }
    }
    if !frame.is_empty() {
        frames.push(frame);
    }
    frames
}
