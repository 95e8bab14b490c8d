//! Alignment scoring of follower channels against their reference.
use super::{ChannelGroup, GroupId, SyncMode};
use crate::analysis::cross_correlate;
use crate::error::{AppResult, AutomationError};
use crate::instrument::{ChannelId, Waveform};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Relative tolerance for sample interval mismatch between channels.
const INTERVAL_TOLERANCE: f64 = 1e-6;

/// Alignment of one follower channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub channel: ChannelId,
    /// Measured offset of the follower relative to the reference, in seconds.
    pub time_offset: f64,
    /// Normalized correlation at the best lag; 0.0 if it could not be measured.
    pub correlation: f64,
    /// 0.0 when either record carries no signal to correlate.
    pub score: f64,
}

/// Result of scoring one group acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub group: GroupId,
    /// Worst follower score, 1.0 for groups without followers or in independent mode.
    pub score: f64,
    pub channels: Vec<ChannelQuality>,
    pub computed_at: DateTime<Utc>,
}

/// Maps a time offset onto [0, 1]: 1.0 at zero offset, falling linearly to 0.0 at
/// `max_offset` and beyond.
pub fn offset_score(offset: f64, max_offset: Duration) -> f64 {
    let limit = max_offset.as_secs_f64();
    if limit <= 0.0 {
        return if offset == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - offset.abs() / limit).clamp(0.0, 1.0)
}

/// Scores the records of one acquisition of `group`.
pub fn assess(group: &ChannelGroup, waveforms: &[Waveform], max_offset: Duration) -> AppResult<QualityReport> {
    let mut report = QualityReport {
        group: group.id,
        score: 1.0,
        channels: Vec::new(),
        computed_at: Utc::now(),
    };
    if group.mode == SyncMode::Independent {
        return Ok(report);
    }

    let find = |channel: ChannelId| {
        waveforms
            .iter()
            .find(|w| w.channel == channel)
            .ok_or_else(|| AutomationError::Processing(format!("No record for {} in group {}", channel, group.id)))
    };
    let reference = find(group.reference)?;
    let dt = reference.sample_interval;

    for channel in group.followers() {
        let follower = find(channel)?;
        if (follower.sample_interval - dt).abs() > dt.abs() * INTERVAL_TOLERANCE {
            return Err(AutomationError::Processing(format!(
                "{} sample interval {} differs from reference interval {}",
                channel, follower.sample_interval, dt
            )));
        }
        let start_offset = follower.start_time - reference.start_time;
        let quality = match cross_correlate(&reference.samples, &follower.samples) {
            Some(alignment) => {
                let time_offset = start_offset + alignment.lag as f64 * dt;
                ChannelQuality {
                    channel,
                    time_offset,
                    correlation: alignment.coefficient,
                    score: offset_score(time_offset, max_offset),
                }
            }
            // flat or empty record: no offset can be measured
            None => {
                warn!(
                    "No measurable signal on {} or its reference {} in group {}",
                    channel, group.reference, group.id
                );
                ChannelQuality {
                    channel,
                    time_offset: start_offset,
                    correlation: 0.0,
                    score: 0.0,
                }
            }
        };
        report.channels.push(quality);
    }
    report.score = report
        .channels
        .iter()
        .map(|c| c.score)
        .fold(1.0, f64::min);
    Ok(report)
}
