use scope_automation::config::AutomationConfig;
use scope_automation::engine::{RunStatus, SequenceEngine, SYNC_QUALITY_KEY};
use scope_automation::instrument::mock::{sine_waveform, MockDriver};
use scope_automation::instrument::{ChannelId, SharedDriver, Waveform};
use scope_automation::sequence::{Sequence, Step};
use scope_automation::sync::{offset_score, GroupState, SyncCoordinator, SyncMode, TimingConfig};
use scope_automation::AutomationError;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

const DT: f64 = 1e-6;

fn config() -> AutomationConfig {
    let mut config = AutomationConfig::default();
    config.engine.poll_interval = Duration::from_millis(1);
    config.sync.max_offset = Duration::from_micros(100);
    config.sync.completion_timeout = Duration::from_millis(200);
    config
}

fn timing() -> TimingConfig {
    TimingConfig::new(1e6, 512, 1e-5)
}

fn channels(ids: &[u8]) -> Vec<ChannelId> {
    ids.iter().copied().map(ChannelId).collect()
}

/// A narrow gaussian pulse centred on sample `center`.
fn pulse(channel: u8, center: usize) -> Waveform {
    let samples = (0..512)
        .map(|i| {
            let x = i as f64 - center as f64;
            (-x * x / 18.0).exp()
        })
        .collect();
    Waveform::new(ChannelId(channel), 0.0, DT, samples)
}

#[test]
fn reference_outside_group_creates_nothing() {
    let sync = SyncCoordinator::from_config(&config());
    let err = sync
        .create_group(channels(&[1, 2]), ChannelId(3), SyncMode::TriggerSync, timing())
        .unwrap_err();

    assert!(matches!(err, AutomationError::InvalidGroupConfiguration(_)));
    assert!(sync.groups().is_empty());
    assert!(sync.group_for_channels(&channels(&[1, 2])).is_none());
}

#[test]
fn invalid_timing_is_rejected() {
    let sync = SyncCoordinator::from_config(&config());
    let too_fast = TimingConfig::new(1e12, 512, 1e-5);
    let err = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::SampleSync, too_fast)
        .unwrap_err();
    assert!(matches!(err, AutomationError::InvalidGroupConfiguration(_)));
    assert!(sync.groups().is_empty());
}

#[test]
fn offset_score_is_monotonic_and_reaches_zero() {
    let max = Duration::from_micros(100);
    let offsets: Vec<f64> = (0..=30).map(|n| n as f64 * 5e-6).collect();
    let scores: Vec<f64> = offsets.iter().map(|o| offset_score(*o, max)).collect();

    assert_eq!(scores[0], 1.0);
    for pair in scores.windows(2) {
        assert!(pair[1] <= pair[0], "{:?}", pair);
    }
    for (offset, score) in offsets.iter().zip(&scores) {
        if *offset >= 100e-6 {
            assert_eq!(*score, 0.0, "offset {}", offset);
        }
    }
}

#[test]
fn quality_falls_as_follower_drifts() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::TimeSync, timing())
        .unwrap();

    let mut previous = f64::INFINITY;
    for shift in [0usize, 10, 30, 60, 100, 150] {
        let report = sync
            .record_waveforms(id, &[pulse(1, 100), pulse(2, 100 + shift)])
            .unwrap();
        let quality = sync.quality(id).unwrap();
        assert_eq!(quality, report.score);
        assert!(quality <= previous, "shift {} raised quality to {}", shift, quality);
        if shift > 100 {
            assert_eq!(quality, 0.0);
        }
        previous = quality;
    }

    let report = sync.record_waveforms(id, &[pulse(1, 100), pulse(2, 100)]).unwrap();
    assert_eq!(report.score, 1.0);
    assert_eq!(sync.channel_quality(id).unwrap()[0].channel, ChannelId(2));
}

#[test]
fn start_time_offset_counts_against_quality() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::TriggerSync, timing())
        .unwrap();
    let mut late = pulse(2, 100);
    late.start_time = 50e-6;

    let report = sync.record_waveforms(id, &[pulse(1, 100), late]).unwrap();
    assert!((report.score - 0.5).abs() < 1e-9);
}

#[test]
fn independent_group_always_scores_one() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::Independent, timing())
        .unwrap();

    assert_eq!(sync.quality(id).unwrap(), 1.0);
    sync.record_waveforms(id, &[pulse(1, 100), pulse(2, 300)]).unwrap();
    assert_eq!(sync.quality(id).unwrap(), 1.0);
}

#[test]
fn dead_follower_scores_zero() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::PhaseSync, timing())
        .unwrap();
    let silent = Waveform::new(ChannelId(2), 0.0, DT, vec![0.0; 512]);

    let report = sync
        .record_waveforms(id, &[sine_waveform(ChannelId(1), 5e3, 1.0, DT, 512), silent])
        .unwrap();
    assert_eq!(report.score, 0.0);
    assert_eq!(sync.quality(id).unwrap(), 0.0);
    assert_eq!(sync.channel_quality(id).unwrap()[0].correlation, 0.0);
}

#[tokio::test]
async fn followers_are_armed_before_reference() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[3, 1, 2]), ChannelId(1), SyncMode::PhaseSync, timing())
        .unwrap();
    let mut driver = MockDriver::new();
    let cancel = AtomicBool::new(false);

    sync.start(id, &mut driver, &cancel).await.unwrap();

    let commands = driver.commands();
    let position = |command: &str| commands.iter().position(|c| c == command).unwrap();
    assert!(position("CHAN3:SYNC:SOUR CHAN1") < position("CHAN3:ARM"));
    assert!(position("CHAN3:ARM") < position("CHAN1:ARM"));
    assert!(position("CHAN2:ARM") < position("CHAN1:ARM"));
    assert_eq!(commands.last().map(String::as_str), Some("CHAN1:ARM"));
    assert_eq!(sync.state(id).unwrap(), GroupState::Armed);

    sync.stop(id, &mut driver, &cancel).await.unwrap();
    assert_eq!(driver.commands().last().map(String::as_str), Some("CHAN3:STOP"));
    assert_eq!(sync.state(id).unwrap(), GroupState::Stopped);
}

#[tokio::test]
async fn acquire_requires_armed_group() {
    let sync = SyncCoordinator::from_config(&config());
    let id = sync
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::TriggerSync, timing())
        .unwrap();
    let mut driver = MockDriver::new();
    let err = sync
        .acquire(id, &mut driver, &AtomicBool::new(false))
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::InvalidState(_)));
}

#[tokio::test]
async fn sequence_acquire_uses_matching_group() {
    let driver = MockDriver::new()
        .with_waveform(sine_waveform(ChannelId(1), 1e3, 1.0, DT, 1_000))
        .with_waveform(sine_waveform(ChannelId(2), 1e3, 0.5, DT, 1_000));
    let engine = SequenceEngine::new(config(), SharedDriver::new(driver.clone())).unwrap();
    let id = engine
        .coordinator()
        .create_group(channels(&[1, 2]), ChannelId(1), SyncMode::SampleSync, timing())
        .unwrap();

    let sequence = Sequence::new("grouped").with_step(Step::Acquire {
        channels: channels(&[2, 1]),
    });
    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.measurement(SYNC_QUALITY_KEY), Some(1.0));
    assert!(driver.commands().iter().any(|c| c == "SYNC:MODE SAMP"));
    assert_eq!(engine.coordinator().state(id).unwrap(), GroupState::Captured);
}
