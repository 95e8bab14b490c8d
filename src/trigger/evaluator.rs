//! Evaluation of trigger trees against channel snapshots.
//!
//! Every condition is evaluated as "the earliest timestamp at which it holds", with
//! an optional lower bound. Timestamps let `Logic` nodes combine operands and let
//! `Sequence` nodes enforce ordering; the root's timestamp is reported as the
//! [`TriggerHit`].

use super::tree::{NodeId, TriggerTree};
use super::{Polarity, Slope, TriggerCondition, TriggerDefinition, TriggerMode};
use crate::instrument::{ChannelId, Waveform};
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

/// Waveforms of several channels captured for one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    waveforms: BTreeMap<ChannelId, Waveform>,
}

impl ChannelSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_waveforms(waveforms: impl IntoIterator<Item = Waveform>) -> Self {
        let mut snapshot = Self::new();
        for waveform in waveforms {
            snapshot.insert(waveform);
        }
        snapshot
    }

    /// Adds or replaces the waveform of its channel.
    pub fn insert(&mut self, waveform: Waveform) {
        self.waveforms.insert(waveform.channel, waveform);
    }

    pub fn get(&self, channel: ChannelId) -> Option<&Waveform> {
        self.waveforms.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.waveforms.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    /// Latest sample timestamp across all channels.
    pub fn end_time(&self) -> Option<f64> {
        self.waveforms
            .values()
            .filter(|w| !w.is_empty())
            .map(Waveform::end_time)
            .reduce(f64::max)
    }

    /// Earliest sample timestamp strictly after `after`, across all channels.
    pub fn first_timestamp_after(&self, after: Option<f64>) -> Option<f64> {
        self.waveforms
            .values()
            .filter_map(|w| first_index_after(w, after).map(|i| w.timestamp(i)))
            .reduce(f64::min)
    }
}

/// A satisfied trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerHit {
    /// Timestamp (seconds) of the sample that satisfied the root condition.
    pub timestamp: f64,
}

/// Returned by `monitor` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Default)]
struct SequenceState {
    /// Index of the next sub-condition to satisfy.
    stage: usize,
    /// Satisfaction time of the previous sub-condition.
    last_time: Option<f64>,
    /// Satisfaction time of the first sub-condition of the current chain.
    chain_start: Option<f64>,
    /// A new chain must start strictly after this time.
    floor: Option<f64>,
}

/// Stateful evaluator for one trigger tree.
///
/// Only `Sequence` nodes carry state between snapshots; all other conditions are
/// pure functions of the snapshot.
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    tree: TriggerTree,
    sequences: HashMap<NodeId, SequenceState>,
}

impl TriggerEvaluator {
    pub fn new(tree: TriggerTree) -> Self {
        Self {
            tree,
            sequences: HashMap::new(),
        }
    }

    pub fn tree(&self) -> &TriggerTree {
        &self.tree
    }

    /// Evaluates the root against `snapshot`, advancing sequence state.
    pub fn evaluate(&mut self, snapshot: &ChannelSnapshot) -> Option<TriggerHit> {
        let root = self.tree.root();
        let hit = eval_node(&self.tree, &mut self.sequences, root, snapshot, None)
            .map(|timestamp| TriggerHit { timestamp });
        trace!(hit = ?hit, "trigger evaluated");
        hit
    }

    /// Clears all sequence progress.
    pub fn reset(&mut self) {
        self.sequences.clear();
    }
}

/// Whether `tree` holds on `snapshot`, evaluated from a fresh state.
pub fn evaluate(tree: &TriggerTree, snapshot: &ChannelSnapshot) -> bool {
    let mut sequences = HashMap::new();
    eval_node(tree, &mut sequences, tree.root(), snapshot, None).is_some()
}

/// Evaluates every snapshot of `stream` with one stateful evaluator and reports hits
/// to `on_satisfied` until the stream ends or the callback stops the monitor.
///
/// Returns the number of hits reported.
pub async fn monitor<S, F>(tree: &TriggerTree, mut stream: S, mut on_satisfied: F) -> usize
where
    S: Stream<Item = ChannelSnapshot> + Unpin,
    F: FnMut(TriggerHit) -> MonitorControl,
{
    let mut evaluator = TriggerEvaluator::new(tree.clone());
    let mut hits = 0;
    while let Some(snapshot) = stream.next().await {
        if let Some(hit) = evaluator.evaluate(&snapshot) {
            hits += 1;
            debug!(timestamp = hit.timestamp, hits, "trigger satisfied");
            if on_satisfied(hit) == MonitorControl::Stop {
                break;
            }
        }
    }
    hits
}

/// Like [`monitor`], applying the definition's holdoff and stopping after the first
/// hit in [`TriggerMode::Single`].
pub async fn monitor_definition<S, F>(
    definition: &TriggerDefinition,
    stream: S,
    mut on_satisfied: F,
) -> usize
where
    S: Stream<Item = ChannelSnapshot> + Unpin,
    F: FnMut(TriggerHit) -> MonitorControl,
{
    let holdoff = definition.holdoff.as_secs_f64();
    let single = definition.mode == TriggerMode::Single;
    let mut last_reported: Option<f64> = None;
    let mut reported = 0;
    monitor(&definition.tree, stream, |hit| {
        if let Some(last) = last_reported {
            if hit.timestamp - last < holdoff {
                trace!(timestamp = hit.timestamp, "hit suppressed by holdoff");
                return MonitorControl::Continue;
            }
        }
        last_reported = Some(hit.timestamp);
        reported += 1;
        let control = on_satisfied(hit);
        if single {
            MonitorControl::Stop
        } else {
            control
        }
    })
    .await;
    reported
}

fn first_index_after(waveform: &Waveform, after: Option<f64>) -> Option<usize> {
    match after {
        None => (!waveform.is_empty()).then_some(0),
        Some(bound) => (0..waveform.len()).find(|i| waveform.timestamp(*i) > bound),
    }
}

fn is_after(time: f64, after: Option<f64>) -> bool {
    after.map_or(true, |bound| time > bound)
}

fn eval_node(
    tree: &TriggerTree,
    sequences: &mut HashMap<NodeId, SequenceState>,
    id: NodeId,
    snapshot: &ChannelSnapshot,
    after: Option<f64>,
) -> Option<f64> {
    let node = tree.node(id)?;
    match node {
        TriggerCondition::Edge {
            channel,
            slope,
            level,
        } => {
            let w = snapshot.get(*channel)?;
            (1..w.len())
                .filter(|i| is_after(w.timestamp(*i), after))
                .find(|i| crosses(w.samples[i - 1], w.samples[*i], *level, *slope))
                .map(|i| w.timestamp(i))
        }
        TriggerCondition::Level {
            channel,
            threshold,
            comparator,
        } => {
            let w = snapshot.get(*channel)?;
            let start = first_index_after(w, after)?;
            (start..w.len())
                .find(|i| comparator.compare(w.samples[*i], *threshold))
                .map(|i| w.timestamp(i))
        }
        TriggerCondition::PulseWidth {
            channel,
            min,
            max,
            level,
            polarity,
        } => {
            let w = snapshot.get(*channel)?;
            let (width, closed_at) = last_closed_pulse(w, *level, *polarity)?;
            let in_range = width >= min.as_secs_f64() && width <= max.as_secs_f64();
            (in_range && is_after(closed_at, after)).then_some(closed_at)
        }
        TriggerCondition::Pattern { pattern, threshold } => {
            let waveforms: Vec<&Waveform> = pattern
                .channels()
                .iter()
                .map(|c| snapshot.get(*c))
                .collect::<Option<_>>()?;
            let reference = waveforms.first()?;
            let len = waveforms.iter().map(|w| w.len()).min()?;
            let start = first_index_after(reference, after)?;
            let mut levels = vec![false; waveforms.len()];
            (start..len)
                .find(|i| {
                    for (level, w) in levels.iter_mut().zip(&waveforms) {
                        *level = w.samples[*i] > *threshold;
                    }
                    pattern.matches_levels(&levels)
                })
                .map(|i| reference.timestamp(i))
        }
        TriggerCondition::Logic { operator, operands } => {
            let hits: Vec<Option<f64>> = operands
                .iter()
                .map(|child| eval_node(tree, sequences, *child, snapshot, after))
                .collect();
            let flags: Vec<bool> = hits.iter().map(Option::is_some).collect();
            if !operator.combine(&flags) {
                return None;
            }
            let times = hits.iter().flatten().copied();
            match operator {
                // all operands hold once the last of them does
                super::LogicOperator::And => times.reduce(f64::max),
                super::LogicOperator::Or | super::LogicOperator::Xor => times.reduce(f64::min),
                super::LogicOperator::Nand | super::LogicOperator::Nor => {
                    snapshot.first_timestamp_after(after)
                }
            }
        }
        TriggerCondition::Sequence {
            steps,
            per_step_timeout,
        } => eval_sequence(tree, sequences, id, steps, *per_step_timeout, snapshot, after),
        TriggerCondition::Protocol { rule } => rule
            .match_times(snapshot)
            .into_iter()
            .find(|t| is_after(*t, after)),
    }
}

fn crosses(previous: f64, current: f64, level: f64, slope: Slope) -> bool {
    let rising = previous < level && current >= level;
    let falling = previous > level && current <= level;
    match slope {
        Slope::Rising => rising,
        Slope::Falling => falling,
        Slope::Either => rising || falling,
    }
}

/// Width and closing time of the last complete pulse in the record.
fn last_closed_pulse(w: &Waveform, level: f64, polarity: Polarity) -> Option<(f64, f64)> {
    let (leading, trailing) = match polarity {
        Polarity::Positive => (Slope::Rising, Slope::Falling),
        Polarity::Negative => (Slope::Falling, Slope::Rising),
    };
    let mut opened: Option<f64> = None;
    let mut last = None;
    for i in 1..w.len() {
        let (previous, current) = (w.samples[i - 1], w.samples[i]);
        if crosses(previous, current, level, leading) {
            opened = Some(w.timestamp(i));
        } else if crosses(previous, current, level, trailing) {
            if let Some(start) = opened.take() {
                let end = w.timestamp(i);
                last = Some((end - start, end));
            }
        }
    }
    last
}

fn eval_sequence(
    tree: &TriggerTree,
    sequences: &mut HashMap<NodeId, SequenceState>,
    id: NodeId,
    steps: &[NodeId],
    per_step_timeout: Duration,
    snapshot: &ChannelSnapshot,
    after: Option<f64>,
) -> Option<f64> {
    let timeout = per_step_timeout.as_secs_f64();
    let mut state = sequences.get(&id).copied().unwrap_or_default();
    let restart = |state: &mut SequenceState, reason: &str| {
        trace!(node = id, stage = state.stage, reason, "sequence reset");
        *state = SequenceState {
            floor: state.chain_start.or(state.floor),
            ..SequenceState::default()
        };
    };

    let result = loop {
        if state.stage >= steps.len() {
            let satisfied = state.last_time;
            // re-arm; the next chain must start after this one completed
            state = SequenceState {
                floor: satisfied,
                ..SequenceState::default()
            };
            break satisfied;
        }

        let bound = if state.stage == 0 {
            match (after, state.floor) {
                (Some(a), Some(f)) => Some(a.max(f)),
                (a, f) => a.or(f),
            }
        } else {
            state.last_time
        };

        match eval_node(tree, sequences, steps[state.stage], snapshot, bound) {
            Some(time) => {
                if let Some(previous) = state.last_time {
                    if time - previous > timeout {
                        restart(&mut state, "step timeout");
                        continue;
                    }
                }
                if state.stage == 0 {
                    state.chain_start = Some(time);
                }
                state.stage += 1;
                state.last_time = Some(time);
            }
            None => {
                let Some(previous) = state.last_time else {
                    break None;
                };
                let expired = snapshot
                    .end_time()
                    .is_some_and(|end| end - previous > timeout);
                let out_of_order = eval_node(tree, sequences, steps[state.stage], snapshot, after)
                    .is_some_and(|early| early <= previous);
                if expired {
                    restart(&mut state, "step timeout");
                    continue;
                }
                if out_of_order {
                    restart(&mut state, "out of order");
                    continue;
                }
                break None;
            }
        }
    };
    sequences.insert(id, state);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{BitPattern, Comparator, LogicOperator, TreeBuilder, TriggerDefinition};

    fn wave(channel: u8, samples: Vec<f64>) -> Waveform {
        Waveform::new(ChannelId(channel), 0.0, 1e-3, samples)
    }

    fn level(channel: u8, threshold: f64) -> TriggerCondition {
        TriggerCondition::Level {
            channel: ChannelId(channel),
            threshold,
            comparator: Comparator::Greater,
        }
    }

    fn edge(channel: u8, slope: Slope) -> TriggerCondition {
        TriggerCondition::Edge {
            channel: ChannelId(channel),
            slope,
            level: 0.5,
        }
    }

    #[test]
    fn test_edge_picks_earliest_crossing() {
        let tree = TriggerTree::single(edge(1, Slope::Rising)).unwrap();
        let snapshot = ChannelSnapshot::from_waveforms([wave(1, vec![0.0, 1.0, 0.0, 1.0])]);
        let mut evaluator = TriggerEvaluator::new(tree.clone());
        assert_eq!(evaluator.evaluate(&snapshot).map(|h| h.timestamp), Some(1e-3));

        let falling = TriggerTree::single(edge(1, Slope::Falling)).unwrap();
        let hit = TriggerEvaluator::new(falling).evaluate(&snapshot);
        assert_eq!(hit.map(|h| h.timestamp), Some(2e-3));

        let flat = ChannelSnapshot::from_waveforms([wave(1, vec![0.0, 0.2, 0.1])]);
        assert!(!evaluate(&tree, &flat));
    }

    #[test]
    fn test_missing_channel_does_not_trigger() {
        let tree = TriggerTree::single(level(2, 0.0)).unwrap();
        let snapshot = ChannelSnapshot::from_waveforms([wave(1, vec![1.0])]);
        assert!(!evaluate(&tree, &snapshot));
    }

    #[test]
    fn test_pulse_width_uses_last_closed_pulse() {
        let pulse = |min_ms: u64, max_ms: u64| {
            TriggerTree::single(TriggerCondition::PulseWidth {
                channel: ChannelId(1),
                min: Duration::from_millis(min_ms),
                max: Duration::from_millis(max_ms),
                level: 0.5,
                polarity: Polarity::Positive,
            })
            .unwrap()
        };
        // 2 ms pulse, then a 4 ms pulse, then a pulse still open
        let samples = vec![0., 1., 1., 0., 0., 1., 1., 1., 1., 0., 1.];
        let snapshot = ChannelSnapshot::from_waveforms([wave(1, samples)]);
        assert!(evaluate(&pulse(3, 5), &snapshot));
        assert!(!evaluate(&pulse(1, 3), &snapshot));
    }

    #[test]
    fn test_pattern_condition() {
        let channels: Vec<ChannelId> = (1..=4).map(ChannelId).collect();
        let tree = TriggerTree::single(TriggerCondition::Pattern {
            pattern: BitPattern::parse(channels, "11X1").unwrap(),
            threshold: 1.5,
        })
        .unwrap();
        let snapshot = |ch4: f64| {
            ChannelSnapshot::from_waveforms([
                wave(1, vec![0.0, 3.3]),
                wave(2, vec![3.3, 3.3]),
                wave(3, vec![0.0, 0.0]),
                wave(4, vec![3.3, ch4]),
            ])
        };
        let mut evaluator = TriggerEvaluator::new(tree);
        assert_eq!(evaluator.evaluate(&snapshot(3.3)).map(|h| h.timestamp), Some(1e-3));
        assert!(evaluator.evaluate(&snapshot(0.0)).is_none());
    }

    #[test]
    fn test_logic_hit_times() {
        let build = |operator: LogicOperator| {
            let mut builder = TreeBuilder::new();
            let a = builder.add(level(1, 0.5));
            let b = builder.add(level(2, 0.5));
            let root = builder.add(TriggerCondition::Logic {
                operator,
                operands: vec![a, b],
            });
            builder.build(root).unwrap()
        };
        let snapshot = ChannelSnapshot::from_waveforms([
            wave(1, vec![0.0, 1.0, 1.0, 1.0]),
            wave(2, vec![0.0, 0.0, 0.0, 1.0]),
        ]);
        let hit = |op| TriggerEvaluator::new(build(op)).evaluate(&snapshot).map(|h| h.timestamp);
        assert_eq!(hit(LogicOperator::And), Some(3e-3));
        assert_eq!(hit(LogicOperator::Or), Some(1e-3));
        assert_eq!(hit(LogicOperator::Xor), None);
        assert_eq!(hit(LogicOperator::Nand), None);
    }

    fn sequence_tree(timeout: Duration) -> TriggerTree {
        let mut builder = TreeBuilder::new();
        let a = builder.add(level(1, 0.5));
        let b = builder.add(level(2, 0.5));
        let root = builder.add(TriggerCondition::Sequence {
            steps: vec![a, b],
            per_step_timeout: timeout,
        });
        builder.build(root).unwrap()
    }

    #[test]
    fn test_sequence_in_order_within_one_snapshot() {
        let tree = sequence_tree(Duration::from_millis(10));
        let snapshot = ChannelSnapshot::from_waveforms([
            wave(1, vec![0.0, 1.0, 0.0, 0.0]),
            wave(2, vec![0.0, 0.0, 0.0, 1.0]),
        ]);
        let hit = TriggerEvaluator::new(tree).evaluate(&snapshot);
        assert_eq!(hit.map(|h| h.timestamp), Some(3e-3));
    }

    #[test]
    fn test_sequence_out_of_order_resets() {
        let tree = sequence_tree(Duration::from_millis(10));
        let snapshot = ChannelSnapshot::from_waveforms([
            wave(1, vec![0.0, 0.0, 1.0, 0.0]),
            wave(2, vec![0.0, 1.0, 0.0, 0.0]),
        ]);
        let mut evaluator = TriggerEvaluator::new(tree);
        assert!(evaluator.evaluate(&snapshot).is_none());
    }

    #[test]
    fn test_sequence_progress_spans_snapshots() {
        let tree = sequence_tree(Duration::from_millis(10));
        let mut evaluator = TriggerEvaluator::new(tree);
        let first = ChannelSnapshot::from_waveforms([
            wave(1, vec![0.0, 1.0]),
            wave(2, vec![0.0, 0.0]),
        ]);
        assert!(evaluator.evaluate(&first).is_none());
        let second = ChannelSnapshot::from_waveforms([
            Waveform::new(ChannelId(1), 2e-3, 1e-3, vec![0.0, 0.0]),
            Waveform::new(ChannelId(2), 2e-3, 1e-3, vec![0.0, 1.0]),
        ]);
        assert_eq!(evaluator.evaluate(&second).map(|h| h.timestamp), Some(3e-3));
    }

    #[test]
    fn test_sequence_timeout_resets() {
        let tree = sequence_tree(Duration::from_millis(2));
        let mut evaluator = TriggerEvaluator::new(tree);
        let first = ChannelSnapshot::from_waveforms([
            wave(1, vec![1.0, 0.0]),
            wave(2, vec![0.0, 0.0]),
        ]);
        assert!(evaluator.evaluate(&first).is_none());
        // second step arrives 10 ms after the first
        let late = ChannelSnapshot::from_waveforms([
            Waveform::new(ChannelId(1), 10e-3, 1e-3, vec![0.0]),
            Waveform::new(ChannelId(2), 10e-3, 1e-3, vec![1.0]),
        ]);
        assert!(evaluator.evaluate(&late).is_none());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_request() {
        let tree = TriggerTree::single(level(1, 0.5)).unwrap();
        let snapshots = vec![
            ChannelSnapshot::from_waveforms([wave(1, vec![0.0])]),
            ChannelSnapshot::from_waveforms([wave(1, vec![1.0])]),
            ChannelSnapshot::from_waveforms([wave(1, vec![1.0])]),
            ChannelSnapshot::from_waveforms([wave(1, vec![1.0])]),
        ];
        let mut seen = 0;
        let hits = monitor(&tree, tokio_stream::iter(snapshots), |_| {
            seen += 1;
            if seen == 2 {
                MonitorControl::Stop
            } else {
                MonitorControl::Continue
            }
        })
        .await;
        assert_eq!(hits, 2);
    }

    #[tokio::test]
    async fn test_single_mode_and_holdoff() {
        let tree = TriggerTree::single(level(1, 0.5)).unwrap();
        let frames = |count: usize| -> Vec<ChannelSnapshot> {
            (0..count)
                .map(|i| {
                    ChannelSnapshot::from_waveforms([Waveform::new(
                        ChannelId(1),
                        i as f64 * 1e-3,
                        1e-3,
                        vec![1.0],
                    )])
                })
                .collect()
        };

        let single = TriggerDefinition::new("once", tree.clone()).with_mode(TriggerMode::Single);
        let reported =
            monitor_definition(&single, tokio_stream::iter(frames(5)), |_| MonitorControl::Continue)
                .await;
        assert_eq!(reported, 1);

        let held = TriggerDefinition::new("held", tree).with_holdoff(Duration::from_micros(2500));
        let reported =
            monitor_definition(&held, tokio_stream::iter(frames(6)), |_| MonitorControl::Continue)
                .await;
        // hits at 0, 3 ms
        assert_eq!(reported, 2);
    }
}
