use scope_automation::instrument::{ChannelId, Waveform};
use scope_automation::trigger::{
    evaluate, monitor_definition, BitPattern, ChannelSnapshot, Comparator, LogicOperator, MonitorControl,
    ProtocolRule, Slope, TreeBuilder, TriggerCondition, TriggerDefinition, TriggerEvaluator, TriggerMode,
    TriggerSet, TriggerTree,
};
use scope_automation::AutomationError;
use std::time::Duration;

const HIGH: f64 = 3.3;
const LOW: f64 = 0.0;

fn wave(channel: u8, samples: Vec<f64>) -> Waveform {
    Waveform::new(ChannelId(channel), 0.0, 1e-3, samples)
}

fn steady(channel: u8, high: bool) -> Waveform {
    wave(channel, vec![if high { HIGH } else { LOW }; 8])
}

fn above(channel: u8) -> TriggerCondition {
    TriggerCondition::Level {
        channel: ChannelId(channel),
        threshold: 1.5,
        comparator: Comparator::Greater,
    }
}

fn rising(channel: u8) -> TriggerCondition {
    TriggerCondition::Edge {
        channel: ChannelId(channel),
        slope: Slope::Rising,
        level: 1.5,
    }
}

fn combine(operator: LogicOperator) -> TriggerTree {
    let mut builder = TreeBuilder::new();
    let a = builder.add(above(1));
    let b = builder.add(above(2));
    let root = builder.add(TriggerCondition::Logic {
        operator,
        operands: vec![a, b],
    });
    builder.build(root).unwrap()
}

#[test]
fn logic_operators_follow_truth_tables() {
    let cases = [
        (LogicOperator::And, [false, false, false, true]),
        (LogicOperator::Or, [false, true, true, true]),
        (LogicOperator::Xor, [false, true, true, false]),
        (LogicOperator::Nand, [true, true, true, false]),
        (LogicOperator::Nor, [true, false, false, false]),
    ];
    let inputs = [(false, false), (false, true), (true, false), (true, true)];

    for (operator, expected) in cases {
        let tree = combine(operator);
        for ((a, b), want) in inputs.iter().zip(expected) {
            let snapshot = ChannelSnapshot::from_waveforms([steady(1, *a), steady(2, *b)]);
            assert_eq!(
                evaluate(&tree, &snapshot),
                want,
                "{:?} with A={} B={}",
                operator,
                a,
                b
            );
        }
    }
}

#[test]
fn pattern_with_dont_care_matches_expected_states() {
    let channels = vec![ChannelId(1), ChannelId(2), ChannelId(3), ChannelId(4)];
    let pattern = BitPattern::parse(channels, "11X1").unwrap();

    assert!(pattern.matches_str("1101").unwrap());
    assert!(pattern.matches_str("1111").unwrap());
    assert!(!pattern.matches_str("1100").unwrap());
    assert!(pattern.matches_str("110").is_err());
}

#[test]
fn pattern_condition_reads_channel_levels() {
    let channels = vec![ChannelId(1), ChannelId(2), ChannelId(3), ChannelId(4)];
    let tree = TriggerTree::single(TriggerCondition::Pattern {
        pattern: BitPattern::parse(channels, "11X1").unwrap(),
        threshold: 1.5,
    })
    .unwrap();

    let states = |bits: [bool; 4]| {
        ChannelSnapshot::from_waveforms(bits.iter().enumerate().map(|(i, high)| steady(i as u8 + 1, *high)))
    };
    assert!(evaluate(&tree, &states([true, true, false, true])));
    assert!(evaluate(&tree, &states([true, true, true, true])));
    assert!(!evaluate(&tree, &states([true, true, false, false])));
}

#[test]
fn cyclic_tree_is_rejected_at_construction() {
    let nodes = vec![
        TriggerCondition::Logic {
            operator: LogicOperator::And,
            operands: vec![1, 2],
        },
        above(1),
        TriggerCondition::Logic {
            operator: LogicOperator::Or,
            operands: vec![0],
        },
    ];
    assert!(matches!(
        TriggerTree::new(nodes, 0),
        Err(AutomationError::CyclicCondition(_))
    ));
}

#[test]
fn unsupported_protocol_is_rejected() {
    let result = TriggerTree::single(TriggerCondition::Protocol {
        rule: ProtocolRule::Can {
            channel: ChannelId(1),
            identifier: 0x123,
        },
    });
    assert!(matches!(result, Err(AutomationError::Configuration(_))));
}

#[test]
fn edge_reports_first_crossing() {
    let tree = TriggerTree::single(rising(1)).unwrap();
    let mut evaluator = TriggerEvaluator::new(tree);
    let snapshot = ChannelSnapshot::from_waveforms([wave(1, vec![LOW, LOW, LOW, HIGH, HIGH, LOW, HIGH])]);

    let hit = evaluator.evaluate(&snapshot).unwrap();
    assert!((hit.timestamp - 3e-3).abs() < 1e-12);
}

#[test]
fn sequence_requires_ordered_events() {
    let build = || {
        let mut builder = TreeBuilder::new();
        let first = builder.add(rising(1));
        let second = builder.add(rising(2));
        let root = builder.add(TriggerCondition::Sequence {
            steps: vec![first, second],
            per_step_timeout: Duration::from_millis(10),
        });
        builder.build(root).unwrap()
    };
    let edge_at = |channel: u8, index: usize| {
        wave(channel, (0..8).map(|i| if i >= index { HIGH } else { LOW }).collect())
    };

    let mut in_order = TriggerEvaluator::new(build());
    let hit = in_order
        .evaluate(&ChannelSnapshot::from_waveforms([edge_at(1, 2), edge_at(2, 5)]))
        .unwrap();
    assert!((hit.timestamp - 5e-3).abs() < 1e-12);

    let mut reversed = TriggerEvaluator::new(build());
    assert!(reversed
        .evaluate(&ChannelSnapshot::from_waveforms([edge_at(1, 5), edge_at(2, 2)]))
        .is_none());
}

#[tokio::test]
async fn single_mode_monitor_stops_after_first_hit() {
    let definition =
        TriggerDefinition::new("one shot", TriggerTree::single(above(1)).unwrap()).with_mode(TriggerMode::Single);
    let snapshots = (0..5).map(|_| ChannelSnapshot::from_waveforms([steady(1, true)]));

    let mut hits = Vec::new();
    let reported = monitor_definition(&definition, tokio_stream::iter(snapshots), |hit| {
        hits.push(hit);
        MonitorControl::Continue
    })
    .await;

    assert_eq!(reported, 1);
    assert_eq!(hits.len(), 1);
}

#[test]
fn trigger_set_survives_json_round_trip() {
    let mut builder = TreeBuilder::new();
    let edge = builder.add(rising(1));
    let pattern = builder.add(TriggerCondition::Pattern {
        pattern: BitPattern::parse(vec![ChannelId(2), ChannelId(3)], "1X").unwrap(),
        threshold: 1.2,
    });
    let width = builder.add(TriggerCondition::PulseWidth {
        channel: ChannelId(4),
        min: Duration::from_micros(5),
        max: Duration::from_micros(50),
        level: 1.0,
        polarity: Default::default(),
    });
    let root = builder.add(TriggerCondition::Logic {
        operator: LogicOperator::Or,
        operands: vec![edge, pattern, width],
    });
    let tree = builder.build(root).unwrap();

    let mut set = TriggerSet::new("bench");
    set.insert(
        TriggerDefinition::new("compound", tree)
            .with_mode(TriggerMode::Auto)
            .with_holdoff(Duration::from_millis(2)),
    );

    let json = serde_json::to_string(&set).unwrap();
    let restored: TriggerSet = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, set);
}
