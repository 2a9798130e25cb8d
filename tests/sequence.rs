mod common;

use std::path::Path;
use std::time::Duration;

use common::{RecordingDelay, SimDevice};
use omiflash::frame::FrameFormat;
use omiflash::register::{Readout, RegisterAddress};
use omiflash::sequence::{Sequence, Step, replay};
use omiflash::transaction::RegisterBus;

#[test]
fn bundled_sync_sequence_replays_cleanly() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("sequences/explorer_sync.json");
    let seq = Sequence::load(&path).expect("bundled sequence parses");
    assert!(!seq.steps.is_empty());

    let mut sim = SimDevice::explorer();
    let mut delay = RecordingDelay::default();
    let report = {
        let mut bus = RegisterBus::with_delay(&mut sim, 0x20, FrameFormat::EXPLORER, &mut delay);
        replay(&mut bus, &seq).expect("replay")
    };

    assert_eq!(report.steps, seq.steps.len());
    assert!(report.is_clean(), "{report:?}");
    // The training trigger goes out as a raw frame at the very end.
    assert_eq!(sim.calls, vec![vec![0x01, 0x04, 0x00, 0x00, 0x81, 0x91]]);
    // The last configuration write lands in the training config register.
    let last = report.reads.last().expect("reads recorded");
    assert_eq!(last.address, RegisterAddress(0x0801_2811));
    assert_eq!(last.readout, Readout::Value(0x0000_0500_0000_006F));
    assert_eq!(last.label.as_deref(), Some("training config"));
}

#[test]
fn replay_counts_problems_without_stopping() {
    let text = r#"{
        "name": "checks",
        "steps": [
            { "op": "read", "address": "0x20B080", "expected": "0x796" },
            { "op": "read", "address": "0x20B084", "expected": "0x1" },
            { "op": "read", "address": "0x20B088" },
            { "op": "write", "address": "0x20B08C", "value": "0x55" },
            { "op": "write", "address": "0x20B090", "value": "0x66" },
            { "op": "delay", "ms": 20 }
        ]
    }"#;
    let seq = Sequence::parse(text).expect("valid sequence");

    let mut sim = SimDevice::explorer();
    sim.registers.insert(0x0020_B080, 0x796);
    sim.registers.insert(0x0020_B084, 0x2);
    sim.unmapped.insert(0x0020_B088, 0xDEC0_DE1C);
    sim.read_only.insert(0x0020_B08C);
    let mut delay = RecordingDelay::default();
    let report = {
        let mut bus = RegisterBus::with_delay(&mut sim, 0x20, FrameFormat::EXPLORER, &mut delay);
        replay(&mut bus, &seq).expect("replay")
    };

    assert_eq!(report.steps, 6);
    assert_eq!(report.mismatches, 1);
    assert_eq!(report.unmapped, 1);
    assert_eq!(report.rejected_writes, 1);
    assert!(!report.is_clean());
    assert!(report.reads[0].matches());
    assert!(!report.reads[1].matches());
    assert_eq!(sim.registers.get(&0x0020_B090), Some(&0x66));
    assert_eq!(delay.sleeps, vec![Duration::from_millis(20)]);
}

#[test]
fn port_offset_shifts_every_address() {
    let seq = Sequence {
        name: "offset".into(),
        port_offset: omiflash::sequence::Hex(0x1000),
        steps: vec![
            Step::Post {
                address: omiflash::sequence::Hex(0x0020_0000),
                value: omiflash::sequence::Hex(7),
            },
            Step::Read {
                address: omiflash::sequence::Hex(0x0020_0000),
                expected: Some(omiflash::sequence::Hex(7)),
                label: None,
            },
        ],
    };

    let mut sim = SimDevice::explorer();
    let mut delay = RecordingDelay::default();
    let report = {
        let mut bus = RegisterBus::with_delay(&mut sim, 0x20, FrameFormat::EXPLORER, &mut delay);
        replay(&mut bus, &seq).expect("replay")
    };

    assert!(report.is_clean());
    assert_eq!(report.reads[0].address, RegisterAddress(0x0020_1000));
    assert_eq!(sim.register_writes, vec![(0x0020_1000, 7)]);
}

#[test]
fn channel_fault_aborts_replay() {
    let seq = Sequence::parse(
        r#"{ "steps": [ { "op": "read", "address": "0x10" }, { "op": "read", "address": "0x14" } ] }"#,
    )
    .expect("valid sequence");

    let mut sim = SimDevice::explorer();
    let mut delay = RecordingDelay::default();
    let mut bus = RegisterBus::with_delay(&mut sim, 0x21, FrameFormat::EXPLORER, &mut delay);
    assert!(replay(&mut bus, &seq).is_err());
}
