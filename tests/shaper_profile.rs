//! Shaper distribution scenario: chat profile over small writes.

use webtor::protocol::cell::{Cell, CellCodec, CELL_LEN};
use webtor::shaper::{Shaper, ShaperConfig, ShaperProfile};

#[test]
fn chat_profile_over_500_tiny_cells() {
    let mut codec = CellCodec::new();
    codec.set_link_version(4);
    let mut shaper = Shaper::new(ShaperConfig::for_profile(ShaperProfile::Chat, false));

    // 500 cells each carrying a single payload byte (a worst case for
    // fragmentation: every wire chunk is a full 514-byte cell).
    let mut sizes = Vec::new();
    for i in 0..500u32 {
        let cell = Cell::relay(0x8000_0000 | i, vec![i as u8]);
        let bytes = codec.encode(&cell).unwrap();
        assert_eq!(bytes.len(), CELL_LEN);
        for frame in shaper.shape(bytes) {
            sizes.push(frame.bytes.len());
        }
    }

    let total = sizes.len();
    assert!(total >= 500, "fragmentation should not merge cells away");

    let in_range = sizes.iter().filter(|&&n| (50..=200).contains(&n)).count();
    let at_cell_size = sizes.iter().filter(|&&n| n == CELL_LEN).count();

    assert!(
        in_range * 10 >= total * 8,
        "{in_range}/{total} messages in [50,200]"
    );
    assert!(
        at_cell_size * 10 < total,
        "{at_cell_size}/{total} messages leaked the raw cell size"
    );
}

#[test]
fn profiled_delays_stay_within_jitter_bound() {
    let mut codec = CellCodec::new();
    codec.set_link_version(4);
    let mut shaper = Shaper::new(ShaperConfig::for_profile(ShaperProfile::Ticker, false));

    for i in 0..50u32 {
        let bytes = codec.encode(&Cell::relay(i | 0x8000_0000, vec![0; 100])).unwrap();
        for frame in shaper.shape(bytes) {
            assert!(frame.delay.as_millis() <= 50);
            assert!((20..=100).contains(&frame.bytes.len()));
        }
    }
}
