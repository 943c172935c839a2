//! `fatal!` and `ensure!` used from outside the crate, with no `tracing`
//! import in scope

fn checked_len(len: usize) -> usize {
    fulcrum_backends::ensure!(len <= 16, "length {len} exceeds 16");
    len
}

#[test]
fn test_ensure_passes() {
    assert_eq!(checked_len(4), 4);
}

#[test]
#[should_panic(expected = "length 32 exceeds 16")]
fn test_ensure_fails() {
    checked_len(32);
}

#[test]
#[should_panic(expected = "stream 3 is gone")]
fn test_fatal_panics_with_message() {
    fulcrum_tracing::init_for_tests();
    fulcrum_backends::fatal!("stream {} is gone", 3);
}
