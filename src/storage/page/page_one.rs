//! Page one holds the validity marker used to detect unclean shutdown.
//!
//! On open a fresh random marker is written at `[100, 108)`; a clean close
//! copies it to `[108, 116)`. If the two ranges differ on the next open the
//! previous process did not shut down cleanly.

use crate::storage::page::Page;
use crate::storage::PAGE_SIZE;
use rand::RngCore;

const MARKER_OFFSET: usize = 100;
const MARKER_LEN: usize = 8;
const MIRROR_OFFSET: usize = MARKER_OFFSET + MARKER_LEN;

pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    write_open_marker(&mut raw);
    raw
}

fn write_open_marker(raw: &mut [u8; PAGE_SIZE]) {
    rand::thread_rng().fill_bytes(&mut raw[MARKER_OFFSET..MARKER_OFFSET + MARKER_LEN]);
}

/// Writes a fresh marker; the page now reads as "open".
pub fn set_open(page: &Page) {
    write_open_marker(&mut page.write());
}

/// Mirrors the marker; the page now reads as "cleanly closed".
pub fn set_close(page: &Page) {
    page.write().copy_within(MARKER_OFFSET..MARKER_OFFSET + MARKER_LEN, MIRROR_OFFSET);
}

/// True when the last shutdown was clean.
pub fn check(page: &Page) -> bool {
    let raw = page.read();
    raw[MARKER_OFFSET..MARKER_OFFSET + MARKER_LEN]
        == raw[MIRROR_OFFSET..MIRROR_OFFSET + MARKER_LEN]
}
