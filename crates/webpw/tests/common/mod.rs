//! Codec fixtures shared by the integration tests.
//!
//! The fixtures are small text-format modules that follow the codec's
//! export contract. The "echo" codec writes a 36-byte file that starts
//! with a real RIFF/WEBP header and then records what it was called with:
//!
//! ```text
//! 0  "RIFF" | 4 size=28 | 8 "WEBP" | 12 "TEST"
//! 16 width  | 20 height | 24 quality (f32) | 28 byte sum of input | 32 channels
//! ```
//!
//! Special widths drive failure paths: 3 spins forever, 13 reports codec
//! status 5. Encoding before `_initialize` ran reports status 99.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::sync::OnceLock;

use flate2::Compression;
use flate2::write::GzEncoder;
use webpw::{Bitmap, ColorModel};

/// Width that makes the echo codec loop forever.
pub const SPIN_WIDTH: u32 = 3;

/// Width that makes the echo codec report a failure.
pub const FAILING_WIDTH: u32 = 13;

/// Status code reported for [`FAILING_WIDTH`].
pub const FAILING_CODE: i32 = 5;

const ECHO_CODEC: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (global $live (mut i32) (i32.const 0))
  (global $ready (mut i32) (i32.const 0))
  (data (i32.const 0) "RIFF\00\00\00\00WEBPTEST")
  (data (i32.const 64) "codec ready\n")

  (func (export "_initialize")
    (i32.store (i32.const 128) (i32.const 64))
    (i32.store (i32.const 132) (i32.const 12))
    (drop (call $fd_write (i32.const 1) (i32.const 128) (i32.const 1) (i32.const 136)))
    (global.set $ready (i32.const 1)))

  (func $alloc (export "webp_alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr
      (i32.and (i32.add (global.get $heap) (i32.const 7)) (i32.const -8)))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.shl (memory.size) (i32.const 16)))
      (then
        (if (i32.eq
              (memory.grow
                (i32.add
                  (i32.shr_u
                    (i32.sub (local.get $end) (i32.shl (memory.size) (i32.const 16)))
                    (i32.const 16))
                  (i32.const 1)))
              (i32.const -1))
          (then (return (i32.const 0))))))
    (global.set $heap (local.get $end))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (local.get $ptr))

  (func (export "webp_free") (param $ptr i32)
    (if (local.get $ptr)
      (then
        (global.set $live (i32.sub (global.get $live) (i32.const 1)))
        (if (i32.eqz (global.get $live))
          (then (global.set $heap (i32.const 1024)))))))

  (func (export "live_allocations") (result i32)
    (global.get $live))

  (func $encode (param $ptr i32) (param $len i32) (param $w i32) (param $h i32)
                (param $q f32) (param $channels i32) (result i32 i32)
    (local $i i32)
    (local $sum i32)
    (local $out i32)
    (if (i32.eqz (global.get $ready))
      (then (return (i32.const 0) (i32.const 99))))
    (if (i32.eq (local.get $w) (i32.const 3))
      (then (loop $spin (br $spin))))
    (if (i32.eq (local.get $w) (i32.const 13))
      (then (return (i32.const 0) (i32.const 5))))
    (if (i32.ne (local.get $len)
                (i32.mul (i32.mul (local.get $w) (local.get $h)) (local.get $channels)))
      (then (return (i32.const 0) (i32.const 4))))
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (local.get $len)))
        (local.set $sum
          (i32.add (local.get $sum)
                   (i32.load8_u (i32.add (local.get $ptr) (local.get $i)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (local.set $out (call $alloc (i32.const 36)))
    (if (i32.eqz (local.get $out))
      (then (return (i32.const 0) (i32.const 1))))
    (memory.copy (local.get $out) (i32.const 0) (i32.const 16))
    (i32.store offset=4 (local.get $out) (i32.const 28))
    (i32.store offset=16 (local.get $out) (local.get $w))
    (i32.store offset=20 (local.get $out) (local.get $h))
    (f32.store offset=24 (local.get $out) (local.get $q))
    (i32.store offset=28 (local.get $out) (local.get $sum))
    (i32.store offset=32 (local.get $out) (local.get $channels))
    (local.get $out)
    (i32.const 36))

  (func (export "webp_encode_rgba") (param i32 i32 i32 i32 f32) (result i32 i32)
    (call $encode (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)
                  (i32.const 4)))

  ;; GRAY_EXPORT
)
"#;

const GRAY_EXPORT: &str = r#"
  (func (export "webp_encode_gray") (param i32 i32 i32 i32 f32) (result i32 i32)
    (call $encode (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)
                  (i32.const 1)))
"#;

/// Echo codec, optionally with the single-channel encoder.
pub fn echo_codec_wat(gray: bool) -> String {
    ECHO_CODEC.replace("  ;; GRAY_EXPORT\n", if gray { GRAY_EXPORT } else { "" })
}

/// A codec whose reactor entry point traps.
pub fn broken_init_wat() -> String {
    echo_codec_wat(false).replace(
        "(func (export \"_initialize\")",
        "(func (export \"_initialize\") unreachable",
    )
}

/// A codec that traps the moment anything is allocated.
pub const UNTOUCHABLE_CODEC: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "webp_alloc") (param i32) (result i32) unreachable)
  (func (export "webp_free") (param i32) unreachable)
  (func (export "webp_encode_rgba") (param i32 i32 i32 i32 f32) (result i32 i32) unreachable))
"#;

/// gzip-compress a fixture.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Compressed echo codec with the gray encoder, built once.
pub fn echo_codec() -> Vec<u8> {
    static BLOB: OnceLock<Vec<u8>> = OnceLock::new();
    BLOB.get_or_init(|| gzip(echo_codec_wat(true).as_bytes()))
        .clone()
}

/// Compressed echo codec without the gray encoder.
pub fn rgba_only_codec() -> Vec<u8> {
    gzip(echo_codec_wat(false).as_bytes())
}

/// A solid RGBA bitmap.
pub fn solid_rgba(width: u32, height: u32, value: u8) -> Bitmap<'static> {
    Bitmap::new(
        width,
        height,
        ColorModel::Rgba8,
        vec![value; (width * height * 4) as usize],
    )
}

/// Wrapping byte sum, as computed by the echo codec.
pub fn checksum(bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .fold(0i32, |sum, &b| sum.wrapping_add(i32::from(b)))
}

/// What the echo codec recorded about a call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Echo {
    pub width: u32,
    pub height: u32,
    pub quality: f32,
    pub checksum: i32,
    pub channels: u32,
}

impl Echo {
    pub fn parse(webp: &[u8]) -> Self {
        assert_eq!(webp.len(), 36, "unexpected echo output length");
        assert_eq!(&webp[0..4], b"RIFF");
        assert_eq!(&webp[4..8], &28u32.to_le_bytes());
        assert_eq!(&webp[8..12], b"WEBP");
        let word = |at: usize| <[u8; 4]>::try_from(&webp[at..at + 4]).unwrap();
        Self {
            width: u32::from_le_bytes(word(16)),
            height: u32::from_le_bytes(word(20)),
            quality: f32::from_le_bytes(word(24)),
            checksum: i32::from_le_bytes(word(28)),
            channels: u32::from_le_bytes(word(32)),
        }
    }
}
