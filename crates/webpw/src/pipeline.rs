//! The encode pipeline: validate, copy in, call, copy out, release.

use tokio_util::sync::CancellationToken;

use crate::bitmap::{Bitmap, Layout, Pixels};
use crate::error::Error;
use crate::sandbox::{Sandbox, Value};
use crate::wasm::exports;

/// Quality used when the caller does not pick one, or picks NaN.
pub const DEFAULT_QUALITY: f32 = 75.0;

/// Clamp a quality factor into `[0, 100]`.
///
/// NaN falls back to [`DEFAULT_QUALITY`]. Either adjustment is logged.
#[must_use]
pub fn clamp_quality(quality: f32) -> f32 {
    if quality.is_nan() {
        tracing::warn!(default = DEFAULT_QUALITY, "Quality is NaN, using default");
        return DEFAULT_QUALITY;
    }
    let clamped = quality.clamp(0.0, 100.0);
    if clamped != quality {
        tracing::warn!(requested = quality, clamped, "Quality out of range, clamped");
    }
    clamped
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<(), Error> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Encode `bitmap` to WebP inside `sandbox`.
///
/// The bitmap is validated before the sandbox is touched. Every buffer
/// allocated in the sandbox is released before this returns, on success
/// and on every failure path, including cancellation between steps.
///
/// # Errors
///
/// Returns [`Error::InvalidDimensions`] for unusable bitmaps,
/// [`Error::SandboxOutOfMemory`] if the input buffer cannot be allocated,
/// [`Error::Codec`] with the codec's status code if encoding fails,
/// [`Error::Cancelled`] if `cancel` fires, and whatever the sandbox
/// reports for traps and deadlines.
pub async fn encode_bitmap<S>(
    sandbox: &mut S,
    bitmap: &Bitmap<'_>,
    quality: f32,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<u8>, Error>
where
    S: Sandbox + ?Sized,
{
    bitmap.validate()?;
    let quality = clamp_quality(quality);
    check_cancelled(cancel)?;

    let gray = sandbox.has_export(exports::ENCODE_GRAY);
    let pixels = bitmap.to_layout(gray);

    let input = sandbox.allocate(pixels.data.len()).await?;
    let outcome = encode_in(sandbox, input, &pixels, quality, cancel).await;
    let released = sandbox.free(input).await;

    let data = outcome?;
    released?;
    check_cancelled(cancel)?;

    tracing::debug!(
        width = pixels.width,
        height = pixels.height,
        quality,
        gray = pixels.layout == Layout::Gray,
        output = data.len(),
        "Encoded bitmap"
    );
    Ok(data)
}

async fn encode_in<S>(
    sandbox: &mut S,
    input: u32,
    pixels: &Pixels<'_>,
    quality: f32,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<u8>, Error>
where
    S: Sandbox + ?Sized,
{
    sandbox.write_memory(input, &pixels.data)?;
    check_cancelled(cancel)?;

    let export = match pixels.layout {
        Layout::Rgba => exports::ENCODE_RGBA,
        Layout::Gray => exports::ENCODE_GRAY,
    };
    let args = [
        Value::I32(input as i32),
        Value::I32(pixels.data.len() as i32),
        Value::I32(pixels.width as i32),
        Value::I32(pixels.height as i32),
        Value::F32(quality),
    ];
    let results = sandbox.call_export(export, &args).await?;

    let (ptr, len) = match results.as_slice() {
        [Value::I32(ptr), Value::I32(len)] => (*ptr as u32, *len),
        other => {
            return Err(Error::Protocol(format!(
                "`{export}` returned {other:?}, expected (i32, i32)"
            )));
        }
    };
    if ptr == 0 {
        return Err(Error::codec(len));
    }

    let output = match usize::try_from(len) {
        Ok(len) => sandbox.read_memory(ptr, len),
        Err(_) => Err(Error::Protocol(format!(
            "`{export}` returned a negative output length {len}"
        ))),
    };
    let released = sandbox.free(ptr).await;
    let data = output?;
    released?;
    Ok(data)
}
