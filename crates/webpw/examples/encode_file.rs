//! Encode an image file to WebP with a sandboxed codec.
//!
//! Run with:
//! `cargo run --example encode_file -- <codec.wasm.gz> <input.png> <output.webp> [quality]`
//!
//! Set `RUST_LOG=webpw=debug` to see what the server is doing.

use std::time::Instant;

use image::DynamicImage;
use tracing_subscriber::EnvFilter;
use webpw::{Bitmap, EncodeOptions, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpw=info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(codec), Some(input), Some(output)) = (args.next(), args.next(), args.next()) else {
        eprintln!("usage: encode_file <codec.wasm.gz> <input> <output.webp> [quality]");
        std::process::exit(2);
    };
    let quality = match args.next() {
        Some(q) => q.parse()?,
        None => webpw::pipeline::DEFAULT_QUALITY,
    };

    let server = Server::builder()
        .with_binary(std::fs::read(&codec)?)
        .build();

    let start = Instant::now();
    server.start()?;
    println!("Codec compiled in {:?}", start.elapsed());

    // Deep and float images are narrowed to 8-bit RGBA first.
    let image = match image::open(&input)? {
        image @ (DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma8(_)) => image,
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    };
    let bitmap = Bitmap::from_image(&image)?;

    let webp = encode(&server, &bitmap, quality).await?;
    std::fs::write(&output, webp)?;
    server.close().await?;
    Ok(())
}

async fn encode(
    server: &Server,
    bitmap: &Bitmap<'_>,
    quality: f32,
) -> Result<Vec<u8>, webpw::Error> {
    let start = Instant::now();
    let encoded = server
        .encode_to_vec(bitmap, &EncodeOptions::default().with_quality(quality))
        .await?;
    println!(
        "Encoded {}x{} to {} bytes in {:?}",
        encoded.width,
        encoded.height,
        encoded.data.len(),
        start.elapsed()
    );
    Ok(encoded.data)
}
