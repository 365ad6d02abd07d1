use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use vidbuf::device::registry::{register_default_codecs, DeviceRegistry};
use vidbuf::encoder::{Codec, Encoder, Jpeg, SessionConfig, H264};
use vidbuf_utils::framegen::FrameGenerator;

use anyhow::{anyhow, Context};
use clap::{App, Arg};

fn encode_frames<C: Codec>(
    mut encoder: Encoder<C>,
    registry: &DeviceRegistry,
    mut stop_after: Option<usize>,
    mut output_file: Option<File>,
    lets_quit: &AtomicBool,
) -> anyhow::Result<()> {
    encoder
        .init(registry)
        .with_context(|| format!("Failed to start {} encoder", C::NAME))?;

    let config = encoder.config().clone();
    let mut frame_gen = FrameGenerator::rgb565(config.width as usize, config.height as usize);
    let mut frame = vec![0u8; frame_gen.frame_size()];

    let mut total_size = 0usize;
    let mut frame_counter = 0usize;
    let mut keyframes = 0usize;
    let start_time = Instant::now();

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(max_cpt) = &mut stop_after {
            if *max_cpt == 0 {
                break;
            }
            *max_cpt -= 1;
        }

        frame_gen.next_frame(&mut frame)?;
        let encoded = match encoder.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) if e.kind().is_recoverable() => {
                log::warn!("Skipping frame: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        total_size = total_size.wrapping_add(encoded.len());
        frame_counter += 1;
        if encoded.is_keyframe() {
            keyframes += 1;
        }
        let elapsed = start_time.elapsed();
        let fps = frame_counter as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rEncoded frame {:#5}, index: {:#2}, bytes used:{:#7} total encoded size:{:#9} fps: {:#6.2} keyframes: {}",
            encoded.sequence(),
            encoded.buffer().index(),
            encoded.len(),
            total_size,
            fps,
            keyframes,
        );
        io::stdout().flush()?;

        if let Some(ref mut output) = output_file {
            output
                .write_all(&encoded.data())
                .context("Error while writing output data")?;
        }

        encoder.release_output(encoded)?;
    }

    // Insert new line since we were overwriting the same one
    println!();
    encoder.deinit();

    Ok(())
}

fn parse_frame_size(s: &str) -> anyhow::Result<(u32, u32)> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("Invalid frame size {:?}", s))?;
    Ok((width.parse()?, height.parse()?))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("vidbuf encoder")
        .arg(
            Arg::new("codec")
                .long("codec")
                .takes_value(true)
                .default_value("jpeg")
                .possible_values(["jpeg", "h264"])
                .help("Codec to encode with"),
        )
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after encoding a given number of frames"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to encode (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .takes_value(true)
                .default_value("80")
                .help("JPEG quality, between 1 and 100"),
        )
        .arg(
            Arg::new("bitrate")
                .long("bitrate")
                .takes_value(true)
                .default_value("2000000")
                .help("H.264 target bitrate in bits per second"),
        )
        .arg(
            Arg::new("gop")
                .long("gop")
                .takes_value(true)
                .default_value("30")
                .help("H.264 keyframe interval"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .takes_value(true)
                .help("Save the encoded stream to a file"),
        )
        .get_matches();

    let stop_after = matches
        .value_of("num_frames")
        .map(str::parse::<usize>)
        .transpose()
        .context("Invalid value for stop_after")?;
    let (width, height) = parse_frame_size(matches.value_of("frame_size").unwrap_or("640x480"))?;
    let output_file = matches
        .value_of("output_file")
        .map(File::create)
        .transpose()
        .context("Invalid output file specified")?;

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let registry = DeviceRegistry::new();
    register_default_codecs(&registry)?;
    let config = SessionConfig::new(width, height);

    match matches.value_of("codec") {
        Some("h264") => {
            let bitrate = matches.value_of("bitrate").unwrap_or("2000000").parse()?;
            let gop = matches.value_of("gop").unwrap_or("30").parse()?;
            encode_frames(
                Encoder::new(H264::new(bitrate, gop), config),
                &registry,
                stop_after,
                output_file,
                &lets_quit,
            )
        }
        _ => {
            let quality = matches.value_of("quality").unwrap_or("80").parse()?;
            encode_frames(
                Encoder::new(Jpeg::new(quality), config),
                &registry,
                stop_after,
                output_file,
                &lets_quit,
            )
        }
    }
}
