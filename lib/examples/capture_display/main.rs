use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vidbuf::capture::transform::Rotation;
use vidbuf::capture::{CaptureConfig, CaptureLoop, EncoderSink};
use vidbuf::device::registry::{register_default_codecs, DeviceRegistry};
use vidbuf::encoder::{H264Encoder, SessionConfig, H264};
use vidbuf_utils::camera::SyntheticCamera;
use vidbuf_utils::display::RecordingDisplay;
use vidbuf_utils::transport::WriterTransport;

use anyhow::Context;
use clap::{App, Arg};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("vidbuf capture and display")
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("320x240")
                .help("Resolution of the synthetic camera (e.g. \"320x240\")"),
        )
        .arg(
            Arg::new("rotation")
                .long("rotation")
                .takes_value(true)
                .default_value("0")
                .possible_values(["0", "90", "180", "270"])
                .help("Clockwise rotation applied before display"),
        )
        .arg(
            Arg::new("mirror_x")
                .long("mirror_x")
                .help("Mirror the displayed frames horizontally"),
        )
        .arg(
            Arg::new("mirror_y")
                .long("mirror_y")
                .help("Mirror the displayed frames vertically"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .takes_value(true)
                .default_value("33")
                .help("Minimum time between two frames, in milliseconds"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .takes_value(true)
                .help("Stop after the given number of seconds"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .takes_value(true)
                .help("Encode the captured frames to H.264 and save them to a file"),
        )
        .get_matches();

    let (width, height) = matches
        .value_of("frame_size")
        .and_then(|s| s.split_once('x'))
        .context("Invalid frame size")?;
    let (width, height): (u32, u32) = (width.parse()?, height.parse()?);
    let rotation = Rotation::try_from(matches.value_of("rotation").unwrap_or("0").parse::<u32>()?)?;
    let interval = Duration::from_millis(matches.value_of("interval").unwrap_or("33").parse()?);

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }
    if let Some(duration) = matches.value_of("duration") {
        let duration = Duration::from_secs(duration.parse()?);
        let lets_quit_timer = lets_quit.clone();
        thread::spawn(move || {
            thread::sleep(duration);
            lets_quit_timer.store(true, Ordering::SeqCst);
        });
    }

    let display = RecordingDisplay::with_limit(1);
    let config = CaptureConfig::new()
        .update_interval(interval)
        .rotation(rotation)
        .mirror(matches.is_present("mirror_x"), matches.is_present("mirror_y"));
    let mut capture = CaptureLoop::new(config)
        .with_source(SyntheticCamera::new(width, height))
        .with_display(display.clone());

    if let Some(path) = matches.value_of("output_file") {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry)?;
        // The encoder gets the frames as displayed.
        let (enc_width, enc_height) = if rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        };
        let mut encoder =
            H264Encoder::new(H264::default(), SessionConfig::new(enc_width, enc_height));
        encoder.init(&registry).context("Failed to start H.264 encoder")?;
        let file = File::create(path).context("Invalid output file specified")?;
        capture.add_sink(EncoderSink::new(encoder, WriterTransport::new(BufWriter::new(file))));
    }

    capture.setup()?;
    capture.run(&lets_quit);

    let stats = capture.stats();
    println!(
        "Captured {} frames ({:.2} fps), {} without buffer, {} sink errors",
        stats.frames, stats.fps, stats.no_buffer, stats.sink_errors
    );
    if let Some(frame) = display.last() {
        println!(
            "Last frame shown: buffer {}, {}x{} {}",
            frame.index, frame.width, frame.height, frame.format
        );
    }

    Ok(())
}
