use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{eyre, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use reflate::models::Models;
use reflate::partial::{SearchConfig, SearchMode};
use reflate::recovery::{recover, RecoveryConfig};
use reflate::CONFIDENCE_LEVELS;

#[derive(Clone, Copy, ValueEnum)]
enum WriteFormat {
    /// Decoded bytes with a placeholder for unknowns.
    PlainText,
    /// HTML with confidence shading.
    Html,
    /// The tagged byte stream, one record per byte.
    DecodedByte,
    /// One summary line per recovered stream.
    Listing,
}

/// Recover readable content from a damaged raw DEFLATE stream.
///
/// The input is a window of bytes believed to contain DEFLATE data with its
/// container framing already stripped (use your favorite carving tool for
/// ZIP/gzip signatures). Bit offsets allow windows that do not start on the
/// stream boundary.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// File holding the compressed window
    input_file: PathBuf,
    /// Where to write the recovered output [default: <INPUT_FILE>.rec]
    output_file: Option<PathBuf>,
    /// First bit of the window to scan
    #[arg(long, default_value_t = 0)]
    bit_start: usize,
    /// One past the last bit to scan [default: end of file]
    #[arg(long)]
    bit_end: Option<usize>,
    /// The window starts exactly at a stream boundary
    #[arg(long)]
    known_start: bool,
    /// The stream's tail is missing: decode forward from the start
    /// instead of scanning backwards from the end
    #[arg(long)]
    truncated: bool,
    /// Treat the stream as DEFLATE64
    #[arg(long)]
    deflate64: bool,
    /// Language-model file for reconstruction
    #[arg(short, long)]
    model: Option<PathBuf>,
    /// Skip statistical reconstruction of unknown bytes
    #[arg(long)]
    no_reconstruction: bool,
    /// Attempt tree reconstruction for packets with missing headers
    #[arg(long)]
    partial_packets: bool,
    /// Reconstruction passes over the recovered buffer
    #[arg(long, default_value_t = 1)]
    iterations: u32,
    /// Placeholder character for unknown bytes in plain-text output
    #[arg(long, default_value_t = '?')]
    unknown: char,
    /// Output format
    #[arg(long, value_enum, default_value_t = WriteFormat::PlainText)]
    format: WriteFormat,
    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut window = Vec::new();
    File::open(&cli.input_file)
        .wrap_err("cannot open input file")?
        .read_to_end(&mut window)
        .wrap_err("cannot read input file")?;
    let bit_end = cli.bit_end.unwrap_or(window.len() * 8);
    info!(
        "scanning {} ({} bytes, bits {}..{})",
        cli.input_file.display(),
        window.len(),
        cli.bit_start,
        bit_end
    );

    let models = match &cli.model {
        Some(path) => Some(Models::load(path).wrap_err("cannot load language model")?),
        None => None,
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    let bar_for_ticks = bar.clone();
    let config = RecoveryConfig {
        perform_reconstruction: !cli.no_reconstruction,
        reconstruct_partial_packet: cli.partial_packets,
        deflate64: cli.deflate64,
        reconstruction_iterations: cli.iterations,
        search: SearchConfig {
            mode: SearchMode::BreadthFirst,
            ..SearchConfig::default()
        },
        progress: Some(Box::new(move |expansions| {
            bar_for_ticks.set_message(format!("{}M hypotheses expanded", expansions / 1_000_000));
            bar_for_ticks.tick();
        })),
        ..RecoveryConfig::default()
    };

    let result = recover(
        &window,
        cli.bit_start,
        bit_end,
        cli.known_start,
        !cli.truncated,
        models.as_ref(),
        None,
        &config,
    )
    .map_err(|e| eyre!("recovery failed: {}", e))?;
    bar.finish_and_clear();

    for span in &result.corruption {
        debug!(
            "corrupt bytes {}..{} in packet at bit {}",
            span.start, span.end, span.packet_bit_start
        );
    }
    info!(
        "{} packets, {} bytes out, {} corrupt spans{}",
        result.packets.len(),
        result.bytes.len(),
        result.corruption.len(),
        if result.clean { ", clean" } else { "" }
    );

    let output_path = cli.output_file.clone().unwrap_or_else(|| {
        let mut p = cli.input_file.clone().into_os_string();
        p.push(".rec");
        PathBuf::from(p)
    });
    if output_path.exists() && !cli.force {
        return Err(eyre!(
            "{} exists, pass --force to overwrite",
            output_path.display()
        ));
    }
    let mut out = File::create(&output_path).wrap_err("cannot create output file")?;
    let unknown = if cli.unknown.is_ascii() {
        cli.unknown as u8
    } else {
        b'?'
    };
    match cli.format {
        WriteFormat::PlainText => {
            for b in &result.bytes {
                if b.is_discontinuity() {
                    out.write_all(b"\n[...]\n")?;
                } else if b.is_literal() {
                    out.write_all(&[b.byte_value()])?;
                } else {
                    out.write_all(&[unknown])?;
                }
            }
        }
        WriteFormat::Html => {
            write!(out, "<html><body><pre>")?;
            for b in &result.bytes {
                if b.is_discontinuity() {
                    write!(out, "<hr>")?;
                } else if b.is_literal() && !b.is_inferred() {
                    write_html_byte(&mut out, b.byte_value())?;
                } else if b.is_inferred() {
                    let shade = 9 - (b.confidence() as u32 * 9 / CONFIDENCE_LEVELS as u32);
                    write!(out, "<span class=\"c{}\">", shade)?;
                    write_html_byte(&mut out, b.byte_value())?;
                    write!(out, "</span>")?;
                } else {
                    write!(out, "<span class=\"unk\">{}</span>", unknown as char)?;
                }
            }
            write!(out, "</pre></body></html>")?;
        }
        WriteFormat::DecodedByte => {
            for b in &result.bytes {
                // tag, value, confidence, origin
                let (tag, value, conf, origin) = if b.is_discontinuity() {
                    (3u8, 0u8, 0u8, u32::MAX)
                } else if b.is_inferred() {
                    (1, b.byte_value(), b.confidence(), b.origin().unwrap_or(0))
                } else if b.is_literal() {
                    (0, b.byte_value(), b.confidence(), 0)
                } else {
                    (2, 0, 0, b.origin().unwrap_or(0))
                };
                out.write_all(&[tag, value, conf])?;
                out.write_all(&origin.to_le_bytes())?;
            }
        }
        WriteFormat::Listing => {
            let known = result.bytes.iter().filter(|b| b.is_literal()).count();
            writeln!(
                out,
                "{}\t{} bytes\t{} known\t{} corrupt spans",
                cli.input_file.display(),
                result.bytes.len(),
                known,
                result.corruption.len()
            )?;
        }
    }
    info!("wrote {}", output_path.display());
    Ok(())
}

fn write_html_byte(out: &mut File, byte: u8) -> std::io::Result<()> {
    match byte {
        b'<' => out.write_all(b"&lt;"),
        b'>' => out.write_all(b"&gt;"),
        b'&' => out.write_all(b"&amp;"),
        other => out.write_all(&[other]),
    }
}
