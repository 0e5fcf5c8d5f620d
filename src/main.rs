//! Terminal demo: capture system audio and print visualizer frames

use pulseviz::{ConfigStore, FrameCoalescer, VisualizerConfig};
use std::io::Write;
use std::sync::Arc;

const BLOCKS: [char; 9] = [' ', '\u{2581}', '\u{2582}', '\u{2583}', '\u{2584}', '\u{2585}', '\u{2586}', '\u{2587}', '\u{2588}'];

fn usage() -> ! {
    eprintln!("usage: pulseviz [--list] [--source <id>] [--bars <n>] [--json]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut source = None;
    let mut json = false;
    let mut config = VisualizerConfig::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--list" => {
                for s in pulseviz::audio::list_sources()? {
                    println!("{:<40} {}", s.id, s.name);
                }
                return Ok(());
            }
            "--source" => source = Some(args.next().unwrap_or_else(|| usage())),
            "--bars" => {
                let n = args.next().unwrap_or_else(|| usage());
                config.bar_count = n.parse().unwrap_or_else(|_| usage());
            }
            "--json" => json = true,
            _ => usage(),
        }
    }

    let stream = pulseviz::audio::start_capture(source)?;
    let store = Arc::new(ConfigStore::in_memory(config.clone()));
    let frames = FrameCoalescer::new(stream.buffer().clone(), store);

    let mut interval = tokio::time::interval(config.frame_interval());
    let stdout = std::io::stdout();

    loop {
        interval.tick().await;
        let frame = match frames.next_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                log::info!("Capture ended: {}", e);
                break;
            }
        };

        let mut out = stdout.lock();
        if json {
            serde_json::to_writer(&mut out, &*frame)?;
            writeln!(out)?;
        } else {
            let bars: String = frame
                .bars
                .iter()
                .map(|&b| BLOCKS[((b * 8.0).round() as usize).min(8)])
                .collect();
            write!(
                out,
                "\r{} {} bass {:.2} mid {:.2} treble {:.2} fade {:.2}",
                bars,
                if frame.is_beat { '*' } else { ' ' },
                frame.bass,
                frame.mid,
                frame.treble,
                frame.silence_fade,
            )?;
            out.flush()?;
        }
    }

    Ok(())
}
