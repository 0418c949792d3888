// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Simulating preview and render sessions on the in-memory engine
//! - Showing the active configuration
//! - Rendering and previewing media through GStreamer (`gstreamer` feature)

use chrono::Local;
use montage::backends::memory::MemoryEngine;
use montage::resources::StreamSnapshot;
use montage::stream::{AudioAttributes, Fraction, VideoAttributes};
use montage::{
    ActionerEvent, Config, ObjectFactory, Pipeline, PipelineState, Previewer, RecoveryState,
    RenderSettings, Renderer, StreamDescriptor,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "gstreamer")]
use montage::constants::format_bitrate;
#[cfg(feature = "gstreamer")]
use montage::{BitratePreset, PipelineEvent, backends::gstreamer::GstEngine};
#[cfg(feature = "gstreamer")]
use std::path::PathBuf;
#[cfg(feature = "gstreamer")]
use std::sync::atomic::{AtomicBool, Ordering};

/// Length of the simulated clip
const SIMULATED_DURATION_NS: u64 = 10 * 1_000_000_000;

/// Load `path`, or the default config file when none is given
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    })
}

/// Print where the config lives and what it contains
pub fn show_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match Config::config_path() {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (no config directory)"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

// ===== Simulation =====

#[derive(Debug, Serialize)]
struct SimulationReport {
    rendered: bool,
    final_state: PipelineState,
    recovery: RecoveryState,
    stages: Vec<Stage>,
}

#[derive(Debug, Serialize)]
struct Stage {
    label: String,
    rows: Vec<Row>,
}

#[derive(Debug, Serialize)]
struct Row {
    factory: String,
    stream: Option<String>,
    child: bool,
    bin: usize,
    tee: usize,
    queue: usize,
}

impl From<&StreamSnapshot> for Row {
    fn from(snapshot: &StreamSnapshot) -> Self {
        Self {
            factory: snapshot.factory.clone(),
            stream: snapshot.stream.as_ref().map(|s| s.to_string()),
            child: snapshot.child,
            bin: snapshot.usage.bin,
            tee: snapshot.usage.tee,
            queue: snapshot.usage.queue,
        }
    }
}

struct Recorder {
    json: bool,
    stages: Vec<Stage>,
}

impl Recorder {
    fn capture(&mut self, label: &str, pipeline: &Pipeline) {
        let snapshot = pipeline.resources().lock().snapshot();
        if !self.json {
            println!("{}:", label);
            if snapshot.is_empty() {
                println!("  (no resources)");
            }
            for row in &snapshot {
                println!("  {}", row);
            }
            println!();
        }
        self.stages.push(Stage {
            label: label.to_string(),
            rows: snapshot.iter().map(Row::from).collect(),
        });
    }
}

/// Share one test source between a preview and (optionally) a render
pub fn simulate(config: Config, render: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(run_simulation(config, render, json))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn run_simulation(
    config: Config,
    render: bool,
    json: bool,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let engine = Arc::new(MemoryEngine::new());
    let mut pipeline = Pipeline::new(engine.clone(), config);
    let mut recorder = Recorder {
        json,
        stages: Vec::new(),
    };

    let clip = Arc::new(
        ObjectFactory::test_source(
            "smpte",
            vec![
                StreamDescriptor::video(VideoAttributes::sized(1280, 720, Fraction::new(30, 1))),
                StreamDescriptor::audio(AudioAttributes::new(2, 48_000)),
            ],
        )
        .with_duration(SIMULATED_DURATION_NS),
    );

    let mut previewer = Previewer::with_default_sinks(vec![clip.clone()]);
    previewer.add_action(&mut pipeline)?;
    pipeline.dispatch_pending();
    recorder.capture("Preview attached", &pipeline);

    if render {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let output = std::env::temp_dir().join(format!("montage_{}.mkv", timestamp));
        let settings = RenderSettings {
            bitrate: pipeline.config().bitrate_preset,
            ..RenderSettings::default()
        };
        let mut renderer = Renderer::to_file(vec![clip.clone()], &output, settings);
        renderer.start_action(&mut pipeline)?;
        engine.set_duration(SIMULATED_DURATION_NS);
        pipeline.activate_position_listener(Duration::from_millis(50), false);
        recorder.capture("Render attached", &pipeline);

        let mut position = 0;
        while renderer.is_acting() {
            position = (position + SIMULATED_DURATION_NS / 4).min(SIMULATED_DURATION_NS);
            engine.set_position(position);
            if position == SIMULATED_DURATION_NS {
                engine.post_eos();
            }
            for event in pipeline.next_events().await {
                match renderer.handle_event(&mut pipeline, &event) {
                    Some(ActionerEvent::Progress { fraction, .. }) if !json => {
                        println!("Rendering: {:.0}%", fraction * 100.0);
                    }
                    Some(ActionerEvent::Eos) if !json => {
                        println!("Render finished: {}", output.display());
                        println!();
                    }
                    Some(ActionerEvent::Error { message, .. }) => return Err(message.into()),
                    Some(ActionerEvent::Died) => return Err("pipeline died".into()),
                    _ => {}
                }
            }
        }
        pipeline.deactivate_position_listener();
        recorder.capture("Render detached", &pipeline);
    }

    previewer.remove_action(&mut pipeline)?;
    pipeline.dispatch_pending();
    recorder.capture("Preview detached", &pipeline);

    let report = SimulationReport {
        rendered: render,
        final_state: pipeline.state(),
        recovery: pipeline.recovery_state(),
        stages: recorder.stages,
    };
    pipeline.release();
    Ok(report)
}

// ===== GStreamer commands =====

/// Accepts preset names case-insensitively
#[cfg(feature = "gstreamer")]
pub fn parse_bitrate(value: &str) -> Result<BitratePreset, String> {
    BitratePreset::ALL
        .into_iter()
        .find(|preset| preset.display_name().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown bitrate preset '{}' (low, medium, high)", value))
}

#[cfg(feature = "gstreamer")]
pub struct RenderOptions {
    pub output: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<BitratePreset>,
    pub audio: bool,
}

/// Default folder name for rendered videos
#[cfg(feature = "gstreamer")]
const DEFAULT_RENDER_FOLDER: &str = "Montage";

/// Width assumed for bitrate display when the output keeps the source size
#[cfg(feature = "gstreamer")]
const DEFAULT_RENDER_WIDTH: u32 = 1920;

#[cfg(feature = "gstreamer")]
fn get_default_render_dir() -> PathBuf {
    dirs::video_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_RENDER_FOLDER)
}

#[cfg(feature = "gstreamer")]
fn to_uri(input: &str) -> Result<String, Box<dyn std::error::Error>> {
    if input.contains("://") {
        return Ok(input.to_string());
    }
    let path = std::fs::canonicalize(input)?;
    Ok(format!("file://{}", path.display()))
}

#[cfg(feature = "gstreamer")]
fn source_factory(input: &str, audio: bool) -> Result<Arc<ObjectFactory>, Box<dyn std::error::Error>> {
    let mut streams = vec![StreamDescriptor::any_video()];
    if audio {
        streams.push(StreamDescriptor::any_audio());
    }
    Ok(Arc::new(ObjectFactory::uri_source(to_uri(input)?, streams)))
}

#[cfg(feature = "gstreamer")]
fn install_stop_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;
    Ok(stop_flag)
}

#[cfg(feature = "gstreamer")]
fn format_clock(ns: u64) -> String {
    let secs = ns / montage::constants::pipeline::NSECS_PER_SEC;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Render `inputs` into one file
#[cfg(feature = "gstreamer")]
pub fn render(
    config: Config,
    inputs: Vec<String>,
    options: RenderOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let output_path = if let Some(path) = options.output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        path
    } else {
        let dir = get_default_render_dir();
        std::fs::create_dir_all(&dir)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        dir.join(format!("render_{}.mkv", timestamp))
    };

    let producers = inputs
        .iter()
        .map(|input| source_factory(input, options.audio))
        .collect::<Result<Vec<_>, _>>()?;
    let settings = RenderSettings {
        bitrate: options.bitrate.unwrap_or(config.bitrate_preset),
        output_width: options.width,
        output_height: options.height,
        ..RenderSettings::default()
    };

    println!("Output: {}", output_path.display());
    let width = settings.output_width.unwrap_or(DEFAULT_RENDER_WIDTH);
    println!(
        "Bitrate: {} ({} at {}px wide)",
        settings.bitrate.display_name(),
        format_bitrate(settings.bitrate.bitrate_kbps(width)),
        width
    );
    println!();
    println!("Rendering... (press Ctrl+C to stop early)");

    let stop_flag = install_stop_handler()?;
    let engine = Arc::new(GstEngine::new()?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let interval = config.position_interval();
        let mut pipeline = Pipeline::new(engine, config);
        let mut renderer = Renderer::to_file(producers, &output_path, settings);
        renderer.start_action(&mut pipeline)?;
        pipeline.activate_position_listener(interval, false);

        let result: Result<(), Box<dyn std::error::Error>> = loop {
            if !renderer.is_acting() {
                break Ok(());
            }
            if stop_flag.load(Ordering::SeqCst) {
                println!();
                println!("Stopping early...");
                renderer.remove_action(&mut pipeline)?;
                break Ok(());
            }
            let Ok(events) =
                tokio::time::timeout(Duration::from_millis(100), pipeline.next_events()).await
            else {
                continue;
            };
            for event in events {
                match renderer.handle_event(&mut pipeline, &event) {
                    Some(ActionerEvent::Progress { fraction, eta }) => {
                        let eta = eta.map_or_else(|| "--:--".to_string(), |d| {
                            format_clock(d.as_nanos() as u64)
                        });
                        print!("\rRendering: {:5.1}% (ETA {})", fraction * 100.0, eta);
                        std::io::Write::flush(&mut std::io::stdout())?;
                    }
                    Some(ActionerEvent::Eos) => {
                        println!();
                        println!("Video saved: {}", output_path.display());
                    }
                    Some(ActionerEvent::Error { message, detail }) => {
                        println!();
                        let detail = detail.unwrap_or_default();
                        return Err(format!("render failed: {} {}", message, detail).into());
                    }
                    Some(ActionerEvent::Died) => return Err("pipeline died".into()),
                    None => {}
                }
            }
        };
        pipeline.release();
        result
    })
}

/// Play `input` until it ends, `duration` elapses or Ctrl+C
#[cfg(feature = "gstreamer")]
pub fn preview(
    config: Config,
    input: String,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let producer = source_factory(&input, true)?;
    println!("Playing: {}", producer.name());
    println!("(press Ctrl+C to stop)");

    let stop_flag = install_stop_handler()?;
    let engine = Arc::new(GstEngine::new()?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let interval = config.position_interval();
        let mut pipeline = Pipeline::new(engine, config);
        let mut previewer = Previewer::with_default_sinks(vec![producer]);
        previewer.start_action(&mut pipeline)?;
        pipeline.activate_position_listener(interval, false);

        let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        'playback: loop {
            if stop_flag.load(Ordering::SeqCst)
                || deadline.is_some_and(|d| tokio::time::Instant::now() >= d)
            {
                break;
            }
            let Ok(events) =
                tokio::time::timeout(Duration::from_millis(100), pipeline.next_events()).await
            else {
                continue;
            };
            for event in events {
                if let Some(ActionerEvent::Died) = previewer.handle_event(&mut pipeline, &event) {
                    println!();
                    return Err("pipeline died".into());
                }
                match event {
                    PipelineEvent::Position(position) => {
                        print!("\rPlaying: {}", format_clock(position));
                        std::io::Write::flush(&mut std::io::stdout())?;
                    }
                    PipelineEvent::Eos => break 'playback,
                    _ => {}
                }
            }
        }
        println!();
        previewer.remove_action(&mut pipeline)?;
        pipeline.release();
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
