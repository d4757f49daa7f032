use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use aruco_tracker::calib::{self, Calibration};
use aruco_tracker::config::{CameraBackend, TrackerConfig, VideoSource};
use aruco_tracker::detect::{DetectorParams, MarkerDetector, SquareDetector};
use aruco_tracker::dictionary::{Dictionary, DictionaryName};
use aruco_tracker::pose::PoseEstimator;
use aruco_tracker::{io, render, Frame, Pose, TrackedFrame, Tracker};

#[derive(Parser, Debug)]
#[command(
    name = "tracker",
    version,
    about = "ArUco marker tracker",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track markers from a camera or a list of image files
    Track {
        /// Tracker configuration (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Device spec: index like 0, a path, or "none"
        #[arg(long)]
        device: Option<String>,
        /// Use the synthetic camera
        #[arg(long, action = ArgAction::SetTrue)]
        mock: bool,
        /// Frames to pull from the device
        #[arg(long, default_value_t = 10)]
        frames: u64,
        /// Dictionary name, e.g. DICT_4X4_50
        #[arg(long)]
        dictionary: Option<String>,
        /// Marker edge length in millimetres
        #[arg(long)]
        marker_size: Option<f64>,
        /// Calibration file (text or YAML)
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Write the annotated last frame here
        #[arg(long)]
        debug_out: Option<PathBuf>,
        /// Print one JSON object per frame
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        /// Image files; implies an external video source
        images: Vec<PathBuf>,
    },
    /// Detect markers in a single image and print corners and poses
    Detect {
        image: PathBuf,
        #[arg(long, default_value = "DICT_4X4_50")]
        dictionary: String,
        #[arg(long, default_value_t = 50.0)]
        marker_size: f64,
        #[arg(long)]
        calibration: Option<PathBuf>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Print a calibration file
    CalibShow {
        path: PathBuf,
        /// Also write it as YAML
        #[arg(long)]
        yaml_out: Option<PathBuf>,
    },
    /// Write a marker image
    RenderMarker {
        id: u32,
        #[arg(long, default_value = "DICT_4X4_50")]
        dictionary: String,
        /// Pixels per cell
        #[arg(long, default_value_t = 20)]
        cell_px: u32,
        /// Output image (.png or .pgm)
        #[arg(long)]
        out: PathBuf,
    },
    /// List recognised dictionary names
    Dictionaries,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Track {
            config,
            device,
            mock,
            frames,
            dictionary,
            marker_size,
            calibration,
            debug_out,
            json,
            images,
        } => {
            let mut cfg = match config {
                Some(path) => TrackerConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => TrackerConfig::default(),
            };
            if let Some(d) = device {
                cfg.video_source = parse_device(&d);
            }
            if mock {
                cfg.backend = CameraBackend::Mock;
            }
            if let Some(d) = dictionary {
                cfg.aruco_dictionary = d;
            }
            if let Some(s) = marker_size {
                cfg.marker_size = s;
            }
            if let Some(c) = calibration {
                cfg.camera_projection = None;
                cfg.camera_distortion = None;
                cfg.calibration = Some(c);
            }
            if debug_out.is_some() {
                cfg.debug = true;
            }
            if !images.is_empty() {
                cfg.video_source = VideoSource::none();
            }
            track(cfg, frames, &images, debug_out.as_deref(), json)
        }
        Commands::Detect {
            image,
            dictionary,
            marker_size,
            calibration,
            json,
        } => detect(&image, &dictionary, marker_size, calibration.as_deref(), json),
        Commands::CalibShow { path, yaml_out } => calib_show(&path, yaml_out.as_deref()),
        Commands::RenderMarker {
            id,
            dictionary,
            cell_px,
            out,
        } => render_marker(id, &dictionary, cell_px, &out),
        Commands::Dictionaries => {
            for name in DictionaryName::ALL {
                let note = if name.is_builtin() { "" } else { "\t(opencv)" };
                println!("{name}{note}");
            }
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_device(spec: &str) -> VideoSource {
    match spec.trim().parse::<i32>() {
        Ok(idx) => VideoSource::Index(idx),
        Err(_) => VideoSource::Spec(spec.trim().to_string()),
    }
}

fn track(
    cfg: TrackerConfig,
    frames: u64,
    images: &[PathBuf],
    debug_out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let mut tracker = Tracker::new(cfg).context("opening tracker")?;
    tracker.start_tracking()?;

    if images.is_empty() {
        for _ in 0..frames {
            let out = tracker.get_frame(None).context("reading frame")?;
            print_frame(&out, json)?;
        }
    } else {
        for path in images {
            let frame =
                io::read_image(path).with_context(|| format!("reading {}", path.display()))?;
            match tracker.get_frame(Some(frame)) {
                Ok(out) => print_frame(&out, json)?,
                Err(e) => warn!(image = %path.display(), error = %e, "frame skipped"),
            }
        }
    }

    if let (Some(path), Some(frame)) = (debug_out, tracker.last_debug_frame()) {
        io::write_image(path, frame).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "debug frame written");
    }
    tracker.stop_tracking()?;
    info!(frames = tracker.frame_count(), "done");
    tracker.close()?;
    Ok(())
}

fn print_frame(out: &TrackedFrame, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(out)?);
        return Ok(());
    }
    for (i, (id, pose)) in out.markers().enumerate() {
        println!("frame={} id={} {}", out.frame_numbers[i], id, describe(pose));
    }
    Ok(())
}

fn describe(pose: &Pose) -> String {
    let [x, y, z] = pose.position();
    match pose.euler_xyz() {
        Some([roll, pitch, yaw]) => format!(
            "t=({x:.1}, {y:.1}, {z:.1}) rpy=({:.1}, {:.1}, {:.1})",
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        ),
        None => format!("screen=({x:.1}, {y:.1}) size={:.1}", -z),
    }
}

fn detect(
    image: &Path,
    dictionary: &str,
    marker_size: f64,
    calibration: Option<&Path>,
    json: bool,
) -> Result<()> {
    let name: DictionaryName = dictionary.parse()?;
    let dict = Dictionary::builtin(name)?;
    let calib: Option<Calibration> = calibration
        .map(|p| calib::load_any(p).with_context(|| format!("loading {}", p.display())))
        .transpose()?;
    let frame = io::read_image(image).with_context(|| format!("reading {}", image.display()))?;

    let mut detector = SquareDetector::new(dict, DetectorParams::default());
    let markers = detector.detect(&frame)?;
    let poses = PoseEstimator::new(marker_size).estimate_each(&markers, calib.as_ref())?;

    if json {
        let rows: Vec<_> = markers
            .iter()
            .zip(&poses)
            .map(|(m, p)| match p {
                Ok(p) => serde_json::json!({ "marker": m, "pose": p }),
                Err(e) => serde_json::json!({ "marker": m, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if markers.is_empty() {
        println!("no markers found");
    }
    for (m, p) in markers.iter().zip(&poses) {
        let corners: Vec<String> = m
            .corners
            .iter()
            .map(|c| format!("({:.1}, {:.1})", c[0], c[1]))
            .collect();
        let pose = match p {
            Ok(p) => describe(p),
            Err(e) => format!("pose failed: {e}"),
        };
        println!("id={} corners=[{}] {}", m.id, corners.join(" "), pose);
    }
    Ok(())
}

fn calib_show(path: &Path, yaml_out: Option<&Path>) -> Result<()> {
    let c = calib::load_any(path).with_context(|| format!("loading {}", path.display()))?;
    for row in &c.projection_matrix {
        println!("{:>12.4} {:>12.4} {:>12.4}", row[0], row[1], row[2]);
    }
    let d: Vec<String> = c.distortion.iter().map(|v| format!("{v:.6}")).collect();
    println!("distortion: {}", d.join(" "));
    if let Some(out) = yaml_out {
        calib::write_yaml(&c, out)?;
        println!("wrote {}", out.display());
    }
    Ok(())
}

fn render_marker(id: u32, dictionary: &str, cell_px: u32, out: &Path) -> Result<()> {
    let name: DictionaryName = dictionary.parse()?;
    let dict = Dictionary::builtin(name)?;
    let img = render::marker_image(&dict, id, cell_px)?;
    io::write_image(out, &Frame::from_gray(img))
        .with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} ({name} id {id})", out.display());
    Ok(())
}
