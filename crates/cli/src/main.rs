use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use studio_core::{
    ArrangementDoc, ClipBufferStore, ClipId, CpalInput, DecodeError, DirectBackend,
    DirectoryStore, EXPORT_SAMPLE_RATE, MixBackend, ProjectStore, Recorder, Session, SourceRef,
    StudioConfig, Track, arrangement_end, decode_source,
};

#[derive(Parser, Debug)]
#[command(name = "studio", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mix an arrangement to a 16-bit stereo WAV file.
    Render(RenderArgs),
    /// Play an arrangement on the default output device.
    Play(PlayArgs),
    /// Print the waveform summary of an audio file as JSON.
    Waveform(WaveformArgs),
    /// Record from the default input device.
    Record(RecordArgs),
    /// Manage saved projects.
    Projects(ProjectsArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Arrangement document.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output WAV path.
    #[arg(long)]
    out: PathBuf,

    /// Length in seconds; defaults to the end of the last clip.
    #[arg(long)]
    duration: Option<f64>,
}

#[derive(Parser, Debug)]
struct PlayArgs {
    /// Arrangement document.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Start position in seconds.
    #[arg(long, default_value_t = 0.0)]
    from: f64,

    /// Loop between these two positions, in seconds.
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    loop_range: Option<Vec<f64>>,
}

#[derive(Parser, Debug)]
struct WaveformArgs {
    file: PathBuf,

    #[arg(long)]
    buckets: Option<usize>,
}

#[derive(Parser, Debug)]
struct RecordArgs {
    /// Output WAV path.
    #[arg(long)]
    out: PathBuf,

    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
}

#[derive(Parser, Debug)]
struct ProjectsArgs {
    /// Project directory; defaults to the user data directory.
    #[arg(long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: ProjectsCommand,
}

#[derive(Subcommand, Debug)]
enum ProjectsCommand {
    /// List saved projects, newest first.
    List {
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete a saved project.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = StudioConfig::load();
    match cli.cmd {
        Command::Render(args) => cmd_render(args, config).await,
        Command::Play(args) => cmd_play(args, config).await,
        Command::Waveform(args) => cmd_waveform(args, config),
        Command::Record(args) => cmd_record(args, config).await,
        Command::Projects(args) => cmd_projects(args).await,
    }
}

fn load_tracks(path: &Path) -> anyhow::Result<Vec<Track>> {
    let doc = ArrangementDoc::load(path)
        .with_context(|| format!("read arrangement '{}'", path.display()))?;
    log::info!("loaded '{}' with {} track(s)", doc.name, doc.tracks.len());
    Ok(doc.into_tracks())
}

fn report_failures<B: MixBackend>(session: &Session<B>, failures: &[(ClipId, DecodeError)]) {
    for (clip, err) in failures {
        let name = session
            .tracks()
            .iter()
            .flat_map(Track::clips)
            .find(|c| c.id == *clip)
            .map_or("?", |c| c.name.as_str());
        eprintln!("skipping clip '{name}': {err}");
    }
}

async fn cmd_render(args: RenderArgs, config: StudioConfig) -> anyhow::Result<()> {
    let tracks = load_tracks(&args.in_path)?;
    let session = Session::with_backend(DirectBackend::new(EXPORT_SAMPLE_RATE), tracks, config);

    let failures = session.preload().await;
    report_failures(&session, &failures);

    if let Some(parent) = args.out.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    session
        .render_to_file(&args.out, args.duration)
        .await
        .with_context(|| format!("render '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

async fn cmd_play(args: PlayArgs, config: StudioConfig) -> anyhow::Result<()> {
    let tracks = load_tracks(&args.in_path)?;
    let refresh = config.display_refresh();
    let mut session = Session::new(tracks, config)?;
    session.attach_runtime(tokio::runtime::Handle::current());

    let failures = session.preload().await;
    report_failures(&session, &failures);

    let looping = match args.loop_range.as_deref() {
        Some(&[start, end]) => {
            session.set_loop(start, end)?;
            session.set_loop_enabled(true);
            true
        }
        _ => false,
    };

    let end = arrangement_end(session.tracks());
    let mut frames = session.subscribe_display();
    session.play(args.from);

    let mut ticker = tokio::time::interval(refresh.max(Duration::from_millis(10)));
    loop {
        ticker.tick().await;
        let position = session.poll();
        if frames.has_changed().unwrap_or(false) {
            let frame = frames.borrow_and_update();
            let peak = frame.spectrum.iter().copied().max().unwrap_or(0);
            log::trace!("{:8.3}s peak bin {peak}", frame.position);
        }
        if !looping && position >= end {
            break;
        }
    }

    session.stop();
    eprintln!("stopped at {:.3}s", session.position());
    Ok(())
}

fn cmd_waveform(args: WaveformArgs, config: StudioConfig) -> anyhow::Result<()> {
    let audio = decode_source(&SourceRef::file(&args.file))
        .with_context(|| format!("decode '{}'", args.file.display()))?;
    let summary = ClipBufferStore::summarize(&audio, args.buckets.unwrap_or(config.waveform_buckets));

    let out = serde_json::json!({
        "sample_rate": audio.sample_rate(),
        "channels": audio.channels(),
        "duration": audio.duration_secs(),
        "frames_per_bucket": summary.frames_per_bucket,
        "buckets": summary.buckets,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_record(args: RecordArgs, config: StudioConfig) -> anyhow::Result<()> {
    let mut recorder = Recorder::new(CpalInput, config.capture_buffer_secs);
    recorder.start_capture()?;
    eprintln!("recording for {:.1}s", args.seconds);

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        recorder.poll();
    }

    let blob = recorder.stop_capture()?;
    if blob.is_empty() {
        anyhow::bail!("no audio was captured");
    }
    tokio::fs::write(&args.out, &blob.bytes)
        .await
        .with_context(|| format!("write '{}'", args.out.display()))?;
    eprintln!("wrote {} ({} bytes, {})", args.out.display(), blob.bytes.len(), blob.mime);
    Ok(())
}

fn default_project_dir() -> anyhow::Result<PathBuf> {
    let data = dirs::data_dir().context("no user data directory")?;
    Ok(data.join("studio").join("projects"))
}

async fn cmd_projects(args: ProjectsArgs) -> anyhow::Result<()> {
    let dir = match args.dir {
        Some(dir) => dir,
        None => default_project_dir()?,
    };
    let store = DirectoryStore::new(dir);

    match args.cmd {
        ProjectsCommand::List { id } => {
            for project in store.list(id.as_deref()).await? {
                let modified = project
                    .last_modified
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs());
                println!("{}\t{}\t{}", project.id, project.name, modified);
            }
        }
        ProjectsCommand::Delete { id } => {
            if store.delete(&id).await? {
                eprintln!("deleted {id}");
            } else {
                eprintln!("no project named {id}");
            }
        }
    }
    Ok(())
}
